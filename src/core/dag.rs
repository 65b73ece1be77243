//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! The graph owns every task of a run. Nodes are tasks and an edge `a -> b`
//! means `b` declared `a` as a dependency. Readiness is decided from each
//! task's declared dependency list, so a dependency on an id that is not in
//! the graph simply never becomes satisfied; the scheduler surfaces that as
//! a deadlock.

use crate::core::task::{FailureReason, SettleOutcome, Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Graph handle shared between the scheduler and task executions.
///
/// Every read-modify-write happens under a single write guard.
pub type SharedDag = Arc<RwLock<TaskDAG>>;

/// The task dependency graph.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from planner output, validating ids and acyclicity.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task)?;
        }
        Ok(dag)
    }

    /// Wrap the graph for sharing across concurrent task executions.
    pub fn into_shared(self) -> SharedDag {
        Arc::new(RwLock::new(self))
    }

    /// Add a task to the DAG.
    ///
    /// Edges are wired both to already-present dependencies and to
    /// already-present tasks that named this id as a dependency.
    ///
    /// # Errors
    /// Returns [`Error::CycleOrDuplicate`] if the id is already present or
    /// the new edges would close a cycle. The graph is left unchanged.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::CycleOrDuplicate { id: task.id });
        }

        let id = task.id.clone();
        let deps = task.dependencies.clone();
        let index = self.graph.add_node(task);

        for dep in &deps {
            if let Some(&dep_index) = self.task_index.get(dep) {
                self.graph.update_edge(dep_index, index, ());
            }
        }
        let waiting: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&other| other != index && self.graph[other].dependencies.contains(&id))
            .collect();
        for other in waiting {
            self.graph.update_edge(index, other, ());
        }

        if deps.contains(&id) || is_cyclic_directed(&self.graph) {
            // The new node holds the highest index, so removing it leaves
            // every other NodeIndex untouched.
            self.graph.remove_node(index);
            return Err(Error::CycleOrDuplicate { id });
        }

        self.task_index.insert(id, index);
        Ok(index)
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.task_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges between known tasks.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(move |i| &self.graph[i])
    }

    /// Number of settled tasks.
    pub fn settled_count(&self) -> usize {
        self.tasks().filter(|t| t.is_settled()).count()
    }

    // ========== Scheduling Operations ==========

    /// Pending tasks whose dependencies have all settled, in insertion order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = &self.graph[index];
                if !task.is_pending() {
                    return None;
                }
                let deps_settled = task.dependencies.iter().all(|dep| {
                    self.get_task(dep)
                        .map(|dep_task| dep_task.is_settled())
                        .unwrap_or(false)
                });
                deps_settled.then(|| task.id.clone())
            })
            .collect()
    }

    /// Mark a task as dispatched.
    pub fn start_task(&mut self, id: &TaskId) -> Result<()> {
        let task = self
            .get_task_mut(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;
        task.start();
        Ok(())
    }

    /// Settle a task and apply failure propagation.
    ///
    /// A failure cascades to every unsettled transitive dependent as
    /// [`FailureReason::DependencyFailed`] naming `id`. Skips and
    /// cancellations do not cascade. Settling an already-settled task is a
    /// no-op.
    ///
    /// Returns the ids of tasks failed by the cascade.
    pub fn settle(&mut self, id: &TaskId, outcome: SettleOutcome) -> Result<Vec<TaskId>> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;

        let cascades = matches!(
            outcome,
            SettleOutcome::Failed(ref reason) if *reason != FailureReason::Cancelled
        );
        if !self.graph[index].settle(outcome) || !cascades {
            return Ok(Vec::new());
        }

        let mut cascaded = Vec::new();
        let mut dfs = Dfs::new(&self.graph, index);
        while let Some(next) = dfs.next(&self.graph) {
            if next == index {
                continue;
            }
            let dependent = &mut self.graph[next];
            let reason = FailureReason::DependencyFailed {
                dependency: id.clone(),
            };
            if dependent.settle(SettleOutcome::Failed(reason)) {
                cascaded.push(dependent.id.clone());
            }
        }
        Ok(cascaded)
    }

    /// True when every task has settled.
    pub fn is_complete(&self) -> bool {
        self.tasks().all(|t| t.is_settled())
    }

    /// True when nothing is ready, nothing is running, and work remains.
    pub fn has_deadlock(&self, in_flight: usize) -> bool {
        in_flight == 0 && !self.is_complete() && self.ready_tasks().is_empty()
    }

    /// Every task `id` depends on, directly or transitively.
    ///
    /// Walks declared dependency lists, so unknown ids are included once.
    pub fn transitive_predecessors(&self, id: &TaskId) -> Vec<TaskId> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<TaskId> = self
            .get_task(id)
            .map(|t| t.dependencies.clone())
            .unwrap_or_default();
        while let Some(dep) = stack.pop() {
            if !visited.insert(dep.clone()) {
                continue;
            }
            if let Some(task) = self.get_task(&dep) {
                stack.extend(task.dependencies.iter().cloned());
            }
            result.push(dep);
        }
        result
    }

    /// Returns `base` if unused, otherwise `base-2`, `base-3`, ...
    pub fn unique_id(&self, base: &str) -> TaskId {
        let candidate = TaskId::from(base);
        if !self.contains_task(&candidate) {
            return candidate;
        }
        (2..)
            .map(|n| TaskId::from(format!("{}-{}", base, n)))
            .find(|id| !self.contains_task(id))
            .unwrap_or(candidate)
    }

    /// Get tasks in topological order (respecting dependencies).
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph[cycle.node_id()].id.clone();
            Error::CycleOrDuplicate { id }
        })?;
        Ok(sorted.into_iter().map(|index| &self.graph[index]).collect())
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
