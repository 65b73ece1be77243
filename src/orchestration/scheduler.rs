//! Scheduler for parallel task execution.
//!
//! The scheduler drives a run: it asks the DAG for ready tasks, takes a
//! budget reservation for each, and hands them to the [`TaskExecutor`] on a
//! `JoinSet` bounded by `max_concurrent`. Every time a task settles the
//! ready set is re-derived and free slots are refilled at once, so a slot
//! never waits for siblings launched alongside it.
//!
//! The run ends when the DAG is complete, or with an error on deadlock or
//! cancellation. Cancellation stops new dispatch; in-flight tasks are
//! drained before returning.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

use crate::budget::{BudgetSnapshot, Reservation};
use crate::commit::CommitRecord;
use crate::config::{Config, DEFAULT_MAX_CONCURRENT};
use crate::core::dag::{SharedDag, TaskDAG};
use crate::core::task::{
    FailureReason, SettleOutcome, Task, TaskId, TaskStatus, Worker, WorkerStatus,
};
use crate::util::cap_words;
use crate::workspace::StateSnapshot;
use crate::{Error, Result};

use super::events::RunEvent;
use super::executor::{Job, TaskExecutor, TaskReport, SUMMARY_WORD_LIMIT};
use super::gate::GateId;

pub const MIDPOINT_QUESTION: &str =
    "I've made some progress. Want to take a look before I continue?";

/// What a finished run hands back.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Commits in commit order.
    pub commits: Vec<CommitRecord>,
    /// Final summary of every done task.
    pub summaries: BTreeMap<TaskId, String>,
    /// Every task in insertion order, revision tasks included.
    pub tasks: Vec<Task>,
    pub budget: BudgetSnapshot,
}

impl RunResult {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id.as_str() == id)
    }

    /// "Completed X/Y tasks." plus a failure count when any failed.
    pub fn summary_line(&self) -> String {
        let done = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Done))
            .count();
        let failed = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }))
            .count();
        let mut line = format!("Completed {}/{} tasks.", done, self.tasks.len());
        if failed > 0 {
            line.push_str(&format!(" {} task(s) failed.", failed));
        }
        line
    }
}

/// Revision task appended when a gate is rejected.
///
/// It depends on `original`, so it becomes ready once `original` settles.
pub fn revision_task(dag: &TaskDAG, original: &Task, feedback: &str) -> Task {
    let id = dag.unique_id(&format!("task-revision-{}", original.id));
    let mut task = Task::new(
        id,
        &format!("Revise: {}", original.display_name()),
        &format!("Revise based on feedback: {}", feedback),
    )
    .with_dependencies([original.id.clone()])
    .with_worker(&original.worker);
    task.acceptance_criteria = vec![format!("Address feedback: {}", feedback)];
    task
}

type Joined = std::result::Result<(tokio::task::Id, TaskReport), JoinError>;

/// Drives one run over a DAG.
pub struct Scheduler {
    dag: SharedDag,
    workers: BTreeMap<String, Worker>,
    executor: Arc<TaskExecutor>,
    max_concurrent: usize,
    midpoint_gate: bool,
    midpoint_fired: bool,
    summaries: BTreeMap<TaskId, String>,
    last_done: Option<TaskId>,
    running: HashMap<tokio::task::Id, TaskId>,
}

impl Scheduler {
    pub fn new(dag: SharedDag, workers: Vec<Worker>, executor: TaskExecutor) -> Self {
        Self {
            dag,
            workers: workers.into_iter().map(|w| (w.name.clone(), w)).collect(),
            executor: Arc::new(executor),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            midpoint_gate: false,
            midpoint_fired: false,
            summaries: BTreeMap::new(),
            last_done: None,
            running: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.max_concurrent = config.max_concurrent.max(1);
        self.midpoint_gate = config.midpoint_gate;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_midpoint_gate(mut self, enabled: bool) -> Self {
        self.midpoint_gate = enabled;
        self
    }

    pub fn dag(&self) -> &SharedDag {
        &self.dag
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Number of tasks currently executing.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Run until every task has settled.
    ///
    /// # Errors
    /// [`Error::Deadlock`] when pending tasks can never become ready, and
    /// [`Error::Cancelled`] when the run's cancellation token fires. Task
    /// failures are reported through events and the result, never here.
    pub async fn run(&mut self) -> Result<RunResult> {
        let cancel = self.executor.cancel_token().clone();
        {
            let dag = self.dag.read().await;
            tracing::info!(
                run_id = %self.executor.run_id(),
                tasks = dag.task_count(),
                max_concurrent = self.max_concurrent,
                "run started"
            );
        }

        if cancel.is_cancelled() {
            tracing::error!("cancelled before any task started");
            self.cancel_pending().await;
            self.emit(RunEvent::fatal("Run cancelled before any task started"));
            return Err(Error::Cancelled);
        }

        let mut join_set: JoinSet<TaskReport> = JoinSet::new();
        let mut cancelled = false;
        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.fill(&mut join_set).await?;

            if join_set.is_empty() {
                let dag = self.dag.read().await;
                if dag.is_complete() {
                    break;
                }
                if dag.has_deadlock(0) {
                    let pending = dag.task_count() - dag.settled_count();
                    drop(dag);
                    let err = Error::Deadlock { pending };
                    tracing::error!(pending, "deadlock: no task can become ready");
                    self.emit(RunEvent::fatal(err.to_string()));
                    return Err(err);
                }
                // Ready work remains but nothing was dispatched: cancelled
                // during the fill.
                continue;
            }

            if let Some(joined) = join_set.join_next_with_id().await {
                self.handle_joined(joined).await;
                self.maybe_midpoint_gate().await;
            }
        }

        if cancelled {
            tracing::info!(in_flight = join_set.len(), "cancelled, draining in-flight tasks");
            while let Some(joined) = join_set.join_next_with_id().await {
                self.handle_joined(joined).await;
            }
            self.cancel_pending().await;
            self.persist_state().await;
            self.emit(RunEvent::fatal(Error::Cancelled.to_string()));
            return Err(Error::Cancelled);
        }

        for worker in self.workers.values_mut() {
            worker.status = WorkerStatus::Done;
        }
        self.persist_state().await;

        let result = self.result().await;
        let summary = result.summary_line();
        tracing::info!(%summary, "run complete");
        self.emit(RunEvent::SessionComplete { summary });
        Ok(result)
    }

    fn emit(&self, event: RunEvent) {
        self.executor.events().emit(event);
    }

    /// Dispatch ready tasks until every slot is taken or nothing is ready.
    async fn fill(&mut self, join_set: &mut JoinSet<TaskReport>) -> Result<()> {
        let cancel = self.executor.cancel_token().clone();
        while join_set.len() < self.max_concurrent && !cancel.is_cancelled() {
            let next = self.dag.read().await.ready_tasks().into_iter().next();
            let Some(task_id) = next else {
                break;
            };

            let Some(reservation) = self.executor.reserve() else {
                tracing::info!(task_id = %task_id, "budget exceeded, skipping");
                self.apply_report(TaskReport::budget_skipped(task_id)).await;
                continue;
            };

            let job = self.prepare(&task_id, reservation).await?;
            let executor = Arc::clone(&self.executor);
            let handle = join_set.spawn(async move { executor.execute(job).await });
            self.running.insert(handle.id(), task_id);
            tracing::debug!(in_flight = join_set.len(), "dispatched");
        }
        Ok(())
    }

    /// Mark a task started and assemble its job.
    async fn prepare(&mut self, task_id: &TaskId, reservation: Reservation) -> Result<Job> {
        let (task, predecessor_ids) = {
            let mut dag = self.dag.write().await;
            dag.start_task(task_id)?;
            let task = dag
                .get_task(task_id)
                .cloned()
                .ok_or_else(|| Error::UnknownTask(task_id.clone()))?;
            (task, dag.transitive_predecessors(task_id))
        };

        let predecessors = predecessor_ids
            .iter()
            .filter_map(|id| self.summaries.get(id))
            .map(|summary| cap_words(summary, SUMMARY_WORD_LIMIT))
            .collect();

        let worker = self
            .workers
            .entry(task.worker.clone())
            .or_insert_with(|| Worker::fallback(&task.worker));
        worker.status = WorkerStatus::Working;
        let worker = worker.clone();

        tracing::info!(task_id = %task.id, worker = %worker.name, "task started");
        self.emit(RunEvent::TaskStarted {
            task_id: task.id.clone(),
            worker: worker.name.clone(),
        });

        Ok(Job {
            task,
            worker,
            predecessors,
            reservation,
        })
    }

    async fn handle_joined(&mut self, joined: Joined) {
        match joined {
            Ok((id, report)) => {
                self.running.remove(&id);
                self.apply_report(report).await;
            }
            Err(e) => {
                let Some(task_id) = self.running.remove(&e.id()) else {
                    tracing::error!(error = %e, "untracked task execution ended abnormally");
                    return;
                };
                tracing::error!(task_id = %task_id, error = %e, "task execution panicked");
                let reason = FailureReason::AgentExecutionFailed {
                    error: e.to_string(),
                };
                self.apply_report(TaskReport::failed(task_id, reason, 0)).await;
            }
        }
    }

    /// Settle a task in the DAG and emit the matching events.
    async fn apply_report(&mut self, report: TaskReport) {
        let TaskReport {
            task_id,
            outcome,
            retry_count,
            summary,
            revision_feedback,
        } = report;

        let (cascaded, worker) = {
            let mut dag = self.dag.write().await;
            let worker = match dag.get_task_mut(&task_id) {
                Some(task) => {
                    task.retry_count = retry_count;
                    task.worker.clone()
                }
                None => {
                    tracing::error!(task_id = %task_id, "report for unknown task");
                    return;
                }
            };
            match dag.settle(&task_id, outcome.clone()) {
                Ok(cascaded) => (cascaded, worker),
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "settle failed");
                    return;
                }
            }
        };

        match outcome {
            SettleOutcome::Done => {
                let summary = summary.unwrap_or_default();
                tracing::info!(task_id = %task_id, attempts = retry_count, "task done");
                self.set_worker_status(&worker, WorkerStatus::Idle);
                self.summaries.insert(task_id.clone(), summary.clone());
                self.last_done = Some(task_id.clone());
                self.emit(RunEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    summary,
                });
                let workspace = self.executor.workspace();
                if let Err(e) = workspace.write_project_context(&self.summaries).await {
                    tracing::warn!(error = %e, "could not write project context");
                }
            }
            SettleOutcome::Failed(reason) => {
                tracing::warn!(task_id = %task_id, %reason, attempts = retry_count, "task failed");
                self.set_worker_status(&worker, WorkerStatus::Error);
                self.emit(RunEvent::TaskFailed {
                    task_id: task_id.clone(),
                    reason,
                    retry_count,
                });
            }
            SettleOutcome::Skipped(reason) => {
                tracing::info!(task_id = %task_id, %reason, "task skipped");
                self.emit(RunEvent::TaskSkipped {
                    task_id: task_id.clone(),
                    reason,
                    retry_count,
                });
            }
        }

        for dependent in cascaded {
            tracing::info!(task_id = %dependent, dependency = %task_id, "dependency failed");
            self.emit(RunEvent::TaskFailed {
                task_id: dependent,
                reason: FailureReason::DependencyFailed {
                    dependency: task_id.clone(),
                },
                retry_count: 0,
            });
        }

        if let Some(feedback) = revision_feedback {
            self.append_revision(&task_id, &feedback).await;
        }
        self.persist_state().await;
    }

    fn set_worker_status(&mut self, worker: &str, status: WorkerStatus) {
        if let Some(worker) = self.workers.get_mut(worker) {
            worker.status = status;
        }
    }

    async fn append_revision(&mut self, original: &TaskId, feedback: &str) {
        let mut dag = self.dag.write().await;
        let Some(task) = dag.get_task(original) else {
            return;
        };
        let revision = revision_task(&dag, task, feedback);
        let revision_id = revision.id.clone();
        match dag.add_task(revision) {
            Ok(_) => tracing::info!(task_id = %revision_id, %original, "revision task appended"),
            Err(e) => tracing::warn!(error = %e, "could not append revision task"),
        }
    }

    /// Pause dispatch once about half of the tasks have settled.
    async fn maybe_midpoint_gate(&mut self) {
        if !self.midpoint_gate || self.midpoint_fired {
            return;
        }
        let (settled, total, context) = {
            let dag = self.dag.read().await;
            let context = self
                .last_done
                .as_ref()
                .and_then(|id| dag.get_task(id))
                .map(|t| format!("Just completed: {}", t.display_name()))
                .unwrap_or_default();
            (dag.settled_count(), dag.task_count(), context)
        };
        let half = total / 2;
        if half == 0 || settled < half {
            return;
        }
        self.midpoint_fired = true;

        let gates = Arc::clone(self.executor.gates());
        let cancel = self.executor.cancel_token().clone();
        let gate_id = GateId::midpoint(self.executor.run_id());
        let decision = gates.open(gate_id.clone());
        tracing::info!(settled, total, "midpoint gate raised");
        self.emit(RunEvent::MidpointGate {
            gate_id: gate_id.clone(),
            question: MIDPOINT_QUESTION.to_string(),
            context,
        });

        let decision = tokio::select! {
            decision = decision => decision.ok(),
            _ = cancel.cancelled() => {
                gates.close(&gate_id);
                None
            }
        };
        let Some(decision) = decision else {
            return;
        };
        if decision.approved {
            return;
        }
        match self.last_done.clone() {
            Some(last) => self.append_revision(&last, decision.feedback_text()).await,
            None => tracing::warn!("midpoint rejected with no completed task to revise"),
        }
    }

    /// Settle everything still pending as cancelled.
    async fn cancel_pending(&mut self) {
        let pending: Vec<TaskId> = {
            let mut dag = self.dag.write().await;
            let ids: Vec<TaskId> = dag
                .tasks()
                .filter(|t| t.is_pending())
                .map(|t| t.id.clone())
                .collect();
            for id in &ids {
                if let Some(task) = dag.get_task_mut(id) {
                    task.settle(SettleOutcome::Failed(FailureReason::Cancelled));
                }
            }
            ids
        };
        for task_id in pending {
            self.emit(RunEvent::TaskFailed {
                task_id,
                reason: FailureReason::Cancelled,
                retry_count: 0,
            });
        }
    }

    async fn persist_state(&self) {
        let snapshot = {
            let dag = self.dag.read().await;
            StateSnapshot::build(dag.tasks(), self.workers.values())
        };
        if let Err(e) = self
            .executor
            .workspace()
            .write_state_snapshot(&snapshot)
            .await
        {
            tracing::warn!(error = %e, "could not write state snapshot");
        }
    }

    async fn result(&self) -> RunResult {
        let commits = match self.executor.commits() {
            Some(commits) => commits.commits().await,
            None => Vec::new(),
        };
        let tasks = self.dag.read().await.tasks().cloned().collect();
        RunResult {
            commits,
            summaries: self.summaries.clone(),
            tasks,
            budget: self.executor.budget().snapshot(),
        }
    }
}
