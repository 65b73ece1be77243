//! Plan files: the tasks, workers and workflow options handed to a run.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::core::dag::TaskDAG;
use crate::core::task::{Task, Worker};
use crate::{Error, Result};

/// Workflow options declared by the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    /// Named checkpoints; any entry enables the midpoint gate.
    #[serde(default)]
    pub human_gates: Vec<serde_json::Value>,
}

/// Where a skill's instructions are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillCategory {
    /// Worker-level instructions, added to the system prompt.
    Agent,
    Feature,
    Style,
    #[serde(other)]
    Other,
}

/// User-authored instructions attached to a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub prompt: String,
    pub category: SkillCategory,
}

/// When a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTrigger {
    Always,
    OnTestFail,
    OnTaskComplete,
    BeforeDeploy,
    #[serde(other)]
    Other,
}

/// User-authored constraint with a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub prompt: String,
    pub trigger: RuleTrigger,
}

/// A plan as produced by the upstream planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, rename = "agents")]
    pub workers: Vec<Worker>,
    #[serde(default)]
    pub workflow: Workflow,
    #[serde(default)]
    pub skills: Vec<Skill>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// MCP server configuration handed to every agent call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<serde_json::Value>,
}

impl Plan {
    pub fn from_json(text: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Plan::load");
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Reject plans the engine cannot run at all.
    ///
    /// Unknown dependency ids are allowed here; they surface as a deadlock.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for worker in &self.workers {
            if worker.name.is_empty() {
                return Err(Error::Validation("worker with empty name".into()));
            }
            if !names.insert(worker.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate worker: {}",
                    worker.name
                )));
            }
        }
        if self.tasks.iter().any(|t| t.id.as_str().is_empty()) {
            return Err(Error::Validation("task with empty id".into()));
        }
        Ok(())
    }

    pub fn gates_enabled(&self) -> bool {
        !self.workflow.human_gates.is_empty()
    }

    /// Build the dependency graph. Duplicates and cycles are rejected.
    pub fn to_dag(&self) -> Result<TaskDAG> {
        TaskDAG::from_tasks(self.tasks.iter().cloned())
    }

    /// Workers from the plan plus a fallback for every task's worker the
    /// plan does not declare.
    pub fn resolved_workers(&self) -> Vec<Worker> {
        let mut workers = self.workers.clone();
        for task in &self.tasks {
            if !task.worker.is_empty() && !workers.iter().any(|w| w.name == task.worker) {
                workers.push(Worker::fallback(&task.worker));
            }
        }
        workers
    }
}
