//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work handed to workers. Each task tracks
//! its status, the worker it is assigned to, its declared dependencies, and
//! timing information.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a task within a plan.
///
/// Plans are written by an upstream planner, so ids are free-form strings
/// (for example `task-1`) rather than generated values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a task ended without being done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    /// The run budget was exhausted before the task could be dispatched.
    BudgetExceeded,
    /// Every attempt against the agent service failed.
    AgentExecutionFailed {
        /// Summary reported by the last failed attempt.
        error: String,
    },
    /// An upstream task failed, so this one was never attempted.
    DependencyFailed {
        /// The failed task this one (transitively) depends on.
        dependency: TaskId,
    },
    /// The run was cancelled before the task finished.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::BudgetExceeded => write!(f, "budget exceeded"),
            FailureReason::AgentExecutionFailed { error } => {
                write!(f, "agent execution failed: {}", error)
            }
            FailureReason::DependencyFailed { dependency } => {
                write!(f, "dependency failed: {}", dependency)
            }
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but not yet dispatched.
    #[default]
    Pending,
    /// Task has been handed to the executor.
    InProgress,
    /// Task completed successfully.
    Done,
    /// Task failed, either on its own or through a failed dependency.
    Failed { reason: FailureReason },
    /// Task was skipped because of a run-wide resource constraint.
    Skipped { reason: FailureReason },
}

impl TaskStatus {
    /// Short name used in state snapshots.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Skipped { .. } => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { reason } => write!(f, "failed: {}", reason),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Final outcome handed to [`crate::core::TaskDAG::settle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Done,
    Failed(FailureReason),
    Skipped(FailureReason),
}

impl SettleOutcome {
    fn into_status(self) -> TaskStatus {
        match self {
            SettleOutcome::Done => TaskStatus::Done,
            SettleOutcome::Failed(reason) => TaskStatus::Failed { reason },
            SettleOutcome::Skipped(reason) => TaskStatus::Skipped { reason },
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Identifier assigned by the planner.
    pub id: TaskId,
    /// Human-readable name for the task.
    #[serde(default)]
    pub name: String,
    /// Detailed description of what the task should accomplish.
    #[serde(default)]
    pub description: String,
    /// Ordered acceptance criteria.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Name of the worker assigned to this task.
    #[serde(default, rename = "agent_name")]
    pub worker: String,
    /// Tasks that must settle before this one may start.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Current execution status. Plans always start pending.
    #[serde(default, skip_deserializing)]
    pub status: TaskStatus,
    /// Number of agent calls made for this task.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no dependencies and no worker.
    pub fn new(id: impl Into<TaskId>, name: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            description: description.to_string(),
            acceptance_criteria: Vec::new(),
            worker: String::new(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_worker(mut self, worker: &str) -> Self {
        self.worker = worker.to_string();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }

    /// Transition to InProgress and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Move into a terminal status. Has no effect on an already-settled task.
    pub fn settle(&mut self, outcome: SettleOutcome) -> bool {
        if self.is_settled() {
            return false;
        }
        self.status = outcome.into_status();
        self.completed_at = Some(Utc::now());
        true
    }

    /// Done, failed, or skipped.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Done | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, TaskStatus::Pending)
    }
}

/// Lifecycle of a worker during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Working,
    Error,
    Done,
}

/// A named worker that tasks are assigned to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub persona: String,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub restricted_paths: Vec<String>,
    #[serde(default)]
    pub status: WorkerStatus,
}

fn default_role() -> String {
    "builder".to_string()
}

impl Worker {
    pub fn new(name: &str, role: &str) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            persona: String::new(),
            allowed_paths: Vec::new(),
            restricted_paths: Vec::new(),
            status: WorkerStatus::Idle,
        }
    }

    /// Worker used when a task names nobody the plan knows about.
    pub fn fallback(name: &str) -> Self {
        Self::new(name, &default_role())
    }
}
