//! Events emitted while a run progresses.
//!
//! Events are emitted at most once per occurrence, in the order the engine
//! observes them. Consumers (the CLI, tests) read them from an unbounded
//! channel so a slow reader never stalls task execution.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::commit::CommitRecord;
use crate::core::task::{FailureReason, TaskId};

use super::gate::GateId;

/// Lifecycle events for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    TaskStarted {
        task_id: TaskId,
        worker: String,
    },
    TaskCompleted {
        task_id: TaskId,
        summary: String,
    },
    TaskFailed {
        task_id: TaskId,
        reason: FailureReason,
        /// Agent calls actually made for the task.
        retry_count: u32,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: FailureReason,
        retry_count: u32,
    },
    TokenUsage {
        task_id: TaskId,
        worker: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    BudgetWarning {
        consumed: u64,
        ceiling: u64,
    },
    CommitCreated {
        task_id: TaskId,
        sha: String,
        short_sha: String,
        message: String,
        files_changed: usize,
    },
    /// A task exhausted its attempts and needs a decision.
    HumanGate {
        gate_id: GateId,
        task_id: TaskId,
        question: String,
        context: String,
    },
    MidpointGate {
        gate_id: GateId,
        question: String,
        context: String,
    },
    AgentMessage {
        from: String,
        to: String,
        content: String,
    },
    AgentOutput {
        task_id: TaskId,
        worker: String,
        content: String,
    },
    SessionComplete {
        summary: String,
    },
    /// Generic run error. Fatal when not recoverable.
    Error {
        message: String,
        recoverable: bool,
    },
}

impl RunEvent {
    pub fn commit_created(record: &CommitRecord) -> Self {
        RunEvent::CommitCreated {
            task_id: record.task_id.clone(),
            sha: record.sha.clone(),
            short_sha: record.short_sha.clone(),
            message: record.message.clone(),
            files_changed: record.files_changed,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        RunEvent::Error {
            message: message.into(),
            recoverable: false,
        }
    }
}

/// Sending half of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. A closed receiver is not an error for the run.
    pub fn emit(&self, event: RunEvent) {
        tracing::trace!(?event, "emit");
        let _ = self.tx.send(event);
    }
}
