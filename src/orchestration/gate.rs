//! Human approval gates.
//!
//! A gate suspends one branch of the run until someone outside the engine
//! answers it. Each open gate owns a oneshot channel registered under a
//! [`GateId`]; [`GateKeeper::resolve`] completes it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::core::task::TaskId;

/// Key of an open gate: the run id plus the task (or `midpoint`) it guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateId(pub String);

impl GateId {
    pub fn for_task(run_id: Uuid, task_id: &TaskId) -> Self {
        Self(format!("{}:{}", run_id, task_id))
    }

    pub fn midpoint(run_id: Uuid) -> Self {
        Self(format!("{}:midpoint", run_id))
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Answer to a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl GateDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: None,
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: Some(feedback.into()),
        }
    }

    /// Parse an interactive answer.
    ///
    /// Empty, `y` or `yes` approves. `n` or `no` rejects with the rest of
    /// the line as feedback. Any other text is taken as rejection feedback.
    pub fn parse_answer(line: &str) -> Self {
        let line = line.trim();
        let (first, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let word = first
            .trim_end_matches(|c: char| c.is_ascii_punctuation())
            .to_ascii_lowercase();
        match word.as_str() {
            "" | "y" | "yes" => Self::approve(),
            "n" | "no" => Self::reject(rest.trim()),
            _ => Self::reject(line),
        }
    }

    /// Feedback text, or a stock phrase when none was given.
    pub fn feedback_text(&self) -> &str {
        self.feedback
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or("No feedback provided")
    }
}

/// Registry of open gates.
#[derive(Debug, Default)]
pub struct GateKeeper {
    open: Mutex<HashMap<GateId, oneshot::Sender<GateDecision>>>,
}

impl GateKeeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<GateId, oneshot::Sender<GateDecision>>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a gate and return the receiver to await.
    ///
    /// Re-opening an id replaces the previous registration.
    pub fn open(&self, id: GateId) -> oneshot::Receiver<GateDecision> {
        let (tx, rx) = oneshot::channel();
        tracing::debug!(gate_id = %id, "gate opened");
        self.lock().insert(id, tx);
        rx
    }

    /// Answer a gate. Returns false when no such gate is open.
    pub fn resolve(&self, id: &GateId, decision: GateDecision) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            tracing::warn!(gate_id = %id, "resolve for unknown gate");
            return false;
        };
        tracing::debug!(gate_id = %id, approved = decision.approved, "gate resolved");
        tx.send(decision).is_ok()
    }

    /// Drop a gate without answering it.
    pub fn close(&self, id: &GateId) {
        self.lock().remove(id);
    }

    /// Ids of gates still waiting for an answer.
    pub fn pending(&self) -> Vec<GateId> {
        self.lock().keys().cloned().collect()
    }
}
