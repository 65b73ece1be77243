//! Core domain models for kiln runs.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: tasks, workers, and the dependency graph.

pub mod dag;
pub mod task;

pub use dag::{SharedDag, TaskDAG};
pub use task::{FailureReason, SettleOutcome, Task, TaskId, TaskStatus, Worker, WorkerStatus};
