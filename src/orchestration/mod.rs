//! Orchestration layer: runs a plan's tasks against the agent service.
//!
//! The [`Scheduler`] drives the run and hands dispatched tasks to the
//! [`TaskExecutor`], which talks to an [`AgentService`] and records
//! commits. Progress is reported as [`RunEvent`]s; human decisions come
//! back through the [`GateKeeper`].

mod agent;
mod console;
mod events;
mod executor;
mod gate;
mod prompt;
mod scheduler;

pub use agent::{AgentRequest, AgentResult, AgentService, ClaudeCli};
pub use console::{relay_events, stdin_lines};
pub use events::{EventSink, RunEvent};
pub use executor::{
    normalize_summary, Job, TaskExecutor, TaskReport, EMPTY_SUMMARY_PLACEHOLDER,
    RETRY_GATE_QUESTION, SUMMARY_WORD_LIMIT,
};
pub use gate::{GateDecision, GateId, GateKeeper};
pub use prompt::{Prompt, PromptBuilder, PromptInput, RetryContext, TemplatePromptBuilder};
pub use scheduler::{revision_task, RunResult, Scheduler, MIDPOINT_QUESTION};
