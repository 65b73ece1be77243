//! Task executor: runs one dispatched task to a settled outcome.
//!
//! A [`Job`] arrives holding the budget reservation the scheduler took for
//! it. The executor owns the job until it returns a [`TaskReport`], so the
//! reservation is released exactly once on every path out of
//! [`TaskExecutor::execute`], panics included.
//!
//! Per job:
//! 1. Up to `max_attempts` agent calls. Attempts after the first carry a
//!    [`RetryContext`] (previous failure, workspace diff, test output).
//! 2. On success the summary is normalised, the comms override is applied,
//!    and the workspace is committed through the [`CommitSerializer`].
//! 3. When attempts run out a human gate is raised. Approval settles the
//!    task failed; rejection also asks the scheduler for a revision task.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::budget::{BudgetTracker, Reservation};
use crate::commit::CommitSerializer;
use crate::config::{Config, DEFAULT_MAX_ATTEMPTS, DEFAULT_RESERVATION_ESTIMATE};
use crate::core::task::{FailureReason, SettleOutcome, Task, TaskId, Worker};
use crate::plan::{Rule, Skill};
use crate::util::cap_words;
use crate::workspace::Workspace;

use super::agent::{AgentRequest, AgentResult, AgentService};
use super::events::{EventSink, RunEvent};
use super::gate::{GateId, GateKeeper};
use super::prompt::{PromptBuilder, PromptInput, RetryContext, TemplatePromptBuilder};

/// Summaries longer than this are cut.
pub const SUMMARY_WORD_LIMIT: usize = 500;
/// Characters of the summary carried by the agent message event.
pub const MESSAGE_CHAR_LIMIT: usize = 500;
pub const EMPTY_SUMMARY_PLACEHOLDER: &str = "Task completed without a summary.";
pub const RETRY_GATE_QUESTION: &str =
    "We're having trouble with this part. Can you help us figure it out?";

/// A task handed to the executor by the scheduler.
#[derive(Debug)]
pub struct Job {
    pub task: Task,
    pub worker: Worker,
    /// Capped summaries of completed transitive predecessors.
    pub predecessors: Vec<String>,
    pub reservation: Reservation,
}

/// Outcome of a job, applied to the graph by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub outcome: SettleOutcome,
    /// Agent calls actually made.
    pub retry_count: u32,
    /// Final summary for a done task.
    pub summary: Option<String>,
    /// Rejection feedback; the scheduler appends a revision task for it.
    pub revision_feedback: Option<String>,
}

impl TaskReport {
    /// Report for a task that was never dispatched for lack of budget.
    pub fn budget_skipped(task_id: TaskId) -> Self {
        Self {
            task_id,
            outcome: SettleOutcome::Skipped(FailureReason::BudgetExceeded),
            retry_count: 0,
            summary: None,
            revision_feedback: None,
        }
    }

    pub fn failed(task_id: TaskId, reason: FailureReason, retry_count: u32) -> Self {
        Self {
            task_id,
            outcome: SettleOutcome::Failed(reason),
            retry_count,
            summary: None,
            revision_feedback: None,
        }
    }
}

/// Result of one agent call. A reported failure and an execution error
/// collapse into the same variant.
#[derive(Debug)]
enum AttemptOutcome {
    Succeeded(AgentResult),
    Failed(String),
}

impl From<crate::Result<AgentResult>> for AttemptOutcome {
    fn from(result: crate::Result<AgentResult>) -> Self {
        match result {
            Ok(result) if result.success => AttemptOutcome::Succeeded(result),
            Ok(result) if result.summary.trim().is_empty() => {
                AttemptOutcome::Failed("agent reported failure".to_string())
            }
            Ok(result) => AttemptOutcome::Failed(result.summary),
            Err(e) => AttemptOutcome::Failed(e.to_string()),
        }
    }
}

/// Token totals across a job's attempts.
#[derive(Debug, Default)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    reported: bool,
}

/// Runs jobs. Shared by every in-flight task of a run.
pub struct TaskExecutor {
    run_id: Uuid,
    goal: String,
    skills: Vec<Skill>,
    rules: Vec<Rule>,
    workspace: Workspace,
    agent: Arc<dyn AgentService>,
    prompts: Arc<dyn PromptBuilder>,
    budget: Arc<BudgetTracker>,
    commits: Option<Arc<CommitSerializer>>,
    gates: Arc<GateKeeper>,
    events: EventSink,
    cancel: CancellationToken,
    max_attempts: u32,
    reservation_estimate: u64,
    mcp_servers: Option<serde_json::Value>,
}

impl TaskExecutor {
    pub fn new(workspace: Workspace, agent: Arc<dyn AgentService>, events: EventSink) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            goal: String::new(),
            skills: Vec::new(),
            rules: Vec::new(),
            workspace,
            agent,
            prompts: Arc::new(TemplatePromptBuilder),
            budget: BudgetTracker::unbounded(),
            commits: None,
            gates: GateKeeper::new(),
            events,
            cancel: CancellationToken::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reservation_estimate: DEFAULT_RESERVATION_ESTIMATE,
            mcp_servers: None,
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.max_attempts = config.max_attempts.max(1);
        self.reservation_estimate = config.reservation_estimate;
        self
    }

    pub fn with_goal(mut self, goal: &str) -> Self {
        self.goal = goal.to_string();
        self
    }

    /// User-authored skills and rules for every prompt.
    pub fn with_guidance(mut self, skills: Vec<Skill>, rules: Vec<Rule>) -> Self {
        self.skills = skills;
        self.rules = rules;
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_budget(mut self, budget: Arc<BudgetTracker>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_commits(mut self, commits: Arc<CommitSerializer>) -> Self {
        self.commits = Some(commits);
        self
    }

    pub fn with_gates(mut self, gates: Arc<GateKeeper>) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_mcp_servers(mut self, servers: serde_json::Value) -> Self {
        self.mcp_servers = Some(servers);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    pub fn commits(&self) -> Option<&Arc<CommitSerializer>> {
        self.commits.as_ref()
    }

    pub fn gates(&self) -> &Arc<GateKeeper> {
        &self.gates
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Budget gate: reserve capacity for one task, or `None` when the run
    /// is already over its ceiling.
    pub fn reserve(&self) -> Option<Reservation> {
        self.budget.try_reserve(self.reservation_estimate)
    }

    /// Run a job to a settled outcome.
    pub async fn execute(&self, job: Job) -> TaskReport {
        let Job {
            task,
            worker,
            predecessors,
            reservation,
        } = job;
        tracing::info!(
            task_id = %task.id,
            worker = %worker.name,
            reserved = reservation.amount(),
            "executing task"
        );

        let mut usage = Usage::default();
        let mut retry: Option<RetryContext> = None;
        let mut attempts = 0;
        let mut last_failure = String::new();

        let result = loop {
            if attempts >= self.max_attempts {
                break None;
            }
            if attempts > 0 {
                if self.cancel.is_cancelled() {
                    tracing::info!(task_id = %task.id, "cancelled between attempts");
                    self.emit_usage(&task, &worker, &usage);
                    return TaskReport::failed(task.id, FailureReason::Cancelled, attempts);
                }
                self.events.emit(RunEvent::AgentOutput {
                    task_id: task.id.clone(),
                    worker: worker.name.clone(),
                    content: format!("Retrying... (attempt {})", attempts + 1),
                });
                retry = Some(self.retry_context(attempts + 1, &last_failure).await);
            }
            attempts += 1;

            let manifest = self.file_manifest().await;
            let prompt = self.prompts.build(&PromptInput {
                task: &task,
                worker: &worker,
                goal: &self.goal,
                skills: &self.skills,
                rules: &self.rules,
                predecessors: &predecessors,
                manifest: &manifest,
                retry: retry.as_ref(),
            });
            tracing::debug!(task_id = %task.id, attempt = attempts, "agent attempt");
            let response = self
                .agent
                .execute(AgentRequest {
                    task_id: task.id.clone(),
                    worker: worker.name.clone(),
                    system_prompt: prompt.system_prompt,
                    prompt: prompt.prompt,
                    mcp_servers: self.mcp_servers.clone(),
                })
                .await;
            if let Ok(ref reported) = response {
                self.record_usage(&worker, reported, &mut usage);
            }

            match AttemptOutcome::from(response) {
                AttemptOutcome::Succeeded(result) => break Some(result),
                AttemptOutcome::Failed(summary) => {
                    tracing::warn!(
                        task_id = %task.id,
                        attempt = attempts,
                        error = %summary,
                        "attempt failed"
                    );
                    last_failure = summary;
                }
            }
        };
        self.emit_usage(&task, &worker, &usage);

        let report = match result {
            Some(result) => self.complete(&task, &worker, result, attempts).await,
            None => self.exhausted(&task, last_failure, attempts).await,
        };
        drop(reservation);
        report
    }

    async fn retry_context(&self, attempt: u32, failure_summary: &str) -> RetryContext {
        let diff = match self.commits {
            Some(ref commits) => match commits.workspace_diff(self.workspace.root()).await {
                Ok(diff) => diff,
                Err(e) => {
                    tracing::debug!(error = %e, "workspace diff unavailable");
                    None
                }
            },
            None => None,
        };
        RetryContext {
            attempt,
            failure_summary: failure_summary.to_string(),
            diff,
            test_output: self.workspace.read_test_output().await,
        }
    }

    /// Workspace listing for the prompt; empty when the walk fails.
    async fn file_manifest(&self) -> String {
        match self.workspace.file_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::debug!(error = %e, "file manifest unavailable");
                String::new()
            }
        }
    }

    fn record_usage(&self, worker: &Worker, result: &AgentResult, usage: &mut Usage) {
        if !result.has_usage() {
            return;
        }
        self.budget.record(
            &worker.name,
            result.input_tokens,
            result.output_tokens,
            result.cost_usd,
        );
        usage.input_tokens += result.input_tokens;
        usage.output_tokens += result.output_tokens;
        usage.cost_usd += result.cost_usd;
        usage.reported = true;

        if self.budget.warning_crossed() {
            if let Some(ceiling) = self.budget.ceiling() {
                let consumed = self.budget.consumed();
                tracing::warn!(consumed, ceiling, "budget warning threshold crossed");
                self.events
                    .emit(RunEvent::BudgetWarning { consumed, ceiling });
            }
        }
    }

    fn emit_usage(&self, task: &Task, worker: &Worker, usage: &Usage) {
        if !usage.reported {
            return;
        }
        self.events.emit(RunEvent::TokenUsage {
            task_id: task.id.clone(),
            worker: worker.name.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: usage.cost_usd,
        });
    }

    async fn complete(
        &self,
        task: &Task,
        worker: &Worker,
        result: AgentResult,
        attempts: u32,
    ) -> TaskReport {
        let summary = match self.workspace.read_comms_summary(&task.id).await {
            Some(text) if !text.trim().is_empty() => {
                tracing::debug!(task_id = %task.id, "using comms summary");
                normalize_summary(&text)
            }
            _ => normalize_summary(&result.summary),
        };

        if let Some(ref commits) = self.commits {
            let message = format!("{}: {}", worker.name, task.display_name());
            match commits
                .commit(self.workspace.root(), &message, &worker.name, &task.id)
                .await
            {
                Ok(Some(record)) => {
                    tracing::info!(task_id = %task.id, sha = %record.short_sha, "commit created");
                    self.events.emit(RunEvent::commit_created(&record));
                }
                Ok(None) => tracing::debug!(task_id = %task.id, "no changes to commit"),
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "commit failed"),
            }
        }

        self.events.emit(RunEvent::AgentMessage {
            from: worker.name.clone(),
            to: "team".to_string(),
            content: summary.chars().take(MESSAGE_CHAR_LIMIT).collect(),
        });

        TaskReport {
            task_id: task.id.clone(),
            outcome: SettleOutcome::Done,
            retry_count: attempts,
            summary: Some(summary),
            revision_feedback: None,
        }
    }

    async fn exhausted(&self, task: &Task, last_failure: String, attempts: u32) -> TaskReport {
        tracing::warn!(task_id = %task.id, attempts, "attempts exhausted, raising human gate");
        let error = if last_failure.is_empty() {
            "Task failed after retries".to_string()
        } else {
            last_failure
        };
        let reason = FailureReason::AgentExecutionFailed {
            error: error.clone(),
        };

        let gate_id = GateId::for_task(self.run_id, &task.id);
        let decision = self.gates.open(gate_id.clone());
        self.events.emit(RunEvent::HumanGate {
            gate_id: gate_id.clone(),
            task_id: task.id.clone(),
            question: RETRY_GATE_QUESTION.to_string(),
            context: error,
        });

        let decision = tokio::select! {
            decision = decision => decision.ok(),
            _ = self.cancel.cancelled() => {
                self.gates.close(&gate_id);
                None
            }
        };
        let Some(decision) = decision else {
            tracing::info!(task_id = %task.id, "gate abandoned");
            return TaskReport::failed(task.id.clone(), FailureReason::Cancelled, attempts);
        };

        let mut report = TaskReport::failed(task.id.clone(), reason, attempts);
        if !decision.approved {
            report.revision_feedback = Some(decision.feedback_text().to_string());
        }
        report
    }
}

/// Placeholder when empty, capped to [`SUMMARY_WORD_LIMIT`] words.
pub fn normalize_summary(summary: &str) -> String {
    let trimmed = summary.trim();
    if trimmed.is_empty() {
        return EMPTY_SUMMARY_PLACEHOLDER.to_string();
    }
    cap_words(trimmed, SUMMARY_WORD_LIMIT)
}
