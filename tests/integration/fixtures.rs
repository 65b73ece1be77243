//! Test fixtures for integration tests.
//!
//! Provides:
//! - A scripted agent service with per-task responses and delays
//! - An in-memory version-control adapter
//! - A harness that wires a scheduler over a temporary workspace and
//!   answers gates from a queue

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use kiln::budget::BudgetTracker;
use kiln::commit::{CommitRecord, CommitSerializer, VersionControl};
use kiln::core::dag::{SharedDag, TaskDAG};
use kiln::core::task::{FailureReason, Task, TaskId, TaskStatus, Worker};
use kiln::orchestration::{
    AgentRequest, AgentResult, AgentService, EventSink, GateDecision, GateKeeper, RunEvent,
    RunResult, Scheduler, TaskExecutor,
};
use kiln::workspace::Workspace;

// ========== Task Builders ==========

/// A task assigned to the default builder.
pub fn task(id: &str, deps: &[&str]) -> Task {
    Task::new(id, &format!("Build {}", id), &format!("Implement {}", id))
        .with_worker("Sparky")
        .with_dependencies(deps.iter().copied())
}

/// `n` tasks with no dependencies: t0, t1, ...
pub fn independent_tasks(n: usize) -> Vec<Task> {
    (0..n).map(|i| task(&format!("t{}", i), &[])).collect()
}

/// t0 <- t1 <- ... <- t(n-1)
pub fn chain(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            let id = format!("t{}", i);
            if i == 0 {
                task(&id, &[])
            } else {
                let dep = format!("t{}", i - 1);
                task(&id, &[dep.as_str()])
            }
        })
        .collect()
}

pub fn workers() -> Vec<Worker> {
    vec![
        Worker::new("Sparky", "builder"),
        Worker::new("Checkers", "tester"),
    ]
}

// ========== Scripted Agent ==========

/// Agent fake. Each task answers from its script, then succeeds with
/// "did <id>" once the script runs out.
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<String, VecDeque<AgentResult>>>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    usage: Option<(u64, u64)>,
    calls: Mutex<Vec<(String, String)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task_id: &str, responses: Vec<AgentResult>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), responses.into());
        self
    }

    /// Fail the first `n` attempts of a task.
    pub fn fail_times(self, task_id: &str, n: usize) -> Self {
        let failures = (0..n)
            .map(|i| AgentResult::failed(format!("attempt {} broke", i + 1)))
            .collect();
        self.script(task_id, failures)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn delay_for(mut self, task_id: &str, delay: Duration) -> Self {
        self.delays.insert(task_id.to_string(), delay);
        self
    }

    /// Report this much usage on every call.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some((input_tokens, output_tokens));
        self
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, task_id: &str) -> usize {
        self.prompts_for(task_id).len()
    }

    pub fn prompts_for(&self, task_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }

    /// Task ids in the order their first attempt started.
    pub fn start_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for (id, _) in self.calls.lock().unwrap().iter() {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        order
    }

    /// Highest number of calls that were in progress at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentService for ScriptedAgent {
    async fn execute(&self, request: AgentRequest) -> kiln::Result<AgentResult> {
        let id = request.task_id.as_str().to_string();
        self.calls
            .lock()
            .unwrap()
            .push((id.clone(), request.prompt.clone()));
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(&id).copied().unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(|script| script.pop_front());
        self.active.fetch_sub(1, Ordering::SeqCst);

        let result = scripted.unwrap_or_else(|| AgentResult::succeeded(format!("did {}", id)));
        Ok(match self.usage {
            Some((input, output)) => result.with_usage(input, output, 0.001),
            None => result,
        })
    }
}

// ========== In-Memory Version Control ==========

/// Version-control fake that counts overlapping commits.
#[derive(Default)]
pub struct MemoryVcs {
    delay: Duration,
    counter: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    shas: Mutex<Vec<String>>,
}

impl MemoryVcs {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Most commits ever in progress at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Shas in the order the commits finished.
    pub fn shas(&self) -> Vec<String> {
        self.shas.lock().unwrap().clone()
    }
}

#[async_trait]
impl VersionControl for MemoryVcs {
    async fn commit(
        &self,
        _workspace: &Path,
        message: &str,
        author: &str,
        task_id: &TaskId,
    ) -> kiln::Result<Option<CommitRecord>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let sha = format!("{:040x}", n);
        self.shas.lock().unwrap().push(sha.clone());
        self.active.fetch_sub(1, Ordering::SeqCst);

        Ok(Some(CommitRecord {
            short_sha: sha[..7].to_string(),
            sha,
            message: message.to_string(),
            author: author.to_string(),
            task_id: task_id.clone(),
            timestamp: Utc::now(),
            files_changed: 1,
        }))
    }

    async fn workspace_diff(&self, _workspace: &Path) -> kiln::Result<Option<String>> {
        Ok(None)
    }
}

// ========== Harness ==========

pub struct HarnessBuilder {
    tasks: Vec<Task>,
    agent: ScriptedAgent,
    vcs: MemoryVcs,
    budget: Arc<BudgetTracker>,
    max_concurrent: usize,
    max_attempts: u32,
    midpoint_gate: bool,
}

impl HarnessBuilder {
    pub fn agent(mut self, agent: ScriptedAgent) -> Self {
        self.agent = agent;
        self
    }

    pub fn vcs(mut self, vcs: MemoryVcs) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn budget(mut self, budget: Arc<BudgetTracker>) -> Self {
        self.budget = budget;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn midpoint_gate(mut self) -> Self {
        self.midpoint_gate = true;
        self
    }

    pub fn build(self) -> Harness {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let agent = Arc::new(self.agent);
        let vcs = Arc::new(self.vcs);
        let cancel = CancellationToken::new();
        let (events, rx) = EventSink::channel();

        let executor = TaskExecutor::new(Workspace::new(dir.path()), agent.clone(), events)
            .with_goal("Build a calculator")
            .with_max_attempts(self.max_attempts)
            .with_budget(Arc::clone(&self.budget))
            .with_commits(Arc::new(CommitSerializer::new(vcs.clone())))
            .with_cancel(cancel.clone());
        let dag = TaskDAG::from_tasks(self.tasks)
            .expect("fixture tasks form a DAG")
            .into_shared();
        let scheduler = Scheduler::new(dag, workers(), executor)
            .with_max_concurrent(self.max_concurrent)
            .with_midpoint_gate(self.midpoint_gate);

        Harness {
            dir,
            scheduler,
            events: rx,
            agent,
            vcs,
            budget: self.budget,
            cancel,
        }
    }
}

/// A scheduler over a temporary workspace with fakes plugged in.
pub struct Harness {
    pub dir: TempDir,
    pub scheduler: Scheduler,
    pub events: UnboundedReceiver<RunEvent>,
    pub agent: Arc<ScriptedAgent>,
    pub vcs: Arc<MemoryVcs>,
    pub budget: Arc<BudgetTracker>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn builder(tasks: Vec<Task>) -> HarnessBuilder {
        HarnessBuilder {
            tasks,
            agent: ScriptedAgent::new(),
            vcs: MemoryVcs::default(),
            budget: BudgetTracker::unbounded(),
            max_concurrent: 3,
            max_attempts: 3,
            midpoint_gate: false,
        }
    }

    pub fn new(tasks: Vec<Task>) -> Self {
        Self::builder(tasks).build()
    }

    /// Run to the end. Gates are answered from `answers` in order, then
    /// approved once the queue is empty.
    pub async fn run(self, answers: Vec<GateDecision>) -> RunOutcome {
        let Harness {
            dir,
            mut scheduler,
            events,
            agent,
            vcs,
            budget,
            cancel: _,
        } = self;
        let gates = Arc::clone(scheduler.executor().gates());
        let dag = Arc::clone(scheduler.dag());
        let collector = tokio::spawn(answer_gates(events, gates, answers));

        let result = scheduler.run().await;
        // Dropping the scheduler closes the event channel.
        drop(scheduler);
        let events = tokio::time::timeout(Duration::from_secs(5), collector)
            .await
            .expect("event channel closed after the run")
            .expect("collector task");

        RunOutcome {
            result,
            events,
            dag,
            dir,
            agent,
            vcs,
            budget,
        }
    }
}

async fn answer_gates(
    mut rx: UnboundedReceiver<RunEvent>,
    gates: Arc<GateKeeper>,
    answers: Vec<GateDecision>,
) -> Vec<RunEvent> {
    let mut answers: VecDeque<GateDecision> = answers.into();
    let mut seen = Vec::new();
    while let Some(event) = rx.recv().await {
        match &event {
            RunEvent::HumanGate { gate_id, .. } | RunEvent::MidpointGate { gate_id, .. } => {
                let decision = answers.pop_front().unwrap_or_else(GateDecision::approve);
                gates.resolve(gate_id, decision);
            }
            _ => {}
        }
        seen.push(event);
    }
    seen
}

/// Everything a finished run left behind.
pub struct RunOutcome {
    pub result: kiln::Result<RunResult>,
    pub events: Vec<RunEvent>,
    pub dag: SharedDag,
    pub dir: TempDir,
    pub agent: Arc<ScriptedAgent>,
    pub vcs: Arc<MemoryVcs>,
    pub budget: Arc<BudgetTracker>,
}

impl RunOutcome {
    pub fn unwrap(&self) -> &RunResult {
        match self.result {
            Ok(ref result) => result,
            Err(ref e) => panic!("run failed: {}", e),
        }
    }

    pub async fn status(&self, id: &str) -> TaskStatus {
        self.dag
            .read()
            .await
            .get_task(&TaskId::from(id))
            .map(|t| t.status.clone())
            .unwrap_or_else(|| panic!("no task {}", id))
    }

    pub async fn retry_count(&self, id: &str) -> u32 {
        self.dag
            .read()
            .await
            .get_task(&TaskId::from(id))
            .map(|t| t.retry_count)
            .unwrap_or_else(|| panic!("no task {}", id))
    }

    /// (task, reason) for every TaskFailed event, in emission order.
    pub fn failures(&self) -> Vec<(String, FailureReason)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                RunEvent::TaskFailed {
                    task_id, reason, ..
                } => Some((task_id.to_string(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Task ids in TaskCompleted order.
    pub fn completed(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                RunEvent::TaskCompleted { task_id, .. } => Some(task_id.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&RunEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}
