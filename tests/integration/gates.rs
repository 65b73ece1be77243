//! Human gates, revision tasks, the midpoint gate, and cancellation.

use std::time::Duration;

use kiln::core::task::{FailureReason, TaskId, TaskStatus};
use kiln::orchestration::{GateDecision, RunEvent, MIDPOINT_QUESTION, RETRY_GATE_QUESTION};
use kiln::Error;

use crate::fixtures::{chain, independent_tasks, task, Harness, ScriptedAgent};

/// Test: Exhausted retries raise a gate with the last failure
#[tokio::test]
async fn test_retry_gate_carries_last_failure() {
    let harness = Harness::builder(vec![task("A", &[])])
        .agent(ScriptedAgent::new().fail_times("A", 3))
        .build();

    let outcome = harness.run(vec![]).await;
    outcome.unwrap();

    let (question, context) = outcome
        .events
        .iter()
        .find_map(|e| match e {
            RunEvent::HumanGate {
                task_id,
                question,
                context,
                ..
            } if task_id.as_str() == "A" => Some((question.clone(), context.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(question, RETRY_GATE_QUESTION);
    assert_eq!(context, "attempt 3 broke");
    assert_eq!(
        outcome.status("A").await,
        TaskStatus::Failed {
            reason: FailureReason::AgentExecutionFailed {
                error: "attempt 3 broke".to_string()
            }
        }
    );
}

/// Test: Rejected gate appends a revision
/// Given A failing every attempt and B depending on A
/// When the human rejects with feedback
/// Then A and B fail, and a revision of A runs with the feedback
#[tokio::test]
async fn test_rejected_gate_appends_revision() {
    let harness = Harness::builder(vec![task("A", &[]), task("B", &["A"])])
        .agent(ScriptedAgent::new().fail_times("A", 3))
        .build();

    let outcome = harness
        .run(vec![GateDecision::reject("use integers only")])
        .await;
    let result = outcome.unwrap();

    assert_eq!(result.tasks.len(), 3);
    let revision = result.task("task-revision-A").unwrap();
    assert_eq!(revision.status, TaskStatus::Done);
    assert_eq!(revision.dependencies, vec![TaskId::from("A")]);
    assert_eq!(revision.name, "Revise: Build A");
    assert_eq!(revision.worker, "Sparky");
    assert!(matches!(
        outcome.status("B").await,
        TaskStatus::Failed {
            reason: FailureReason::DependencyFailed { .. }
        }
    ));

    let prompt = &outcome.agent.prompts_for("task-revision-A")[0];
    assert!(prompt.contains("Revise based on feedback: use integers only"));
    assert!(prompt.contains("- Address feedback: use integers only"));
    assert_eq!(result.summary_line(), "Completed 1/3 tasks. 2 task(s) failed.");
}

/// Test: Rejection without feedback still revises
#[tokio::test]
async fn test_rejection_without_feedback() {
    let harness = Harness::builder(vec![task("A", &[])])
        .agent(ScriptedAgent::new().fail_times("A", 1))
        .max_attempts(1)
        .build();

    let outcome = harness.run(vec![GateDecision::parse_answer("n")]).await;
    let result = outcome.unwrap();

    let revision = result.task("task-revision-A").unwrap();
    assert_eq!(
        revision.description,
        "Revise based on feedback: No feedback provided"
    );
}

/// Test: Midpoint gate fires once
/// Given four tasks run one at a time with the midpoint gate on
/// When two have settled
/// Then a single midpoint gate names the task just completed
#[tokio::test]
async fn test_midpoint_gate_fires_once() {
    let harness = Harness::builder(independent_tasks(4))
        .max_concurrent(1)
        .midpoint_gate()
        .build();

    let outcome = harness.run(vec![]).await;
    let result = outcome.unwrap();

    let gates: Vec<(String, String)> = outcome
        .events
        .iter()
        .filter_map(|e| match e {
            RunEvent::MidpointGate {
                question, context, ..
            } => Some((question.clone(), context.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        gates,
        vec![(
            MIDPOINT_QUESTION.to_string(),
            "Just completed: Build t1".to_string()
        )]
    );
    assert_eq!(result.tasks.len(), 4);
    assert_eq!(result.summary_line(), "Completed 4/4 tasks.");
}

/// Test: Rejected midpoint revises the last completed task
#[tokio::test]
async fn test_midpoint_rejection_revises_last_done() {
    let harness = Harness::builder(independent_tasks(4))
        .max_concurrent(1)
        .midpoint_gate()
        .build();

    let outcome = harness
        .run(vec![GateDecision::reject("more color")])
        .await;
    let result = outcome.unwrap();

    assert_eq!(result.tasks.len(), 5);
    let revision = result.task("task-revision-t1").unwrap();
    assert_eq!(revision.status, TaskStatus::Done);
    assert_eq!(revision.acceptance_criteria, vec!["Address feedback: more color"]);
    assert_eq!(
        outcome.count(|e| matches!(e, RunEvent::MidpointGate { .. })),
        1
    );
}

/// Test: Midpoint gate stays quiet on a single task
#[tokio::test]
async fn test_midpoint_gate_needs_two_tasks() {
    let harness = Harness::builder(independent_tasks(1))
        .midpoint_gate()
        .build();

    let outcome = harness.run(vec![]).await;
    outcome.unwrap();
    assert_eq!(
        outcome.count(|e| matches!(e, RunEvent::MidpointGate { .. })),
        0
    );
}

/// Test: Cancellation drains in-flight work
/// Given a three-task chain with slow agents
/// When the run is cancelled while the first task is executing
/// Then the first task still finishes and the rest are cancelled
#[tokio::test]
async fn test_cancel_drains_then_cancels_pending() {
    let harness = Harness::builder(chain(3))
        .agent(ScriptedAgent::new().with_delay(Duration::from_millis(200)))
        .max_concurrent(1)
        .build();
    let cancel = harness.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = harness.run(vec![]).await;

    assert!(matches!(outcome.result, Err(Error::Cancelled)));
    assert_eq!(outcome.status("t0").await, TaskStatus::Done);
    for id in ["t1", "t2"] {
        assert_eq!(
            outcome.status(id).await,
            TaskStatus::Failed {
                reason: FailureReason::Cancelled
            }
        );
        assert_eq!(outcome.retry_count(id).await, 0);
    }
    assert_eq!(outcome.agent.total_calls(), 1);
    assert!(outcome
        .failures()
        .contains(&("t1".to_string(), FailureReason::Cancelled)));
    assert!(matches!(
        outcome.events.last(),
        Some(RunEvent::Error {
            recoverable: false,
            ..
        })
    ));

    let state = std::fs::read_to_string(
        outcome.dir.path().join(".kiln/status/current_state.json"),
    )
    .unwrap();
    let state: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(state["tasks"]["t2"]["status"], "failed");
}

/// Test: A task cancelled between attempts does not fail its dependents
/// Given a chain whose first task fails slowly
/// When the run is cancelled during that first attempt
/// Then the first task and its dependents are all cancelled
#[tokio::test]
async fn test_cancel_between_attempts_does_not_cascade() {
    let harness = Harness::builder(chain(3))
        .agent(
            ScriptedAgent::new()
                .fail_times("t0", 1)
                .with_delay(Duration::from_millis(200)),
        )
        .build();
    let cancel = harness.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = harness.run(vec![]).await;

    assert!(matches!(outcome.result, Err(Error::Cancelled)));
    for id in ["t0", "t1", "t2"] {
        assert_eq!(
            outcome.status(id).await,
            TaskStatus::Failed {
                reason: FailureReason::Cancelled
            },
            "{} should be cancelled",
            id
        );
    }
    assert_eq!(outcome.agent.calls_for("t0"), 1);
    assert!(!outcome
        .failures()
        .iter()
        .any(|(_, reason)| matches!(reason, FailureReason::DependencyFailed { .. })));
}
