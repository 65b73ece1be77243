//! Budget gate and reservation accounting across whole runs.

use kiln::budget::BudgetTracker;
use kiln::core::task::{FailureReason, TaskStatus};
use kiln::orchestration::RunEvent;

use crate::fixtures::{chain, independent_tasks, Harness, ScriptedAgent};

fn skipped() -> TaskStatus {
    TaskStatus::Skipped {
        reason: FailureReason::BudgetExceeded,
    }
}

/// Test: Budget already spent
/// Given a ceiling that earlier usage has already passed
/// When the run starts
/// Then every task is skipped with retry count 0 and the agent is never called
#[tokio::test]
async fn test_exceeded_budget_skips_everything() {
    let budget = BudgetTracker::new(Some(100));
    budget.record("earlier-run", 150, 0, 0.0);
    let harness = Harness::builder(chain(3)).budget(budget).build();

    let outcome = harness.run(vec![]).await;
    let result = outcome.unwrap();

    for id in ["t0", "t1", "t2"] {
        assert_eq!(outcome.status(id).await, skipped(), "{} should be skipped", id);
        assert_eq!(outcome.retry_count(id).await, 0);
    }
    assert_eq!(outcome.agent.total_calls(), 0);
    assert_eq!(
        outcome.count(|e| matches!(e, RunEvent::TaskSkipped { .. })),
        3
    );
    assert_eq!(
        outcome.count(|e| matches!(e, RunEvent::TaskStarted { .. })),
        0
    );
    assert!(outcome.failures().is_empty(), "skips must not cascade as failures");
    assert_eq!(result.summary_line(), "Completed 0/3 tasks.");
    assert_eq!(result.budget.grants, 0);
}

/// Test: Budget runs out part way
/// Given a 1,000 token ceiling, one slot, and 600 tokens per task
/// When four tasks run
/// Then two run, the rest are skipped, and the warning fires once
#[tokio::test]
async fn test_budget_runs_out_mid_run() {
    let harness = Harness::builder(independent_tasks(4))
        .agent(ScriptedAgent::new().with_usage(400, 200))
        .budget(BudgetTracker::new(Some(1000)))
        .max_concurrent(1)
        .build();

    let outcome = harness.run(vec![]).await;
    let result = outcome.unwrap();

    assert_eq!(outcome.status("t0").await, TaskStatus::Done);
    assert_eq!(outcome.status("t1").await, TaskStatus::Done);
    assert_eq!(outcome.status("t2").await, skipped());
    assert_eq!(outcome.status("t3").await, skipped());
    assert_eq!(outcome.agent.total_calls(), 2);
    assert_eq!(result.budget.consumed, 1200);

    let warnings: Vec<(u64, u64)> = outcome
        .events
        .iter()
        .filter_map(|e| match e {
            RunEvent::BudgetWarning { consumed, ceiling } => Some((*consumed, *ceiling)),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec![(1200, 1000)]);
}

/// Test: Every reservation is released
/// Given tasks that succeed, retry, and fail
/// When the run ends
/// Then grants equal releases and nothing stays reserved
#[tokio::test]
async fn test_grants_equal_releases() {
    let budget = BudgetTracker::unbounded();
    let harness = Harness::builder(independent_tasks(5))
        .agent(
            ScriptedAgent::new()
                .with_usage(100, 50)
                .fail_times("t1", 1)
                .fail_times("t3", 3),
        )
        .budget(budget.clone())
        .build();

    let outcome = harness.run(vec![]).await;
    let result = outcome.unwrap();

    assert_eq!(result.budget.grants, 5);
    assert_eq!(result.budget.releases, 5);
    assert_eq!(result.budget.reserved, 0);
    assert_eq!(budget.reserved(), 0);
    // 5 first attempts, 1 retry for t1, 2 retries for t3.
    assert_eq!(result.budget.consumed, 8 * 150);
    assert_eq!(budget.worker_usage("Sparky").input_tokens, 800);
}

/// Test: Usage is reported once per task
#[tokio::test]
async fn test_token_usage_event_per_task() {
    let harness = Harness::builder(independent_tasks(2))
        .agent(ScriptedAgent::new().with_usage(10, 5).fail_times("t0", 1))
        .build();

    let outcome = harness.run(vec![]).await;
    outcome.unwrap();

    let usage: Vec<(String, u64, u64)> = outcome
        .events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TokenUsage {
                task_id,
                input_tokens,
                output_tokens,
                ..
            } => Some((task_id.to_string(), *input_tokens, *output_tokens)),
            _ => None,
        })
        .collect();
    assert_eq!(usage.len(), 2);
    assert!(usage.contains(&("t0".to_string(), 20, 10)));
    assert!(usage.contains(&("t1".to_string(), 10, 5)));
}
