//! Property tests: any acyclic plan runs to a fully settled end.

use std::collections::HashSet;

use proptest::prelude::*;

use kiln::core::task::{FailureReason, Task, TaskStatus};

use crate::fixtures::{task, Harness, ScriptedAgent};

// Task N may only depend on tasks 0..N-1, which keeps every plan acyclic.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<Task>> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let deps: HashSet<String> = if i == 0 {
                            HashSet::new()
                        } else {
                            picks.into_iter().map(|p| format!("t{}", p % i)).collect()
                        };
                        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                        task(&format!("t{}", i), &deps)
                    })
                    .collect()
            },
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_random_dags_terminate(
        tasks in dag_strategy(10),
        failing in proptest::collection::hash_set(0..10usize, 0..4),
        max_concurrent in 1..4usize,
    ) {
        let failing: HashSet<String> = failing
            .into_iter()
            .filter(|&i| i < tasks.len())
            .map(|i| format!("t{}", i))
            .collect();
        let mut agent = ScriptedAgent::new();
        for id in &failing {
            agent = agent.fail_times(id, 1);
        }
        let harness = Harness::builder(tasks.clone())
            .agent(agent)
            .max_attempts(1)
            .max_concurrent(max_concurrent)
            .build();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let outcome = rt.block_on(harness.run(vec![]));
        let result = outcome.unwrap();

        prop_assert_eq!(result.tasks.len(), tasks.len());
        prop_assert!(result.tasks.iter().all(|t| t.is_settled()));
        prop_assert!(outcome.agent.peak() <= max_concurrent);
        prop_assert_eq!(result.budget.grants, result.budget.releases);

        for t in &result.tasks {
            let id = t.id.as_str().to_string();
            match &t.status {
                TaskStatus::Done => {
                    prop_assert!(!failing.contains(&id));
                    for dep in &t.dependencies {
                        prop_assert_eq!(&result.task(dep.as_str()).unwrap().status, &TaskStatus::Done);
                    }
                }
                TaskStatus::Failed { reason: FailureReason::AgentExecutionFailed { .. } } => {
                    prop_assert!(failing.contains(&id));
                    prop_assert_eq!(outcome.agent.calls_for(&id), 1);
                }
                TaskStatus::Failed { reason: FailureReason::DependencyFailed { dependency } } => {
                    prop_assert!(failing.contains(dependency.as_str()));
                    prop_assert_eq!(outcome.agent.calls_for(&id), 0);
                }
                other => prop_assert!(false, "unexpected status {:?} for {}", other, id),
            }
        }
    }
}
