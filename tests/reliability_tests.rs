use dtf_fanout::providers::fs::FsHistoryStore;
use dtf_fanout::providers::in_memory::InMemoryHistoryStore;
use dtf_fanout::providers::{HistoryStore, Provider, QueueKind, WorkItem};
use dtf_fanout::runtime::registry::ActivityRegistry;
use dtf_fanout::{Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, Runtime, RuntimeOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
mod common;

type Counts = Arc<Mutex<HashMap<String, u32>>>;

fn bump(counts: &Counts, name: &str) {
    *counts.lock().unwrap().entry(name.to_string()).or_default() += 1;
}

fn fan_out_registry() -> OrchestrationRegistry {
    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let futures = ["A", "B", "C", "D"]
            .iter()
            .map(|name| ctx.schedule_activity(*name, *name))
            .collect();
        let outcomes = ctx.join(futures).await;
        let parts = outcomes.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join("|"))
    };
    OrchestrationRegistry::builder().register("FanOut4", orchestrator).build()
}

/// Every name completes immediately except those in `blocked`, which never return.
fn counting_activities(counts: Counts, blocked: &[&str]) -> ActivityRegistry {
    let mut builder = ActivityRegistry::builder();
    for name in ["A", "B", "C", "D"] {
        let counts = counts.clone();
        let block = blocked.contains(&name);
        builder = builder.register(name, move |input: String| {
            let counts = counts.clone();
            async move {
                if block {
                    std::future::pending::<()>().await;
                }
                bump(&counts, &input);
                Ok(format!("r{input}"))
            }
        });
    }
    builder.build()
}

async fn wait_completed(rt: &Runtime, instance: &str) -> String {
    match rt
        .wait_for_orchestration(instance, Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => output,
        other => panic!("unexpected status: {other:?}"),
    }
}

#[tokio::test]
async fn crash_after_two_of_four_reschedules_only_the_rest_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = Arc::new(FsHistoryStore::new(td.path(), true)) as Arc<dyn Provider>;

    // First process: A and B finish, C and D hang until the process dies
    let before: Counts = Arc::default();
    let rt1 = Runtime::start_with_store(
        store.clone(),
        Arc::new(counting_activities(before.clone(), &["C", "D"])),
        fan_out_registry(),
    )
    .await
    .unwrap();
    rt1.start_orchestration("inst-crash", "FanOut4", "").await.unwrap();
    assert!(
        common::wait_for_history(store.clone(), "inst-crash", |h| common::count_completions(h) == 2, 3_000).await,
        "timeout waiting for two completions"
    );
    rt1.shutdown().await;

    // Second process over the same store
    let after: Counts = Arc::default();
    let rt2 = Runtime::start_with_store(
        store.clone(),
        Arc::new(counting_activities(after.clone(), &[])),
        fan_out_registry(),
    )
    .await
    .unwrap();
    let output = wait_completed(&rt2, "inst-crash").await;
    rt2.shutdown().await;

    let before = before.lock().unwrap().clone();
    let after = after.lock().unwrap().clone();
    assert_eq!(before, HashMap::from([("A".to_string(), 1), ("B".to_string(), 1)]));
    assert_eq!(after, HashMap::from([("C".to_string(), 1), ("D".to_string(), 1)]));

    // One schedule and one outcome per correlation id
    let hist = store.read("inst-crash").await.unwrap();
    for id in 1..=4u64 {
        let n = hist.iter().filter(|e| e.correlation_id() == Some(id)).count();
        assert_eq!(n, 2, "id {id} has {n} events");
    }

    // Same output as an uninterrupted run
    let reference: Counts = Arc::default();
    let rt3 = Runtime::start(Arc::new(counting_activities(reference, &[])), fan_out_registry())
        .await
        .unwrap();
    rt3.start_orchestration("inst-clean", "FanOut4", "").await.unwrap();
    assert_eq!(output, wait_completed(&rt3, "inst-clean").await);
    assert_eq!(output, "rA|rB|rC|rD");
    rt3.shutdown().await;
}

#[tokio::test]
async fn transient_append_failures_are_retried() {
    let flaky = Arc::new(common::FlakyProvider::new(Arc::new(InMemoryHistoryStore::new())));
    flaky.fail_next_appends(3);
    let counts: Counts = Arc::default();
    let rt = Runtime::start_with_store(
        flaky.clone(),
        Arc::new(counting_activities(counts.clone(), &[])),
        fan_out_registry(),
    )
    .await
    .unwrap();

    rt.start_orchestration("inst-flaky", "FanOut4", "").await.unwrap();
    assert_eq!(wait_completed(&rt, "inst-flaky").await, "rA|rB|rC|rD");
    assert_eq!(flaky.injected(), 3);
    assert!(counts.lock().unwrap().values().all(|n| *n == 1));
    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_redeliver_and_redispatch_pending_activities() {
    let flaky = Arc::new(common::FlakyProvider::new(Arc::new(InMemoryHistoryStore::new())));
    // More faults than one Advance will absorb: the schedules land but dispatch fails
    flaky.fail_next_worker_enqueues(3);
    let counts: Counts = Arc::default();
    let options = RuntimeOptions {
        infra_retry_max_attempts: 2,
        infra_retry_base_delay_ms: 1,
        ..Default::default()
    };
    let rt = Runtime::start_with_options(
        flaky.clone(),
        Arc::new(counting_activities(counts.clone(), &[])),
        fan_out_registry(),
        options,
    )
    .await
    .unwrap();

    rt.start_orchestration("inst-redispatch", "FanOut4", "").await.unwrap();
    assert_eq!(wait_completed(&rt, "inst-redispatch").await, "rA|rB|rC|rD");
    assert_eq!(flaky.injected(), 3);
    let counts = counts.lock().unwrap().clone();
    assert_eq!(counts.len(), 4);
    assert!(counts.values().all(|n| *n == 1), "{counts:?}");
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_completion_is_ignored() {
    let store = Arc::new(InMemoryHistoryStore::new()) as Arc<dyn Provider>;
    let gate = Arc::new(tokio::sync::Notify::new());
    let gate_for_activity = gate.clone();
    let acts = ActivityRegistry::builder()
        .register("First", |_input: String| async move { Ok("original".to_string()) })
        .register("Slow", move |_input: String| {
            let gate = gate_for_activity.clone();
            async move {
                gate.notified().await;
                Ok("slow".to_string())
            }
        })
        .build();
    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let first = ctx.schedule_activity("First", "").into_activity().await?;
        let slow = ctx.schedule_activity("Slow", "").into_activity().await?;
        Ok(format!("{first}+{slow}"))
    };
    let reg = OrchestrationRegistry::builder().register("Dup", orchestrator).build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(acts), reg)
        .await
        .unwrap();

    rt.start_orchestration("inst-dup", "Dup", "").await.unwrap();
    assert!(
        common::wait_for_history(store.clone(), "inst-dup", |h| common::scheduled_names(h).len() == 2, 2_000).await
    );

    // Redelivered outcome for an id that already resolved
    let dup = WorkItem::ActivityCompleted {
        instance: "inst-dup".to_string(),
        id: 1,
        result: "duplicate".to_string(),
    };
    store.enqueue_work(QueueKind::Orchestrator, dup).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();

    assert_eq!(wait_completed(&rt, "inst-dup").await, "original+slow");
    let hist = store.read("inst-dup").await.unwrap();
    let outcomes_for_first = hist
        .iter()
        .filter(|e| e.is_activity_outcome() && e.correlation_id() == Some(1))
        .count();
    assert_eq!(outcomes_for_first, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn orphan_completion_fails_instance() {
    let store = Arc::new(InMemoryHistoryStore::new()) as Arc<dyn Provider>;
    let acts = ActivityRegistry::builder()
        .register("Hang", |_input: String| async move {
            std::future::pending::<()>().await;
            Ok(String::new())
        })
        .build();
    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Hang", "").into_activity().await
    };
    let reg = OrchestrationRegistry::builder().register("Orphan", orchestrator).build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(acts), reg)
        .await
        .unwrap();

    rt.start_orchestration("inst-orphan", "Orphan", "").await.unwrap();
    assert!(
        common::wait_for_history(store.clone(), "inst-orphan", |h| common::scheduled_names(h).len() == 1, 2_000).await
    );
    let orphan = WorkItem::ActivityCompleted {
        instance: "inst-orphan".to_string(),
        id: 99,
        result: "stray".to_string(),
    };
    store.enqueue_work(QueueKind::Orchestrator, orphan).await.unwrap();

    match rt
        .wait_for_orchestration("inst-orphan", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed { details } => {
            assert!(details.is_nondeterminism());
            assert!(details.message().contains("id=99"), "{details}");
        }
        other => panic!("unexpected status: {other:?}"),
    }
    let hist = store.read("inst-orphan").await.unwrap();
    assert!(!hist.iter().any(|e| matches!(e, Event::ActivityCompleted { id: 99, .. })));
    rt.shutdown().await;
}
