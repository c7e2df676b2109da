use dtf_fanout::logging::LogLevel;
use dtf_fanout::providers::fs::FsHistoryStore;
use dtf_fanout::providers::{HistoryStore, Provider};
use dtf_fanout::runtime::detect::pending_activities;
use dtf_fanout::runtime::registry::ActivityRegistry;
use dtf_fanout::{
    Action, Event, Executor, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, Runtime, run_turn,
    run_turn_detailed,
};
use std::sync::Arc;
use std::sync::Arc as StdArc;
use std::time::Duration;
mod common;

fn started() -> Vec<Event> {
    common::started_history("FanOut")
}

async fn fan_out_four(ctx: OrchestrationContext) -> Result<String, String> {
    let futures = ["A", "B", "C", "D"]
        .iter()
        .map(|name| ctx.schedule_activity(*name, format!("in-{name}")))
        .collect();
    let results = ctx.join(futures).await;
    let parts = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("|"))
}

fn completed(id: u64, result: &str) -> Event {
    Event::ActivityCompleted {
        id,
        result: result.to_string(),
    }
}

#[test]
fn first_turn_schedules_whole_fan_out_in_declaration_order() {
    let (hist, actions, _logs, out) = run_turn(started(), fan_out_four);
    assert!(out.is_none(), "fan-in must wait for all four");
    let scheduled: Vec<(u64, String)> = actions
        .iter()
        .map(|a| match a {
            Action::CallActivity { id, name, .. } => (*id, name.clone()),
        })
        .collect();
    assert_eq!(
        scheduled,
        vec![(1, "A".into()), (2, "B".into()), (3, "C".into()), (4, "D".into())]
    );
    assert_eq!(common::scheduled_names(&hist), vec!["A", "B", "C", "D"]);
}

#[test]
fn fan_in_order_is_declaration_order_regardless_of_completion_order() {
    let (mut hist, _, _, _) = run_turn(started(), fan_out_four);

    // Completions arrive D, B, A, C
    for (i, (id, result)) in [(4, "rD"), (2, "rB"), (1, "rA"), (3, "rC")].into_iter().enumerate() {
        hist.push(completed(id, result));
        let (next, actions, _, out) = run_turn(hist, fan_out_four);
        hist = next;
        assert!(actions.is_empty(), "replay must not reschedule recorded activities");
        if i < 3 {
            assert!(out.is_none(), "fan-in proceeded after {} of 4 completions", i + 1);
        } else {
            assert_eq!(out.unwrap().unwrap(), "rA|rB|rC|rD");
        }
    }
}

#[test]
fn replay_after_partial_progress_reschedules_only_missing_activities() {
    // Only A and B were recorded before the crash; both completed
    let mut hist = started();
    for (id, name) in [(1, "A"), (2, "B")] {
        hist.push(Event::ActivityScheduled {
            id,
            name: name.into(),
            input: format!("in-{name}"),
        });
        hist.push(completed(id, &format!("r{name}")));
    }
    let (hist, actions, _, out) = run_turn(hist, fan_out_four);
    assert!(out.is_none());
    let ids: Vec<u64> = actions
        .iter()
        .map(|a| match a {
            Action::CallActivity { id, .. } => *id,
        })
        .collect();
    assert_eq!(ids, vec![3, 4]);

    // All four recorded, two resolved: nothing new, two still pending
    let (_, actions, _, _) = run_turn(hist.clone(), fan_out_four);
    assert!(actions.is_empty());
    let pending: Vec<u64> = pending_activities(&hist).into_iter().map(|(id, _, _)| id).collect();
    assert_eq!(pending, vec![3, 4]);
}

fn complete_all(actions: Vec<Action>, hist: &mut Vec<Event>) {
    for a in actions {
        let Action::CallActivity { id, name, input } = a;
        hist.push(completed(id, &format!("{name}({input})")));
    }
}

#[test]
fn two_runs_with_same_input_produce_same_history() {
    let (h1, o1) = Executor::drive_to_completion(started(), fan_out_four, complete_all);
    let (h2, o2) = Executor::drive_to_completion(started(), fan_out_four, complete_all);
    assert_eq!(h1, h2);
    assert_eq!(o1, o2);
    assert_eq!(o1.unwrap(), "A(in-A)|B(in-B)|C(in-C)|D(in-D)");

    // Reversed completion order changes only where outcomes land, not what was scheduled
    let (h3, o3) = Executor::drive_to_completion(started(), fan_out_four, |actions, hist| {
        let mut actions = actions;
        actions.reverse();
        complete_all(actions, hist);
    });
    assert_eq!(o3, o2);
    assert_eq!(common::scheduled_names(&h3), common::scheduled_names(&h1));
}

#[test]
fn replayed_logs_are_suppressed() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        ctx.trace_info("before");
        let a = ctx.schedule_activity("A", "x").into_activity().await?;
        ctx.trace_info(format!("after {a}"));
        Ok::<_, String>(a)
    };
    let (mut hist, _, logs, _) = run_turn(started(), orchestrator);
    assert_eq!(logs, vec![(LogLevel::Info, "before".to_string())]);

    hist.push(completed(1, "rA"));
    let (_, _, logs, out) = run_turn(hist, orchestrator);
    assert_eq!(logs, vec![(LogLevel::Info, "after rA".to_string())]);
    assert_eq!(out.unwrap().unwrap(), "rA");
}

#[test]
fn changed_activity_name_is_nondeterministic() {
    let (hist, _, _, _) = run_turn(started(), fan_out_four);
    let swapped = |ctx: OrchestrationContext| async move {
        let b = ctx.schedule_activity("B", "in-A").into_activity().await?;
        Ok::<_, String>(b)
    };
    let turn = run_turn_detailed(hist, 0, swapped);
    let msg = turn.nondeterminism.expect("swap must be detected");
    assert!(msg.contains("'A'") && msg.contains("'B'"), "{msg}");
    assert!(turn.output.is_none());
}

#[test]
fn changed_activity_input_is_nondeterministic() {
    let (hist, _, _, _) = run_turn(started(), fan_out_four);
    let changed = |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("A", "other-input").into_activity().await
    };
    let turn = run_turn_detailed(hist, 0, changed);
    assert!(turn.nondeterminism.unwrap().contains("different input"));
}

#[tokio::test]
async fn code_swap_across_restart_fails_instance_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn Provider>;

    let v1 = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Gate", "").into_activity().await
    };
    let acts = ActivityRegistry::builder()
        .register("Gate", |_input: String| async move {
            std::future::pending::<()>().await;
            Ok(String::new())
        })
        .build();
    let rt1 = Runtime::start_with_store(
        store.clone(),
        Arc::new(acts),
        OrchestrationRegistry::builder().register("Flow", v1).build(),
    )
    .await
    .unwrap();
    rt1.start_orchestration("inst-swap", "Flow", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "inst-swap",
            |h| common::scheduled_names(h) == vec!["Gate"],
            2_000
        )
        .await
    );
    rt1.shutdown().await;

    // New code schedules a different activity at correlation id 1
    let v2 = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Other", "").into_activity().await
    };
    let acts = ActivityRegistry::builder()
        .register("Gate", |_input: String| async move { Ok("opened".to_string()) })
        .register("Other", |_input: String| async move { Ok("other".to_string()) })
        .build();
    let rt2 = Runtime::start_with_store(
        store.clone(),
        Arc::new(acts),
        OrchestrationRegistry::builder().register("Flow", v2).build(),
    )
    .await
    .unwrap();
    match rt2
        .wait_for_orchestration("inst-swap", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed { details } => assert!(details.is_nondeterminism(), "{details}"),
        other => panic!("unexpected status: {other:?}"),
    }
    let hist = store.read("inst-swap").await.unwrap();
    assert!(matches!(hist.last(), Some(Event::OrchestratorFailed { .. })));
    assert_eq!(common::scheduled_names(&hist), vec!["Gate"]);
    rt2.shutdown().await;
}
