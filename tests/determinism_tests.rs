use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duraflow::runtime::registry::ActivityRegistry;
use duraflow::{
    ActivityContext, Client, Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, Runtime,
};

mod common;

// A runtime restart mid-instance must resume from history without
// re-executing completed work.
#[tokio::test]
async fn replay_after_restart_does_not_rerun_activities() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let executions = Arc::new(AtomicUsize::new(0));
    let exec_counter = executions.clone();
    let build_activities = move || {
        let exec_counter = exec_counter.clone();
        ActivityRegistry::builder()
            .register("Charge", move |_ctx: ActivityContext, input: String| {
                let exec_counter = exec_counter.clone();
                async move {
                    exec_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("charged:{input}"))
                }
            })
            .build()
    };
    let build_orchestrations = || {
        OrchestrationRegistry::builder()
            .register("Payment", |ctx: OrchestrationContext, input: String| async move {
                let receipt = ctx.schedule_activity("Charge", input).into_activity().await?;
                let confirm = ctx.schedule_wait("Confirm").into_event().await;
                Ok(format!("{receipt}+{confirm}"))
            })
            .build()
    };

    let rt = Runtime::start_with_store(store.clone(), Arc::new(build_activities()), build_orchestrations()).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-restart-1", "Payment", "42").await.unwrap();

    // Wait until the activity result is durable, then kill the runtime
    // before the confirmation arrives.
    assert!(
        common::wait_for_history(
            store.clone(),
            "inst-restart-1",
            |hist| hist.iter().any(|e| matches!(e, Event::ActivityCompleted { .. })),
            5_000,
        )
        .await
    );
    rt.shutdown().await;
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let rt2 = Runtime::start_with_store(store.clone(), Arc::new(build_activities()), build_orchestrations()).await;
    client.raise_event("inst-restart-1", "Confirm", "ok").await.unwrap();

    match client
        .wait_for_orchestration("inst-restart-1", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "charged:42+ok"),
        other => panic!("unexpected status: {other:?}"),
    }

    // Replay reused the recorded result; the activity body ran exactly once.
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let hist = client.read_history("inst-restart-1").await.unwrap();
    let schedules = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { .. }))
        .count();
    assert_eq!(schedules, 1);

    rt2.shutdown().await;
}

// Guids and wall-clock reads are recorded as system calls; replay adopts the
// recorded values instead of recomputing them.
#[tokio::test]
async fn system_calls_are_stable_across_replay() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let activities = ActivityRegistry::builder().build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Stamp", |ctx: OrchestrationContext, _input: String| async move {
            let id = ctx.new_guid();
            let at = ctx.utcnow_ms();
            // The wait forces at least one replay over the recorded calls.
            let _ = ctx.schedule_wait("Tick").into_event().await;
            Ok(format!("{id}@{at}"))
        })
        .build();

    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-stamp-1", "Stamp", "").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), "inst-stamp-1", "Tick", 5_000).await);
    client.raise_event("inst-stamp-1", "Tick", "").await.unwrap();

    let output = match client
        .wait_for_orchestration("inst-stamp-1", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => output,
        other => panic!("unexpected status: {other:?}"),
    };

    let hist = client.read_history("inst-stamp-1").await.unwrap();
    let mut recorded = hist.iter().filter_map(|e| match e {
        Event::SystemCall { op, value, .. } => Some((op.clone(), value.clone())),
        _ => None,
    });
    let (guid_op, guid) = recorded.next().expect("guid system call recorded");
    let (time_op, at) = recorded.next().expect("utcnow system call recorded");
    assert_eq!(guid_op, "guid");
    assert_eq!(time_op, "utcnow_ms");
    assert_eq!(output, format!("{guid}@{at}"));

    rt.shutdown().await;
}

// Deploying different code under the same name mid-instance is detected at
// the first divergent schedule and fails the instance instead of corrupting
// its history.
#[tokio::test]
async fn code_swap_mid_instance_fails_as_nondeterminism() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let activities = ActivityRegistry::builder()
        .register("Step", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .build();

    let original = OrchestrationRegistry::builder()
        .register("Pipeline", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.schedule_activity("Step", "one").into_activity().await?;
            let gate = ctx.schedule_wait("Gate").into_event().await;
            Ok(format!("{a}:{gate}"))
        })
        .build();

    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), original).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-swap-1", "Pipeline", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "inst-swap-1",
            |hist| {
                hist.iter().any(|e| matches!(e, Event::ActivityCompleted { .. }))
                    && hist.iter().any(|e| matches!(e, Event::ExternalSubscribed { .. }))
            },
            5_000,
        )
        .await
    );
    rt.shutdown().await;

    // Same name and version, different first schedule: replay now wants a
    // timer where history holds an activity.
    let swapped = OrchestrationRegistry::builder()
        .register("Pipeline", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(10).into_timer().await;
            let gate = ctx.schedule_wait("Gate").into_event().await;
            Ok(gate)
        })
        .build();
    let activities2 = ActivityRegistry::builder()
        .register("Step", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .build();
    let rt2 = Runtime::start_with_store(store.clone(), Arc::new(activities2), swapped).await;

    client.raise_event("inst-swap-1", "Gate", "go").await.unwrap();

    match client
        .wait_for_orchestration("inst-swap-1", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Failed { details } => {
            assert!(details.is_nondeterminism(), "wrong failure: {details:?}");
            assert!(
                details.display_message().contains("schedule order mismatch"),
                "unexpected message: {}",
                details.display_message()
            );
        }
        other => panic!("unexpected status: {other:?}"),
    }

    rt2.shutdown().await;
}

// whenAny resolves with whichever completion is recorded first.
#[tokio::test]
async fn select_resolves_by_arrival_order() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let activities = ActivityRegistry::builder()
        .register("Slow", |_ctx: ActivityContext, _input: String| async move {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            Ok("slow".to_string())
        })
        .register("Fast", |_ctx: ActivityContext, _input: String| async move {
            Ok("fast".to_string())
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Race", |ctx: OrchestrationContext, _input: String| async move {
            let slow = ctx.schedule_activity("Slow", "");
            let fast = ctx.schedule_activity("Fast", "");
            let (winner, _) = ctx.select2(slow, fast).await;
            Ok(winner.to_string())
        })
        .build();

    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-race-1", "Race", "").await.unwrap();

    match client
        .wait_for_orchestration("inst-race-1", Duration::from_secs(10))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "1"),
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}

// whenAll with one failing member resolves only after every completion is
// recorded and reports exactly that member's failure.
#[tokio::test]
async fn join_with_failure_waits_for_all_and_reports_it() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let activities = ActivityRegistry::builder()
        .register("Step", |_ctx: ActivityContext, input: String| async move {
            if input == "2" {
                Err("step 2 exploded".to_string())
            } else {
                Ok(format!("ok-{input}"))
            }
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Batch", |ctx: OrchestrationContext, _input: String| async move {
            let children: Vec<_> = ["1", "2", "3"]
                .iter()
                .map(|n| ctx.schedule_activity("Step", *n))
                .collect();
            let outs = ctx.join(children).await;
            let failures: Vec<String> = outs
                .iter()
                .filter_map(|o| match o {
                    duraflow::DurableOutput::Activity(Err(e)) => Some(e.clone()),
                    _ => None,
                })
                .collect();
            Ok(format!("{} failure(s): {}", failures.len(), failures.join(",")))
        })
        .build();

    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-joinfail-1", "Batch", "").await.unwrap();

    match client
        .wait_for_orchestration("inst-joinfail-1", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "1 failure(s): step 2 exploded"),
        other => panic!("unexpected status: {other:?}"),
    }

    // All three completions are in history, success and failure alike.
    let hist = client.read_history("inst-joinfail-1").await.unwrap();
    let completed = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    let failed = hist.iter().filter(|e| matches!(e, Event::ActivityFailed { .. })).count();
    assert_eq!(completed, 2);
    assert_eq!(failed, 1);

    rt.shutdown().await;
}

// whenAll yields outputs in scheduling order no matter which activity
// finished first on the wall clock.
#[tokio::test]
async fn join_outputs_follow_scheduling_order() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let activities = ActivityRegistry::builder()
        .register("Delay", |_ctx: ActivityContext, input: String| async move {
            let ms: u64 = input.parse().map_err(|e| format!("bad input: {e}"))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(input)
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Pair", |ctx: OrchestrationContext, _input: String| async move {
            // First child takes longer; outputs must still come back [200, 10].
            let a = ctx.schedule_activity("Delay", "200");
            let b = ctx.schedule_activity("Delay", "10");
            let outs = ctx.join(vec![a, b]).await;
            let values: Vec<String> = outs
                .into_iter()
                .map(|o| match o {
                    duraflow::DurableOutput::Activity(Ok(v)) => Ok(v),
                    other => Err(format!("unexpected output: {other:?}")),
                })
                .collect::<Result<_, _>>()?;
            Ok(values.join(","))
        })
        .build();

    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-pair-1", "Pair", "").await.unwrap();

    match client
        .wait_for_orchestration("inst-pair-1", Duration::from_secs(10))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "200,10"),
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}
