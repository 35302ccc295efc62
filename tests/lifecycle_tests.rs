use std::sync::Arc;
use std::time::Duration;

use duraflow::client::ClientError;
use duraflow::runtime::registry::ActivityRegistry;
use duraflow::{Client, Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, Runtime};

mod common;

// Status before any runtime touches the instance: NotFound for unknown ids,
// Pending once the start is enqueued.
#[tokio::test]
async fn status_not_found_and_pending() {
    let (store, _td) = common::create_sqlite_store_disk().await;
    let client = Client::new(store.clone());

    assert_eq!(
        client.get_orchestration_status("inst-none").await.unwrap(),
        OrchestrationStatus::NotFound
    );

    // No runtime is draining the queue, so the instance stays Pending.
    client.start_orchestration("inst-pending-1", "Watcher", "in").await.unwrap();
    assert_eq!(
        client.get_orchestration_status("inst-pending-1").await.unwrap(),
        OrchestrationStatus::Pending
    );

    let details = client.get_instance_details("inst-pending-1").await.unwrap();
    assert_eq!(details.orchestration_name, "Watcher");
    assert_eq!(details.status, OrchestrationStatus::Pending);
}

// Instance ids are single-use once the instance moves past Pending.
#[tokio::test]
async fn duplicate_start_rejected_after_progress() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let orchestrations = OrchestrationRegistry::builder()
        .register("Quick", |_ctx: OrchestrationContext, _input: String| async move {
            Ok("done".to_string())
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-dup-1", "Quick", "").await.unwrap();
    client
        .wait_for_orchestration("inst-dup-1", Duration::from_secs(5))
        .await
        .unwrap();

    let err = client.start_orchestration("inst-dup-1", "Quick", "").await.unwrap_err();
    assert!(matches!(err, ClientError::InstanceAlreadyExists(ref i) if i == "inst-dup-1"));

    rt.shutdown().await;
}

// While suspended, external events pile up durably in history but drive no
// turns; resume replays them.
#[tokio::test]
async fn suspend_buffers_events_until_resume() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let orchestrations = OrchestrationRegistry::builder()
        .register("Gate", |ctx: OrchestrationContext, _input: String| async move {
            let data = ctx.schedule_wait("Go").into_event().await;
            Ok(data)
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-susp-1", "Gate", "").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), "inst-susp-1", "Go", 5_000).await);

    client.suspend_instance("inst-susp-1").await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let OrchestrationStatus::Suspended { .. } = client.get_orchestration_status("inst-susp-1").await.unwrap() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "suspension never committed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The event lands in history while the instance stays suspended.
    client.raise_event("inst-susp-1", "Go", "payload").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "inst-susp-1",
            |hist| {
                hist.iter()
                    .any(|e| matches!(e, Event::ExternalEvent { name, .. } if name == "Go"))
            },
            5_000,
        )
        .await
    );
    assert!(matches!(
        client.get_orchestration_status("inst-susp-1").await.unwrap(),
        OrchestrationStatus::Suspended { .. }
    ));

    client.resume_instance("inst-susp-1").await.unwrap();
    match client
        .wait_for_orchestration("inst-susp-1", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "payload"),
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}

// Terminating a parent terminates children that have not completed, and the
// reason propagates.
#[tokio::test]
async fn terminate_cascades_to_children() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let child = |ctx: OrchestrationContext, _input: String| async move {
        let data = ctx.schedule_wait("Never").into_event().await;
        Ok(data)
    };
    let parent = |ctx: OrchestrationContext, input: String| async move {
        ctx.schedule_sub_orchestration("Waiter", input)
            .into_sub_orchestration()
            .await
    };

    let orchestrations = OrchestrationRegistry::builder()
        .register("Waiter", child)
        .register("Parent", parent)
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-term-1", "Parent", "").await.unwrap();

    // Wait until the child is running and parked on its subscription.
    let child_instance = common::wait_for_history_event(
        store.clone(),
        "inst-term-1",
        |hist| {
            hist.iter().find_map(|e| match e {
                Event::SubOrchestrationScheduled { instance, .. } => Some(instance.clone()),
                _ => None,
            })
        },
        5_000,
    )
    .await
    .expect("parent never scheduled its child");
    assert!(common::wait_for_subscription(store.clone(), &child_instance, "Never", 5_000).await);

    client.terminate_instance("inst-term-1", "cleanup").await.unwrap();

    match client
        .wait_for_orchestration("inst-term-1", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Terminated { reason } => assert_eq!(reason, "cleanup"),
        other => panic!("unexpected status: {other:?}"),
    }
    match client
        .wait_for_orchestration(&child_instance, Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Terminated { reason } => assert_eq!(reason, "cleanup"),
        other => panic!("unexpected child status: {other:?}"),
    }

    rt.shutdown().await;
}

// Terminate is a hard override: it applies even while the instance is
// suspended.
#[tokio::test]
async fn terminate_overrides_suspension() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let orchestrations = OrchestrationRegistry::builder()
        .register("Gate", |ctx: OrchestrationContext, _input: String| async move {
            let data = ctx.schedule_wait("Go").into_event().await;
            Ok(data)
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-susp-2", "Gate", "").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), "inst-susp-2", "Go", 5_000).await);

    client.suspend_instance("inst-susp-2").await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let OrchestrationStatus::Suspended { .. } = client.get_orchestration_status("inst-susp-2").await.unwrap() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "suspension never committed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.terminate_instance("inst-susp-2", "killed").await.unwrap();
    match client
        .wait_for_orchestration("inst-susp-2", Duration::from_secs(5))
        .await
        .unwrap()
    {
        OrchestrationStatus::Terminated { reason } => assert_eq!(reason, "killed"),
        other => panic!("unexpected status: {other:?}"),
    }

    rt.shutdown().await;
}

// Signals against unknown instances fail fast at the client instead of
// queueing messages nothing can consume.
#[tokio::test]
async fn signals_to_unknown_instance_error() {
    let (store, _td) = common::create_sqlite_store_disk().await;
    let client = Client::new(store.clone());

    let err = client.raise_event("inst-ghost", "E", "d").await.unwrap_err();
    assert!(matches!(err, ClientError::InstanceNotFound(_)));
    let err = client.terminate_instance("inst-ghost", "r").await.unwrap_err();
    assert!(matches!(err, ClientError::InstanceNotFound(_)));
    let err = client.suspend_instance("inst-ghost").await.unwrap_err();
    assert!(matches!(err, ClientError::InstanceNotFound(_)));
    let err = client.resume_instance("inst-ghost").await.unwrap_err();
    assert!(matches!(err, ClientError::InstanceNotFound(_)));
}

// Instance listings cover every started instance, including children.
#[tokio::test]
async fn list_instances_includes_children() {
    let (store, _td) = common::create_sqlite_store_disk().await;

    let child = |_ctx: OrchestrationContext, input: String| async move { Ok(input) };
    let parent = |ctx: OrchestrationContext, input: String| async move {
        ctx.schedule_sub_orchestration("Echo", input)
            .into_sub_orchestration()
            .await
    };

    let orchestrations = OrchestrationRegistry::builder()
        .register("Echo", child)
        .register("Parent", parent)
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let client = Client::new(store.clone());

    client.start_orchestration("inst-list-1", "Parent", "x").await.unwrap();
    client
        .wait_for_orchestration("inst-list-1", Duration::from_secs(5))
        .await
        .unwrap();

    let instances = client.list_instances().await.unwrap();
    assert!(instances.iter().any(|i| i == "inst-list-1"));
    assert!(
        instances.iter().any(|i| i.starts_with("inst-list-1::sub::")),
        "child instance missing from {instances:?}"
    );

    rt.shutdown().await;
}
