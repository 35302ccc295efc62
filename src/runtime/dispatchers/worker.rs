//! Worker (activity) dispatcher: fetches activity invocations, runs the
//! registered handler, and acks with the completion in one atomic step.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::{registry, Runtime};
use crate::providers::WorkItem;
use crate::{ActivityContext, AppErrorKind, ConfigErrorKind, ErrorDetails};

impl Runtime {
    /// Start the worker dispatcher with N concurrent activity workers.
    pub(in crate::runtime) fn start_work_dispatcher(
        self: Arc<Self>,
        activities: Arc<registry::ActivityRegistry>,
    ) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let activities = activities.clone();
                let shutdown = Arc::clone(&shutdown);
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt.history_store.fetch_work_item(rt.options.worker_lock_timeout).await {
                            Ok(Some((item, lock_token, attempt_count))) => {
                                rt.process_work_item(item, &lock_token, attempt_count, &activities, &worker_id)
                                    .await;
                            }
                            Ok(None) => {
                                tokio::time::sleep(Duration::from_millis(rt.options.dispatcher_idle_sleep_ms)).await;
                            }
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "failed to fetch work item");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                });
                worker_handles.push(handle);
            }

            for handle in worker_handles {
                let _ = handle.await;
            }
        })
    }

    async fn process_work_item(
        &self,
        item: WorkItem,
        lock_token: &str,
        attempt_count: u32,
        activities: &registry::ActivityRegistry,
        worker_id: &str,
    ) {
        let (instance, execution_id, id, name, input) = match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                name,
                input,
            } => (instance, execution_id, id, name, input),
            other => {
                error!(item = ?other, "unexpected work item in worker queue; state corruption");
                panic!("unexpected work item in worker queue");
            }
        };

        // Poison: the invocation keeps getting fetched without ever acking.
        // Route a failure to the orchestrator instead of retrying forever.
        let completion = if attempt_count > self.options.max_attempts {
            warn!(
                instance = %instance,
                activity = %name,
                id,
                attempt_count,
                max_attempts = self.options.max_attempts,
                "work item exceeded max delivery attempts"
            );
            WorkItem::ActivityFailed {
                instance: instance.clone(),
                execution_id,
                id,
                details: ErrorDetails::Infrastructure {
                    operation: "dispatch".to_string(),
                    message: format!(
                        "work item redelivered {attempt_count} times (max {})",
                        self.options.max_attempts
                    ),
                    retryable: false,
                },
            }
        } else {
            self.run_activity(&instance, execution_id, id, &name, input, activities, worker_id)
                .await
        };

        if let Err(e) = self.history_store.ack_work_item(lock_token, Some(completion)).await {
            warn!(
                instance = %instance,
                activity = %name,
                id,
                worker_id = %worker_id,
                error = %e,
                "failed to ack work item"
            );
        }
    }

    async fn run_activity(
        &self,
        instance: &str,
        execution_id: u64,
        id: u64,
        name: &str,
        input: String,
        activities: &registry::ActivityRegistry,
        worker_id: &str,
    ) -> WorkItem {
        let handler = match activities.resolve_handler(name) {
            Some((_, handler)) => handler,
            None => {
                error!(
                    target: "duraflow::runtime",
                    instance = %instance,
                    execution_id,
                    activity = %name,
                    id,
                    worker_id = %worker_id,
                    "activity not registered"
                );
                return WorkItem::ActivityFailed {
                    instance: instance.to_string(),
                    execution_id,
                    id,
                    details: ErrorDetails::Configuration {
                        kind: ConfigErrorKind::UnregisteredActivity,
                        resource: name.to_string(),
                        message: None,
                    },
                };
            }
        };

        debug!(
            target: "duraflow::runtime",
            instance = %instance,
            execution_id,
            activity = %name,
            id,
            worker_id = %worker_id,
            "activity started"
        );
        let started_at = std::time::Instant::now();
        let ctx = ActivityContext::new(instance, execution_id, name, id);

        match handler.invoke(ctx, input).await {
            Ok(result) => {
                debug!(
                    target: "duraflow::runtime",
                    instance = %instance,
                    execution_id,
                    activity = %name,
                    id,
                    worker_id = %worker_id,
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "activity completed"
                );
                WorkItem::ActivityCompleted {
                    instance: instance.to_string(),
                    execution_id,
                    id,
                    result,
                }
            }
            Err(error) => {
                warn!(
                    target: "duraflow::runtime",
                    instance = %instance,
                    execution_id,
                    activity = %name,
                    id,
                    worker_id = %worker_id,
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    error = %error,
                    "activity failed"
                );
                WorkItem::ActivityFailed {
                    instance: instance.to_string(),
                    execution_id,
                    id,
                    details: ErrorDetails::Application {
                        kind: AppErrorKind::ActivityFailed,
                        message: error,
                        retryable: false,
                    },
                }
            }
        }
    }
}
