//! In-process runtime: dispatcher loops over a [`Provider`], versioned
//! handler registries, and the per-turn replay engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::providers::Provider;
use crate::{ActivityContext, ErrorDetails, OrchestrationContext};

pub mod limits;
pub mod registry;
pub mod replay_engine;
pub mod state_helpers;

mod dispatchers;

pub use registry::{ActivityRegistry, OrchestrationRegistry, VersionMatch, VersionMiss, VersionPolicy};
pub use state_helpers::{HistoryManager, WorkItemReader};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration options for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Concurrent orchestration dispatcher workers.
    pub orchestration_concurrency: usize,
    /// Concurrent activity workers.
    pub worker_concurrency: usize,
    /// Polling interval in milliseconds when the queues are empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// How long a fetched orchestration batch stays locked before the
    /// provider offers it to another worker.
    pub orchestrator_lock_timeout: Duration,
    /// How long a fetched activity invocation stays locked.
    pub worker_lock_timeout: Duration,
    /// Delivery attempts before a batch or work item is failed as poison.
    pub max_attempts: u32,
    /// How replay binds an execution's pinned version against the registry.
    pub version_match: VersionMatch,
    /// What to do when the pinned version cannot be bound.
    pub version_miss: VersionMiss,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 4,
            worker_concurrency: 4,
            dispatcher_idle_sleep_ms: 10,
            orchestrator_lock_timeout: Duration::from_secs(30),
            worker_lock_timeout: Duration::from_secs(30),
            max_attempts: 5,
            version_match: VersionMatch::default(),
            version_miss: VersionMiss::default(),
        }
    }
}

/// Instance status surfaced to clients, resolved against the latest
/// execution.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationStatus {
    /// No such instance.
    NotFound,
    /// Scheduled but no turn has committed yet.
    Pending,
    Running {
        custom_status: Option<String>,
    },
    Suspended {
        custom_status: Option<String>,
    },
    Completed {
        output: String,
    },
    Failed {
        details: ErrorDetails,
    },
    /// Transient: the execution rolled over and the next one has not
    /// committed its first turn yet.
    ContinuedAsNew {
        input: String,
    },
    Terminated {
        reason: String,
    },
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Trait implemented by orchestration handlers. Handler code must be
/// deterministic: all side effects go through the context.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements [`OrchestrationHandler`].
pub struct FnOrchestration<F>(pub F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers. Activities run outside replay and
/// may perform arbitrary side effects.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements [`ActivityHandler`].
pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// In-process runtime: drains a provider's queues with concurrent
/// dispatchers and drives orchestrations through replay turns.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    options: RuntimeOptions,
    shutdown: Arc<AtomicBool>,
    runtime_id: u64,
}

impl Runtime {
    /// Start a runtime over the in-memory provider. Good for tests and
    /// examples; state dies with the process.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn Provider> = Arc::new(crate::providers::in_memory::InMemoryProvider::new());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a runtime with a custom [`Provider`].
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none is set; fine to call twice.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
            runtime_id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(work_handle);

        runtime
    }

    /// Provider backing this runtime, for attaching a [`Client`].
    ///
    /// [`Client`]: crate::Client
    pub fn store(&self) -> Arc<dyn Provider> {
        self.history_store.clone()
    }

    /// Signal the dispatchers to stop and abort their tasks.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }
}
