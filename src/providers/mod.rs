//! Storage abstraction for the runtime.
//!
//! A [`Provider`] owns everything durable: instance histories, the
//! orchestrator queue, and the worker queue. The runtime drives it through
//! two fetch/ack loops:
//!
//! * **Orchestration loop** — [`Provider::fetch_orchestration_item`] locks an
//!   instance and returns its full history together with every currently
//!   visible message for it. The runtime replays, then commits the turn with
//!   [`Provider::ack_orchestration_item`]: history delta, newly enqueued
//!   work, metadata updates, and lock release land in one atomic operation.
//!   If the process dies mid-turn nothing is committed and the lock expires,
//!   so another worker re-fetches the same instance and replays again.
//! * **Worker loop** — [`Provider::fetch_work_item`] /
//!   [`Provider::ack_work_item`] drive activity execution. Acking an item
//!   atomically enqueues its completion for the orchestrator, which is what
//!   makes activity delivery effectively exactly-once: a crash between
//!   execute and ack leaves the item on the queue for redelivery, and the
//!   completion is deduplicated against history on the orchestrator side.
//!
//! Delivery to a locked or suspended instance is the provider's problem:
//! messages stay queued (invisible or unfetched) until the instance can
//! receive them. Locks are leases with a timeout, never permanent ownership.

use std::time::Duration;

use crate::{ErrorDetails, Event};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;

/// A message moving through the orchestrator or worker queue.
///
/// Everything the runtime dispatches is one of these. Orchestrator-bound
/// variants carry the instance they target; worker-bound variants carry
/// enough to execute and route the completion back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Create an instance and schedule its first turn.
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
        parent_instance: Option<String>,
        parent_execution_id: Option<u64>,
        parent_id: Option<u64>,
    },
    /// Run one activity attempt (worker queue).
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    /// Becomes visible at `fire_at_ms`; the provider enforces the delay.
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    /// External event raised against an instance by name.
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        details: ErrorDetails,
    },
    /// Roll the instance into a fresh execution with new input.
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
    },
    /// Force the instance to Terminated regardless of what it is doing.
    TerminateInstance { instance: String, reason: String },
    SuspendInstance { instance: String, reason: Option<String> },
    ResumeInstance { instance: String, reason: Option<String> },
}

impl WorkItem {
    /// Instance this item routes to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::SuspendInstance { instance, .. }
            | WorkItem::ResumeInstance { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. }
            | WorkItem::SubOrchFailed { parent_instance, .. } => parent_instance,
        }
    }
}

/// One locked unit of orchestration work: an instance, its recorded history,
/// and the batch of messages to apply this turn.
///
/// Returned by [`Provider::fetch_orchestration_item`]. The lock token must be
/// passed back to [`Provider::ack_orchestration_item`] or
/// [`Provider::abandon_orchestration_item`]; until then the provider keeps
/// the instance locked and hides its messages from other runtimes.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub orchestration_name: String,
    pub version: String,
    /// Execution the history belongs to. Starts at 1; each continue-as-new
    /// increments it.
    pub execution_id: u64,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    /// Last custom status committed for this execution, if any.
    pub custom_status: Option<String>,
    pub lock_token: String,
    /// How many times this batch has been fetched, this fetch included.
    pub attempt_count: u32,
}

/// Execution-level state committed alongside a turn's history delta.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetadata {
    /// Orchestration name, set when the execution row is first created.
    pub orchestration_name: Option<String>,
    /// Pinned version for the execution.
    pub orchestration_version: Option<String>,
    pub parent_instance: Option<String>,
    /// New runtime status ("Running", "Completed", "Failed", ...), if it
    /// changed this turn.
    pub status: Option<String>,
    /// Terminal output or failure details, serialized.
    pub output: Option<String>,
    /// Custom status update: outer `None` leaves the stored value untouched,
    /// `Some(None)` clears it, `Some(Some(s))` replaces it.
    pub custom_status: Option<Option<String>>,
}

/// Instance-level snapshot for client queries, resolved against the latest
/// execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance: String,
    pub orchestration_name: String,
    pub version: String,
    pub execution_id: u64,
    pub status: String,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub parent_instance: Option<String>,
}

/// Durable storage backend.
///
/// Implementations must make [`ack_orchestration_item`] atomic: the history
/// append, queue inserts, metadata update, and lock release all commit or
/// none do. Everything else follows from that single guarantee.
///
/// [`ack_orchestration_item`]: Provider::ack_orchestration_item
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Lock the next instance that has visible messages and return its state
    /// plus the message batch. Returns `Ok(None)` when no work is ready.
    ///
    /// Messages for instances already locked by another runtime are not
    /// returned. The lock expires after `lock_timeout` if never acked.
    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Commit a turn atomically: append `history_delta` to the execution's
    /// history, enqueue `worker_items` and `orchestrator_items`, apply
    /// `metadata`, delete the fetched messages, and release the lock.
    ///
    /// `TimerFired` entries in `orchestrator_items` become visible at their
    /// `fire_at_ms`, not immediately.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError>;

    /// Release the lock without consuming the batch. The messages become
    /// visible again after `delay` (immediately when `None`) and their
    /// attempt count is kept, so redelivery still counts toward poison
    /// detection.
    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// Record that an instance exists before its first turn commits.
    /// Idempotent; a row that already exists is left untouched. Instances
    /// registered here but not yet dispatched report status `Pending`.
    async fn register_instance(
        &self,
        instance: &str,
        orchestration: &str,
        version: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// Enqueue a message for the orchestrator, optionally invisible for
    /// `delay`.
    async fn enqueue_for_orchestrator(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// Enqueue an activity invocation for the worker pool.
    async fn enqueue_for_worker(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Lock the next worker item. Returns the item, its lock token, and the
    /// attempt count (this fetch included), or `Ok(None)` when the queue has
    /// nothing visible.
    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String, u32)>, ProviderError>;

    /// Delete a locked worker item and, when `completion` is given, enqueue
    /// it for the orchestrator in the same atomic step.
    async fn ack_work_item(
        &self,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Release a locked worker item for redelivery after `delay`.
    async fn abandon_work_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError>;

    /// History of the latest execution, empty when the instance is unknown.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// History of one specific execution.
    async fn read_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError>;

    /// Highest execution id recorded for the instance.
    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError>;

    /// All known instance ids.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Execution ids recorded for an instance, ascending.
    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError>;

    /// Status snapshot of the latest execution, `None` for unknown instances.
    async fn get_instance_metadata(
        &self,
        instance: &str,
    ) -> Result<Option<InstanceMetadata>, ProviderError>;
}
