//! duraflow — a deterministic, replay-driven durable orchestration engine.
//!
//! Orchestrations are ordinary `async` functions that schedule activities,
//! timers, external-event waits and sub-orchestrations through an
//! [`OrchestrationContext`]. Progress is persisted as an append-only event
//! history; after a crash or redeploy the orchestrator is re-executed from the
//! top against that history (replay), which reconstructs in-memory state
//! without re-executing side effects.
//!
//! The replay contract:
//! - every awaitable claims the next unclaimed scheduling event from history
//!   in global order; a mismatch is a determinism violation,
//! - completions deliver in recorded order, and the dispatcher records each
//!   completion batch in scheduling order, so simultaneous results resolve by
//!   scheduling order no matter how they arrived,
//! - system operations (guid, time, tracing) are recorded as `SystemCall`
//!   events so replay adopts the recorded value instead of recomputing.

use std::cell::Cell;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod futures;
pub mod providers;
pub mod runtime;

pub use client::Client;
pub use futures::{DurableFuture, DurableOutput};
pub use runtime::registry::{
    ActivityRegistry, OrchestrationRegistry, VersionMatch, VersionMiss, VersionPolicy,
};
pub use runtime::{OrchestrationStatus, Runtime, RuntimeOptions, WaitError};

/// Event ids start at 1 within each execution.
pub const INITIAL_EVENT_ID: u64 = 1;
/// Execution ids start at 1; continue-as-new opens execution N+1.
pub const INITIAL_EXECUTION_ID: u64 = 1;

pub(crate) const SYSCALL_OP_GUID: &str = "guid";
pub(crate) const SYSCALL_OP_UTCNOW_MS: &str = "utcnow_ms";
pub(crate) const SYSCALL_OP_TRACE_PREFIX: &str = "trace:";

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// One entry in an execution's append-only history.
///
/// Scheduling events (`ActivityScheduled`, `TimerCreated`,
/// `ExternalSubscribed`, `SubOrchestrationScheduled`, `SystemCall`) are
/// appended by replay in code order. Completion events carry
/// `source_event_id` pointing at their scheduling event and are appended by
/// the dispatcher when messages arrive. Terminal events close an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrchestrationStarted {
        event_id: u64,
        name: String,
        version: String,
        input: String,
        parent_instance: Option<String>,
        parent_execution_id: Option<u64>,
        parent_id: Option<u64>,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    ActivityFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    TimerCreated {
        event_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        event_id: u64,
        source_event_id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        event_id: u64,
        name: String,
    },
    ExternalEvent {
        event_id: u64,
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    SystemCall {
        event_id: u64,
        op: String,
        value: String,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: String,
    },
    OrchestrationFailed {
        event_id: u64,
        details: ErrorDetails,
    },
    OrchestrationContinuedAsNew {
        event_id: u64,
        input: String,
    },
    OrchestrationTerminated {
        event_id: u64,
        reason: String,
    },
    OrchestrationSuspended {
        event_id: u64,
    },
    OrchestrationResumed {
        event_id: u64,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationContinuedAsNew { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. }
            | Event::OrchestrationSuspended { event_id, .. }
            | Event::OrchestrationResumed { event_id, .. } => *event_id,
        }
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationContinuedAsNew { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. }
            | Event::OrchestrationSuspended { event_id, .. }
            | Event::OrchestrationResumed { event_id, .. } => *event_id = id,
        }
    }

    /// True for events that occupy a slot in the claim sequence.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            Event::ActivityScheduled { .. }
                | Event::TimerCreated { .. }
                | Event::ExternalSubscribed { .. }
                | Event::SubOrchestrationScheduled { .. }
                | Event::SystemCall { .. }
        )
    }

    /// True for events that complete a scheduling event (external events
    /// included even though they match by name rather than source id).
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Event::ActivityCompleted { .. }
                | Event::ActivityFailed { .. }
                | Event::TimerFired { .. }
                | Event::ExternalEvent { .. }
                | Event::SubOrchestrationCompleted { .. }
                | Event::SubOrchestrationFailed { .. }
        )
    }

    /// True for events that close an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationContinuedAsNew { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }

    /// Short label for logging and dedup keys.
    pub fn label(&self) -> &'static str {
        match self {
            Event::OrchestrationStarted { .. } => "OrchestrationStarted",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::TimerCreated { .. } => "TimerCreated",
            Event::TimerFired { .. } => "TimerFired",
            Event::ExternalSubscribed { .. } => "ExternalSubscribed",
            Event::ExternalEvent { .. } => "ExternalEvent",
            Event::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            Event::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            Event::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            Event::SystemCall { .. } => "SystemCall",
            Event::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            Event::OrchestrationFailed { .. } => "OrchestrationFailed",
            Event::OrchestrationContinuedAsNew { .. } => "OrchestrationContinuedAsNew",
            Event::OrchestrationTerminated { .. } => "OrchestrationTerminated",
            Event::OrchestrationSuspended { .. } => "OrchestrationSuspended",
            Event::OrchestrationResumed { .. } => "OrchestrationResumed",
        }
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Outbound decisions produced by one replay turn. Each decision corresponds
/// to a scheduling event appended in the same turn; pure bookkeeping events
/// (external subscriptions, system calls) produce no decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// What failed inside user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    ActivityFailed,
    OrchestrationFailed,
    SubOrchestrationFailed,
}

/// What is misconfigured. `Nondeterminism` is the distinct failure kind for
/// determinism violations: code/history divergence, unmatched completions,
/// orchestrator panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    Nondeterminism,
    UnregisteredOrchestration,
    UnregisteredActivity,
    VersionNotFound,
    LimitExceeded,
}

/// Unified error taxonomy recorded in history and surfaced through status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorDetails {
    /// User code returned an error. Flows to the awaiting future, not a turn
    /// abort.
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
    /// Deployment or registration problem. Aborts the turn and fails the
    /// instance.
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    /// Storage or transport problem.
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                ..
            }
        )
    }

    /// Human-readable message for logs and failure outputs.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { message, .. } => message.clone(),
            ErrorDetails::Configuration {
                kind,
                resource,
                message,
            } => {
                let base = match kind {
                    ConfigErrorKind::Nondeterminism => "nondeterministic execution".to_string(),
                    ConfigErrorKind::UnregisteredOrchestration => {
                        format!("unregistered orchestration: {resource}")
                    }
                    ConfigErrorKind::UnregisteredActivity => {
                        format!("unregistered activity: {resource}")
                    }
                    ConfigErrorKind::VersionNotFound => {
                        format!("no registered version satisfies {resource}")
                    }
                    ConfigErrorKind::LimitExceeded => format!("limit exceeded: {resource}"),
                };
                match message {
                    Some(m) => format!("{base}: {m}"),
                    None => base,
                }
            }
            ErrorDetails::Infrastructure {
                operation, message, ..
            } => format!("{operation}: {message}"),
        }
    }

    pub(crate) fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: String::new(),
            message: Some(message.into()),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category(), self.display_message())
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry policy for `schedule_activity_with_retry` and
/// `schedule_sub_orchestration_with_retry`. Every attempt and every backoff
/// delay is an explicit event pair in history; replay walks the same ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub first_delay_ms: u64,
    pub backoff_coefficient: f64,
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_delay_ms: 100,
            backoff_coefficient: 2.0,
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    fn next_delay(&self, current_ms: u64) -> u64 {
        let next = (current_ms as f64 * self.backoff_coefficient).round() as u64;
        let next = next.max(1);
        match self.max_delay_ms {
            Some(cap) => next.min(cap),
            None => next,
        }
    }
}

// ---------------------------------------------------------------------------
// Activity context
// ---------------------------------------------------------------------------

/// Execution context handed to activity handlers. Activities run outside
/// replay and may perform arbitrary side effects and logging.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub execution_id: u64,
    pub activity_name: String,
    pub activity_id: u64,
}

impl ActivityContext {
    pub fn new(
        instance: impl Into<String>,
        execution_id: u64,
        activity_name: impl Into<String>,
        activity_id: u64,
    ) -> Self {
        Self {
            instance: instance.into(),
            execution_id,
            activity_name: activity_name.into(),
            activity_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestration context internals
// ---------------------------------------------------------------------------

pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    pub(crate) orchestration_name: Option<String>,
    pub(crate) orchestration_version: Option<String>,
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    /// Losing branches of a select: their completions are recorded but never
    /// delivered, and must not wedge the consumption gate.
    pub(crate) abandoned_source_ids: HashSet<u64>,
    /// Claimed external subscriptions in claim order: (event_id, name).
    pub(crate) external_subscriptions: Vec<(u64, String)>,
    /// Subscriptions that already delivered an event to their awaiter.
    pub(crate) resolved_subscriptions: HashSet<u64>,
    pub(crate) nondeterminism_error: Option<String>,
    pub(crate) custom_status: Option<String>,
    pub(crate) custom_status_dirty: bool,
}

impl CtxInner {
    fn new(instance: String, execution_id: u64, history: Vec<Event>) -> Self {
        let next_event_id = history
            .iter()
            .map(Event::event_id)
            .max()
            .map(|m| m + 1)
            .unwrap_or(INITIAL_EVENT_ID);
        let mut orchestration_name = None;
        let mut orchestration_version = None;
        for e in &history {
            if let Event::OrchestrationStarted { name, version, .. } = e {
                orchestration_name = Some(name.clone());
                orchestration_version = Some(version.clone());
            }
        }
        Self {
            instance,
            execution_id,
            orchestration_name,
            orchestration_version,
            history,
            actions: Vec::new(),
            next_event_id,
            claimed_scheduling_events: HashSet::new(),
            consumed_completions: HashSet::new(),
            abandoned_source_ids: HashSet::new(),
            external_subscriptions: Vec::new(),
            resolved_subscriptions: HashSet::new(),
            nondeterminism_error: None,
            custom_status: None,
            custom_status_dirty: false,
        }
    }

    pub(crate) fn record_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub(crate) fn allocate_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Next unclaimed scheduling event, in recorded order. `None` means the
    /// replay frontier was reached and a new event may be appended.
    pub(crate) fn next_unclaimed_scheduling_event(&self) -> Option<&Event> {
        self.history
            .iter()
            .find(|e| e.is_scheduling() && !self.claimed_scheduling_events.contains(&e.event_id()))
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.next_unclaimed_scheduling_event().is_some()
    }

    pub(crate) fn set_nondeterminism(&mut self, message: String) {
        if self.nondeterminism_error.is_none() {
            self.nondeterminism_error = Some(message);
        }
    }

    /// Subscriptions of a name that can still receive an event: claimed, not
    /// abandoned by a lost select branch, and not yet resolved.
    fn open_subscriptions<'a>(&'a self, name: &'a str) -> impl Iterator<Item = u64> + 'a {
        self.external_subscriptions
            .iter()
            .filter(move |(id, n)| {
                n == name
                    && !self.abandoned_source_ids.contains(id)
                    && !self.resolved_subscriptions.contains(id)
            })
            .map(|(id, _)| *id)
    }

    /// Subscription an undelivered external event resolves against: the k-th
    /// unconsumed event of a name pairs with the k-th open subscription of
    /// that name. An event with no pair is buffered and blocks nothing.
    pub(crate) fn external_pair_source(&self, name: &str, event_id: u64) -> Option<u64> {
        let mut rank = 0usize;
        let mut found = false;
        for e in &self.history {
            if let Event::ExternalEvent {
                event_id: id,
                name: n,
                ..
            } = e
            {
                if n == name && !self.consumed_completions.contains(id) {
                    if *id == event_id {
                        found = true;
                        break;
                    }
                    rank += 1;
                }
            }
        }
        if !found {
            return None;
        }
        self.open_subscriptions(name).nth(rank)
    }

    /// Completions deliver in recorded order: one is consumable only once
    /// every completion recorded before it has been consumed, belongs to an
    /// abandoned branch, or is an external event nothing is waiting on.
    /// Replay of a full history thereby reproduces the exact delivery
    /// sequence the live turns saw, batch boundaries included.
    pub(crate) fn is_consumable(&self, completion_event_id: u64) -> bool {
        self.history.iter().all(|e| match e {
            Event::ActivityCompleted {
                event_id,
                source_event_id,
                ..
            }
            | Event::ActivityFailed {
                event_id,
                source_event_id,
                ..
            }
            | Event::TimerFired {
                event_id,
                source_event_id,
                ..
            }
            | Event::SubOrchestrationCompleted {
                event_id,
                source_event_id,
                ..
            }
            | Event::SubOrchestrationFailed {
                event_id,
                source_event_id,
                ..
            } => {
                *event_id >= completion_event_id
                    || self.consumed_completions.contains(event_id)
                    || self.abandoned_source_ids.contains(source_event_id)
            }
            Event::ExternalEvent { event_id, name, .. } => {
                *event_id >= completion_event_id
                    || self.consumed_completions.contains(event_id)
                    || self.external_pair_source(name, *event_id).is_none()
            }
            _ => true,
        })
    }

    /// The external event an open subscription resolves with, if one arrived.
    pub(crate) fn external_event_for_subscription(
        &self,
        sub_event_id: u64,
        name: &str,
    ) -> Option<(u64, String)> {
        let position = self
            .open_subscriptions(name)
            .position(|id| id == sub_event_id)?;
        self.history
            .iter()
            .filter_map(|e| match e {
                Event::ExternalEvent {
                    event_id,
                    name: n,
                    data,
                } if n == name && !self.consumed_completions.contains(event_id) => {
                    Some((*event_id, data.clone()))
                }
                _ => None,
            })
            .nth(position)
    }

    /// Claim-or-execute for synchronous system operations. On replay the
    /// recorded value is adopted verbatim; at the frontier `compute` runs
    /// exactly once and its value is recorded.
    fn system_call(&mut self, op: String, compute: impl FnOnce() -> String) -> Option<String> {
        if let Some(next) = self.next_unclaimed_scheduling_event() {
            let (next_id, next_label) = (next.event_id(), next.label());
            if let Event::SystemCall {
                event_id,
                op: recorded_op,
                value,
            } = next
            {
                if *recorded_op == op {
                    let (id, value) = (*event_id, value.clone());
                    self.claimed_scheduling_events.insert(id);
                    return Some(value);
                }
                let recorded_op = recorded_op.clone();
                self.set_nondeterminism(format!(
                    "schedule order mismatch: next recorded is SystemCall({recorded_op}) but code executed SystemCall({op})"
                ));
                return None;
            }
            self.set_nondeterminism(format!(
                "schedule order mismatch: next recorded is {next_label}#{next_id} but code executed SystemCall({op})"
            ));
            return None;
        }
        let value = compute();
        let event_id = self.allocate_event_id();
        self.history.push(Event::SystemCall {
            event_id,
            op,
            value: value.clone(),
        });
        self.claimed_scheduling_events.insert(event_id);
        Some(value)
    }
}

pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Deterministic guid derived from the recording coordinates. Uniqueness
/// comes from (instance, execution, event id); no OS entropy is involved.
fn deterministic_guid(instance: &str, execution_id: u64, event_id: u64) -> String {
    use std::hash::{Hash, Hasher};
    let mut h1 = std::collections::hash_map::DefaultHasher::new();
    (instance, execution_id, event_id, 0x5eedu16).hash(&mut h1);
    let a = h1.finish();
    let mut h2 = std::collections::hash_map::DefaultHasher::new();
    (event_id, execution_id, instance, a).hash(&mut h2);
    let b = h2.finish();
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (a >> 32) as u32,
        (a >> 16) as u16,
        a as u16,
        (b >> 48) as u16,
        b & 0xffff_ffff_ffff
    )
}

// ---------------------------------------------------------------------------
// Orchestration context
// ---------------------------------------------------------------------------

/// Handle through which orchestrator code schedules durable work. Cloneable;
/// all clones share the turn's claim/consume bookkeeping.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance: impl Into<String>, execution_id: u64, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(
                instance.into(),
                execution_id,
                history,
            ))),
        }
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut CtxInner) -> R) -> R {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    // -- scheduling primitives ---------------------------------------------

    /// Schedule an activity invocation. Resolves with the activity's
    /// `Result<String, String>` via [`DurableFuture::into_activity`].
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into())
    }

    /// Schedule an activity with typed input/output through the JSON codec.
    pub fn schedule_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> + Send
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        use crate::_typed_codec::{Codec, Json};
        let encoded = Json::encode(input);
        let ctx = self.clone();
        let name = name.into();
        async move {
            let raw = ctx.schedule_activity(name, encoded?).into_activity().await?;
            Json::decode(&raw)
        }
    }

    /// Schedule an activity with retry. Failed attempts back off through
    /// durable timers; the final failure carries the last attempt's error.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> impl Future<Output = Result<String, String>> + Send {
        let ctx = self.clone();
        let name = name.into();
        let input = input.into();
        async move {
            let attempts = policy.max_attempts.max(1);
            let mut delay_ms = policy.first_delay_ms;
            let mut last_err = String::new();
            for attempt in 1..=attempts {
                match ctx.schedule_activity(&name, &input).into_activity().await {
                    Ok(out) => return Ok(out),
                    Err(e) => last_err = e,
                }
                if attempt < attempts {
                    ctx.schedule_timer(delay_ms).into_timer().await;
                    delay_ms = policy.next_delay(delay_ms);
                }
            }
            Err(last_err)
        }
    }

    /// Durable timer. The fire time is computed once at first execution and
    /// persisted; replay never consults the wall clock.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay_ms)
    }

    /// Wait for an external event by name. Events queue FIFO per name:
    /// successive waits consume successive arrivals in recorded order.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    /// Typed external wait through the JSON codec.
    pub fn schedule_wait_typed<T>(
        &self,
        name: impl Into<String>,
    ) -> impl Future<Output = Result<T, String>> + Send
    where
        T: serde::de::DeserializeOwned,
    {
        use crate::_typed_codec::{Codec, Json};
        let ctx = self.clone();
        let name = name.into();
        async move {
            let raw = ctx.schedule_wait(name).into_event().await;
            Json::decode(&raw)
        }
    }

    /// Schedule a sub-orchestration bound by start-time policy. The child
    /// instance id derives from this instance and the scheduling event id.
    pub fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), None, input.into())
    }

    /// Schedule a sub-orchestration pinned to an explicit version.
    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), Some(version.into()), input.into())
    }

    pub fn schedule_sub_orchestration_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> impl Future<Output = Result<String, String>> + Send {
        let ctx = self.clone();
        let name = name.into();
        let input = input.into();
        async move {
            let attempts = policy.max_attempts.max(1);
            let mut delay_ms = policy.first_delay_ms;
            let mut last_err = String::new();
            for attempt in 1..=attempts {
                match ctx
                    .schedule_sub_orchestration(&name, &input)
                    .into_sub_orchestration()
                    .await
                {
                    Ok(out) => return Ok(out),
                    Err(e) => last_err = e,
                }
                if attempt < attempts {
                    ctx.schedule_timer(delay_ms).into_timer().await;
                    delay_ms = policy.next_delay(delay_ms);
                }
            }
            Err(last_err)
        }
    }

    // -- composition -------------------------------------------------------

    /// Race two durable futures; resolves with the winner's index and output.
    /// The loser stays pending: its eventual completion is recorded in
    /// history but never delivered, and the underlying work is not cancelled.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> futures::SelectFuture {
        futures::SelectFuture::new(vec![a, b])
    }

    /// whenAny over an arbitrary set.
    pub fn select(&self, children: Vec<DurableFuture>) -> futures::SelectFuture {
        futures::SelectFuture::new(children)
    }

    /// whenAll: resolves once every child has resolved, with outputs in
    /// scheduling order (the order the children were created).
    pub fn join(&self, children: Vec<DurableFuture>) -> futures::JoinFuture {
        futures::JoinFuture::new(children)
    }

    // -- lifecycle ---------------------------------------------------------

    /// End this execution and restart the orchestration with fresh history
    /// and the given input. The returned future never resolves; the turn ends
    /// at the decision.
    pub fn continue_as_new(
        &self,
        input: impl Into<String>,
    ) -> impl Future<Output = Result<String, String>> + Send {
        self.continue_as_new_inner(input.into(), None)
    }

    /// Continue-as-new pinned to an explicit version instead of re-binding
    /// by policy.
    pub fn continue_as_new_versioned(
        &self,
        input: impl Into<String>,
        version: impl Into<String>,
    ) -> impl Future<Output = Result<String, String>> + Send {
        self.continue_as_new_inner(input.into(), Some(version.into()))
    }

    fn continue_as_new_inner(
        &self,
        input: String,
        version: Option<String>,
    ) -> impl Future<Output = Result<String, String>> + Send {
        struct ContinueAsNewFuture {
            ctx: OrchestrationContext,
            input: String,
            version: Option<String>,
            recorded: Cell<bool>,
        }
        impl Future for ContinueAsNewFuture {
            type Output = Result<String, String>;
            fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
                if !self.recorded.replace(true) {
                    let action = Action::ContinueAsNew {
                        input: self.input.clone(),
                        version: self.version.clone(),
                    };
                    self.ctx.with_inner(|inner| inner.record_action(action));
                }
                Poll::Pending
            }
        }
        ContinueAsNewFuture {
            ctx: self.clone(),
            input,
            version,
            recorded: Cell::new(false),
        }
    }

    // -- replay-safe system operations -------------------------------------

    /// Deterministic guid: recorded as a `SystemCall` event on first
    /// execution and adopted verbatim on replay.
    pub fn new_guid(&self) -> String {
        self.with_inner(|inner| {
            let (instance, execution_id, event_id) =
                (inner.instance.clone(), inner.execution_id, inner.next_event_id);
            inner
                .system_call(SYSCALL_OP_GUID.to_string(), || {
                    deterministic_guid(&instance, execution_id, event_id)
                })
                .unwrap_or_default()
        })
    }

    /// Logical UTC time in milliseconds. Observed once, replayed forever.
    pub fn utcnow_ms(&self) -> u64 {
        self.with_inner(|inner| {
            inner
                .system_call(SYSCALL_OP_UTCNOW_MS.to_string(), || {
                    wall_clock_ms().to_string()
                })
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        })
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace("DEBUG", message.into());
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message.into());
    }

    /// Replay-safe logging: the message is recorded as a `SystemCall` event
    /// and emitted through `tracing` only on the first execution.
    fn trace(&self, level: &str, message: String) {
        self.with_inner(|inner| {
            let instance = inner.instance.clone();
            let op = format!("{SYSCALL_OP_TRACE_PREFIX}{level}:{message}");
            let emit_message = message.clone();
            let emit_level = level.to_string();
            let _ = inner.system_call(op, move || {
                match emit_level.as_str() {
                    "DEBUG" => tracing::debug!(instance = %instance, "{emit_message}"),
                    "WARN" => tracing::warn!(instance = %instance, "{emit_message}"),
                    "ERROR" => tracing::error!(instance = %instance, "{emit_message}"),
                    _ => tracing::info!(instance = %instance, "{emit_message}"),
                }
                String::new()
            });
        });
    }

    // -- custom status -----------------------------------------------------

    /// Set the instance's custom status. Not part of history replay: the
    /// value is committed as instance metadata at the end of the turn,
    /// last write wins.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.with_inner(|inner| {
            inner.custom_status = Some(status.into());
            inner.custom_status_dirty = true;
        });
    }

    pub fn reset_custom_status(&self) {
        self.with_inner(|inner| {
            inner.custom_status = None;
            inner.custom_status_dirty = true;
        });
    }

    pub fn get_custom_status(&self) -> Option<String> {
        self.with_inner(|inner| inner.custom_status.clone())
    }

    // -- introspection -----------------------------------------------------

    pub fn instance_id(&self) -> String {
        self.with_inner(|inner| inner.instance.clone())
    }

    pub fn execution_id(&self) -> u64 {
        self.with_inner(|inner| inner.execution_id)
    }

    pub fn orchestration_name(&self) -> Option<String> {
        self.with_inner(|inner| inner.orchestration_name.clone())
    }

    /// Version pinned in this execution's `OrchestrationStarted` event.
    pub fn orchestration_version(&self) -> Option<String> {
        self.with_inner(|inner| inner.orchestration_version.clone())
    }

    /// True while unclaimed scheduling events remain in history, i.e. the
    /// current poll is reconstructing past progress rather than making new
    /// decisions.
    pub fn is_replaying(&self) -> bool {
        self.with_inner(|inner| inner.is_replaying())
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        self.with_inner(|inner| std::mem::take(&mut inner.actions))
    }
}

// ---------------------------------------------------------------------------
// Turn execution
// ---------------------------------------------------------------------------

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut Pin<Box<F>>) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    fut.as_mut().poll(&mut cx)
}

/// Everything one deterministic turn produces.
pub struct TurnOutcome {
    /// Input history plus the events appended during this turn.
    pub history: Vec<Event>,
    /// Outbound decisions recorded during this turn.
    pub actions: Vec<Action>,
    /// `Some` once the orchestrator function returned.
    pub output: Option<Result<String, String>>,
    /// Set when replay diverged from recorded history.
    pub nondeterminism: Option<String>,
    pub custom_status: Option<String>,
    pub custom_status_dirty: bool,
}

/// Run one deterministic turn: poll the orchestrator with a no-op waker in a
/// fixed-point loop until it returns, diverges, or stops making progress.
///
/// The fixed-point loop matters for combinators: consuming one completion can
/// unblock an earlier-scheduled branch that a prior poll skipped, so polling
/// repeats until the claim/consume counters and recorded actions are stable.
pub fn run_turn_with<F, Fut>(
    instance: impl Into<String>,
    execution_id: u64,
    history: Vec<Event>,
    orchestrator: F,
) -> TurnOutcome
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    run_turn_seeded(instance, execution_id, history, None, orchestrator)
}

/// Single-turn evaluation for tests and tooling: returns the updated
/// history, the recorded decisions, and the output if the orchestrator
/// finished this turn.
pub fn run_turn<F, Fut>(
    instance: impl Into<String>,
    execution_id: u64,
    history: Vec<Event>,
    orchestrator: F,
) -> (Vec<Event>, Vec<Action>, Option<Result<String, String>>)
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let outcome = run_turn_with(instance, execution_id, history, orchestrator);
    (outcome.history, outcome.actions, outcome.output)
}

/// Variant of [`run_turn_with`] that seeds the context with custom status
/// carried over from previous turns.
pub(crate) fn run_turn_seeded<F, Fut>(
    instance: impl Into<String>,
    execution_id: u64,
    history: Vec<Event>,
    custom_status: Option<String>,
    orchestrator: F,
) -> TurnOutcome
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance, execution_id, history);
    ctx.with_inner(|inner| inner.custom_status = custom_status);
    let mut fut = Box::pin(orchestrator(ctx.clone()));
    let mut output = None;
    loop {
        let before = ctx.with_inner(|inner| {
            (
                inner.claimed_scheduling_events.len(),
                inner.consumed_completions.len(),
                inner.actions.len(),
                inner.history.len(),
            )
        });
        match poll_once(&mut fut) {
            Poll::Ready(out) => {
                output = Some(out);
                break;
            }
            Poll::Pending => {
                let (nondet, after) = ctx.with_inner(|inner| {
                    (
                        inner.nondeterminism_error.clone(),
                        (
                            inner.claimed_scheduling_events.len(),
                            inner.consumed_completions.len(),
                            inner.actions.len(),
                            inner.history.len(),
                        ),
                    )
                });
                if nondet.is_some() || after == before {
                    break;
                }
            }
        }
    }
    drop(fut);
    let actions = ctx.take_actions();
    ctx.with_inner(|inner| TurnOutcome {
        history: std::mem::take(&mut inner.history),
        actions,
        output,
        nondeterminism: inner.nondeterminism_error.clone(),
        custom_status: inner.custom_status.clone(),
        custom_status_dirty: inner.custom_status_dirty,
    })
}

// ---------------------------------------------------------------------------
// Typed codec
// ---------------------------------------------------------------------------

/// JSON codec used by the typed registration and client helpers. String in,
/// string out: history only ever stores strings.
pub mod _typed_codec {
    pub trait Codec {
        fn encode<T: serde::Serialize>(value: &T) -> Result<String, String>;
        fn decode<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: serde::Serialize>(value: &T) -> Result<String, String> {
            serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
        }

        fn decode<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, String> {
            serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
        }
    }
}
