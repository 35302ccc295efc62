//! Durable awaitables returned by [`OrchestrationContext`] scheduling calls.
//!
//! Every future polls in two steps. First it claims the next unclaimed
//! scheduling event: on replay that event must match what the code just
//! scheduled (anything else is a determinism violation), at the frontier a
//! fresh event is appended and the matching decision recorded. Second it
//! looks for its completion, which only delivers once every completion
//! recorded before it has been delivered or abandoned. Replaying a full
//! history therefore walks the exact delivery sequence the live turns saw.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, CtxInner, Event, OrchestrationContext};

/// Resolved value of a [`DurableFuture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

enum Kind {
    Activity { name: String, input: String },
    Timer { delay_ms: u64 },
    External { name: String },
    SubOrchestration {
        name: String,
        version: Option<String>,
        input: String,
    },
}

/// A pending durable operation. Lazy: nothing is claimed or recorded until
/// the first poll, so constructing one without awaiting it schedules nothing.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    claimed: Cell<Option<u64>>,
    consumed: Cell<bool>,
}

fn describe_scheduling_event(e: &Event) -> String {
    match e {
        Event::ActivityScheduled { name, input, .. } => {
            format!("ActivityScheduled('{name}', '{input}')")
        }
        Event::TimerCreated { fire_at_ms, .. } => format!("TimerCreated(@{fire_at_ms})"),
        Event::ExternalSubscribed { name, .. } => format!("ExternalSubscribed('{name}')"),
        Event::SubOrchestrationScheduled { name, input, .. } => {
            format!("SubOrchestrationScheduled('{name}', '{input}')")
        }
        Event::SystemCall { op, .. } => format!("SystemCall({op})"),
        other => format!("{}#{}", other.label(), other.event_id()),
    }
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self::new(ctx, Kind::Activity { name, input })
    }

    pub(crate) fn timer(ctx: OrchestrationContext, delay_ms: u64) -> Self {
        Self::new(ctx, Kind::Timer { delay_ms })
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self::new(ctx, Kind::External { name })
    }

    pub(crate) fn sub_orchestration(
        ctx: OrchestrationContext,
        name: String,
        version: Option<String>,
        input: String,
    ) -> Self {
        Self::new(
            ctx,
            Kind::SubOrchestration {
                name,
                version,
                input,
            },
        )
    }

    fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            ctx,
            kind,
            claimed: Cell::new(None),
            consumed: Cell::new(false),
        }
    }

    fn describe(&self) -> String {
        match &self.kind {
            Kind::Activity { name, input } => format!("ActivityScheduled('{name}', '{input}')"),
            Kind::Timer { delay_ms } => format!("TimerCreated(+{delay_ms}ms)"),
            Kind::External { name } => format!("ExternalSubscribed('{name}')"),
            Kind::SubOrchestration { name, input, .. } => {
                format!("SubOrchestrationScheduled('{name}', '{input}')")
            }
        }
    }

    fn claim_matches(&self, event: &Event) -> bool {
        match (&self.kind, event) {
            (
                Kind::Activity { name, input },
                Event::ActivityScheduled {
                    name: n, input: i, ..
                },
            ) => n == name && i == input,
            (Kind::Timer { .. }, Event::TimerCreated { .. }) => true,
            (Kind::External { name }, Event::ExternalSubscribed { name: n, .. }) => n == name,
            (
                Kind::SubOrchestration { name, input, .. },
                Event::SubOrchestrationScheduled {
                    name: n, input: i, ..
                },
            ) => n == name && i == input,
            _ => false,
        }
    }

    /// Append this operation's scheduling event at the replay frontier and
    /// record the decision that carries it out of the instance.
    fn record_scheduling(&self, inner: &mut CtxInner) -> u64 {
        let event_id = inner.allocate_event_id();
        match &self.kind {
            Kind::Activity { name, input } => {
                inner.history.push(Event::ActivityScheduled {
                    event_id,
                    name: name.clone(),
                    input: input.clone(),
                });
                inner.record_action(Action::CallActivity {
                    scheduling_event_id: event_id,
                    name: name.clone(),
                    input: input.clone(),
                });
            }
            Kind::Timer { delay_ms } => {
                // Computed once and persisted; replay adopts the recorded
                // fire time and never consults the clock again.
                let fire_at_ms = crate::wall_clock_ms().saturating_add(*delay_ms);
                inner.history.push(Event::TimerCreated { event_id, fire_at_ms });
                inner.record_action(Action::CreateTimer {
                    scheduling_event_id: event_id,
                    fire_at_ms,
                });
            }
            Kind::External { name } => {
                // Subscriptions produce no outbound work; raising the event
                // is the other side's job.
                inner.history.push(Event::ExternalSubscribed {
                    event_id,
                    name: name.clone(),
                });
                inner.external_subscriptions.push((event_id, name.clone()));
            }
            Kind::SubOrchestration {
                name,
                version,
                input,
            } => {
                let instance = format!("{}::sub::{event_id}", inner.instance);
                inner.history.push(Event::SubOrchestrationScheduled {
                    event_id,
                    name: name.clone(),
                    instance: instance.clone(),
                    input: input.clone(),
                });
                inner.record_action(Action::StartSubOrchestration {
                    scheduling_event_id: event_id,
                    name: name.clone(),
                    version: version.clone(),
                    instance,
                    input: input.clone(),
                });
            }
        }
        inner.claimed_scheduling_events.insert(event_id);
        event_id
    }

    /// Claim step. Returns the scheduling event id, or `None` when the turn
    /// has already diverged or diverges here.
    pub(crate) fn ensure_claimed(&self) -> Option<u64> {
        if let Some(id) = self.claimed.get() {
            return Some(id);
        }
        self.ctx.with_inner(|inner| {
            if inner.nondeterminism_error.is_some() {
                return None;
            }
            let next = inner
                .next_unclaimed_scheduling_event()
                .map(|e| (e.event_id(), self.claim_matches(e), describe_scheduling_event(e)));
            let event_id = match next {
                Some((event_id, true, _)) => {
                    inner.claimed_scheduling_events.insert(event_id);
                    if let Kind::External { name } = &self.kind {
                        inner.external_subscriptions.push((event_id, name.clone()));
                    }
                    event_id
                }
                Some((_, false, recorded)) => {
                    let scheduled = self.describe();
                    inner.set_nondeterminism(format!(
                        "schedule order mismatch: next recorded is {recorded} but code scheduled {scheduled}"
                    ));
                    return None;
                }
                None => self.record_scheduling(inner),
            };
            self.claimed.set(Some(event_id));
            Some(event_id)
        })
    }

    /// Completion step: deliver this operation's result if it is recorded and
    /// next in line.
    pub(crate) fn try_consume(&self, claimed_id: u64) -> Option<DurableOutput> {
        self.ctx.with_inner(|inner| match &self.kind {
            Kind::Activity { .. } => {
                let (completion_id, result) = inner.history.iter().find_map(|e| match e {
                    Event::ActivityCompleted {
                        event_id,
                        source_event_id,
                        result,
                    } if *source_event_id == claimed_id => Some((*event_id, Ok(result.clone()))),
                    Event::ActivityFailed {
                        event_id,
                        source_event_id,
                        details,
                    } if *source_event_id == claimed_id => {
                        Some((*event_id, Err(details.display_message())))
                    }
                    _ => None,
                })?;
                if !inner.is_consumable(completion_id) {
                    return None;
                }
                inner.consumed_completions.insert(completion_id);
                Some(DurableOutput::Activity(result))
            }
            Kind::Timer { .. } => {
                let completion_id = inner.history.iter().find_map(|e| match e {
                    Event::TimerFired {
                        event_id,
                        source_event_id,
                        ..
                    } if *source_event_id == claimed_id => Some(*event_id),
                    _ => None,
                })?;
                if !inner.is_consumable(completion_id) {
                    return None;
                }
                inner.consumed_completions.insert(completion_id);
                Some(DurableOutput::Timer)
            }
            Kind::External { name } => {
                let (event_id, data) = inner.external_event_for_subscription(claimed_id, name)?;
                if !inner.is_consumable(event_id) {
                    return None;
                }
                inner.consumed_completions.insert(event_id);
                inner.resolved_subscriptions.insert(claimed_id);
                Some(DurableOutput::External(data))
            }
            Kind::SubOrchestration { .. } => {
                let (completion_id, result) = inner.history.iter().find_map(|e| match e {
                    Event::SubOrchestrationCompleted {
                        event_id,
                        source_event_id,
                        result,
                    } if *source_event_id == claimed_id => Some((*event_id, Ok(result.clone()))),
                    Event::SubOrchestrationFailed {
                        event_id,
                        source_event_id,
                        details,
                    } if *source_event_id == claimed_id => {
                        Some((*event_id, Err(details.display_message())))
                    }
                    _ => None,
                })?;
                if !inner.is_consumable(completion_id) {
                    return None;
                }
                inner.consumed_completions.insert(completion_id);
                Some(DurableOutput::SubOrchestration(result))
            }
        })
    }

    // -- typed adapters ----------------------------------------------------

    /// Await as an activity result.
    ///
    /// Panics when used on a future produced by anything other than
    /// [`OrchestrationContext::schedule_activity`].
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> + Send {
        async move {
            match self.await {
                DurableOutput::Activity(result) => result,
                other => panic!("into_activity used on a non-activity future: {other:?}"),
            }
        }
    }

    /// Await a timer's firing.
    pub fn into_timer(self) -> impl Future<Output = ()> + Send {
        async move {
            match self.await {
                DurableOutput::Timer => (),
                other => panic!("into_timer used on a non-timer future: {other:?}"),
            }
        }
    }

    /// Await an external event's payload.
    pub fn into_event(self) -> impl Future<Output = String> + Send {
        async move {
            match self.await {
                DurableOutput::External(data) => data,
                other => panic!("into_event used on a non-external future: {other:?}"),
            }
        }
    }

    /// Await a sub-orchestration result.
    pub fn into_sub_orchestration(self) -> impl Future<Output = Result<String, String>> + Send {
        async move {
            match self.await {
                DurableOutput::SubOrchestration(result) => result,
                other => {
                    panic!("into_sub_orchestration used on a non-sub-orchestration future: {other:?}")
                }
            }
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.consumed.get() {
            return Poll::Pending;
        }
        let claimed_id = match this.ensure_claimed() {
            Some(id) => id,
            None => return Poll::Pending,
        };
        match this.try_consume(claimed_id) {
            Some(output) => {
                this.consumed.set(true);
                Poll::Ready(output)
            }
            None => Poll::Pending,
        }
    }
}

/// whenAny: resolves with the first branch whose completion delivers, by
/// construction index. Losers are left pending and their source ids marked
/// abandoned so late completions never wedge delivery for the rest of the
/// instance.
pub struct SelectFuture {
    children: Vec<DurableFuture>,
    resolved: bool,
}

impl SelectFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        Self {
            children,
            resolved: false,
        }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.resolved {
            return Poll::Pending;
        }
        // Claim every branch first, in construction order, so the scheduling
        // sequence is identical on every replay no matter which branch wins.
        let mut ids = Vec::with_capacity(this.children.len());
        for child in &this.children {
            match child.ensure_claimed() {
                Some(id) => ids.push(id),
                None => return Poll::Pending,
            }
        }
        for (index, child) in this.children.iter().enumerate() {
            if let Some(output) = child.try_consume(ids[index]) {
                child.ctx.with_inner(|inner| {
                    for (loser, id) in ids.iter().enumerate() {
                        if loser != index {
                            inner.abandoned_source_ids.insert(*id);
                        }
                    }
                });
                this.resolved = true;
                return Poll::Ready((index, output));
            }
        }
        Poll::Pending
    }
}

/// whenAll: resolves once every branch has resolved, outputs in construction
/// order. Failures do not short-circuit; each slot carries its own result.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    outputs: Vec<Option<DurableOutput>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        let outputs = (0..children.len()).map(|_| None).collect();
        Self { children, outputs }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut ids = Vec::with_capacity(this.children.len());
        for child in &this.children {
            match child.ensure_claimed() {
                Some(id) => ids.push(id),
                None => return Poll::Pending,
            }
        }
        // Completions deliver in recorded order, and delivering one can put
        // the next in line, so sweep until a full pass delivers nothing.
        loop {
            let mut progressed = false;
            for (index, child) in this.children.iter().enumerate() {
                if this.outputs[index].is_none() {
                    if let Some(output) = child.try_consume(ids[index]) {
                        this.outputs[index] = Some(output);
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        if this.outputs.iter().all(|o| o.is_some()) {
            Poll::Ready(this.outputs.drain(..).flatten().collect())
        } else {
            Poll::Pending
        }
    }
}
