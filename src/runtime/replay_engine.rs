//! One orchestration turn: materialize a completion batch into history,
//! then drive the orchestrator function over the combined history.
//!
//! Completion delivery order is what makes replay deterministic, so this
//! module owns the ordering rule: within a batch, completions append in
//! scheduling order of the work they answer (arrival order breaks ties).
//! Whatever order history records is the order replay consumes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use super::state_helpers::HistoryManager;
use super::OrchestrationHandler;
use crate::providers::WorkItem;
use crate::{Action, AppErrorKind, ErrorDetails, Event};

/// What a turn decided about the execution's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// Still waiting on outstanding work.
    Continue,
    /// The orchestrator function returned `Ok`.
    Completed(String),
    /// The orchestrator function returned `Err`, diverged from history, or
    /// panicked.
    Failed(ErrorDetails),
    /// The orchestrator asked to roll into a fresh execution.
    ContinueAsNew { input: String, version: Option<String> },
}

/// Unpaired external events sort after everything with a recorded
/// scheduling event.
const UNPAIRED_KEY: u64 = u64::MAX;

pub struct OrchestrationTurn {
    instance: String,
    execution_id: u64,
    mgr: HistoryManager,
    pending_actions: Vec<Action>,
    custom_status: Option<String>,
    custom_status_dirty: bool,
}

impl OrchestrationTurn {
    pub fn new(instance: impl Into<String>, execution_id: u64, mgr: HistoryManager) -> Self {
        let custom_status = None;
        Self {
            instance: instance.into(),
            execution_id,
            mgr,
            pending_actions: Vec::new(),
            custom_status,
            custom_status_dirty: false,
        }
    }

    /// Seed the turn with the custom status committed by previous turns.
    pub fn with_custom_status(mut self, custom_status: Option<String>) -> Self {
        self.custom_status = custom_status;
        self
    }

    pub fn manager(&self) -> &HistoryManager {
        &self.mgr
    }

    pub fn manager_mut(&mut self) -> &mut HistoryManager {
        &mut self.mgr
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    pub fn made_progress(&self) -> bool {
        !self.mgr.delta().is_empty() || !self.pending_actions.is_empty()
    }

    /// Custom status update to commit: `None` when unchanged this turn.
    pub fn custom_status_update(&self) -> Option<Option<String>> {
        if self.custom_status_dirty {
            Some(self.custom_status.clone())
        } else {
            None
        }
    }

    pub fn into_parts(self) -> (HistoryManager, Vec<Action>) {
        (self.mgr, self.pending_actions)
    }

    /// Materialize a completion batch into the history delta.
    ///
    /// Messages for other executions and duplicates of already-recorded
    /// completions are dropped. A completion that answers nothing in
    /// history, or answers an event of the wrong kind, is a determinism
    /// violation and fails the turn. External events are never dropped for
    /// a live execution: without an open subscription they still append,
    /// buffered until code subscribes.
    ///
    /// Returns the number of events appended.
    pub fn prep_completions(&mut self, completions: &[WorkItem]) -> Result<usize, ErrorDetails> {
        let recorded = self.mgr.full_history();
        // Source ids answered in this batch; a second answer is a duplicate.
        let mut claimed: std::collections::HashSet<u64> = std::collections::HashSet::new();
        // Positional external pairing: the k-th recorded event for a name
        // consumed the k-th subscription.
        let mut external_seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

        let mut prepared: Vec<(u64, Event)> = Vec::new();
        for message in completions {
            match message {
                WorkItem::ActivityCompleted {
                    execution_id,
                    id,
                    result,
                    ..
                } => {
                    if self.stale(*execution_id, *id) {
                        continue;
                    }
                    if self.duplicate(&recorded, &mut claimed, *id) {
                        continue;
                    }
                    self.verify_source(&recorded, *id, "ActivityScheduled")?;
                    prepared.push((
                        *id,
                        Event::ActivityCompleted {
                            event_id: 0,
                            source_event_id: *id,
                            result: result.clone(),
                        },
                    ));
                }
                WorkItem::ActivityFailed {
                    execution_id,
                    id,
                    details,
                    ..
                } => {
                    if self.stale(*execution_id, *id) {
                        continue;
                    }
                    if self.duplicate(&recorded, &mut claimed, *id) {
                        continue;
                    }
                    self.verify_source(&recorded, *id, "ActivityScheduled")?;
                    prepared.push((
                        *id,
                        Event::ActivityFailed {
                            event_id: 0,
                            source_event_id: *id,
                            details: details.clone(),
                        },
                    ));
                }
                WorkItem::TimerFired {
                    execution_id,
                    id,
                    fire_at_ms,
                    ..
                } => {
                    if self.stale(*execution_id, *id) {
                        continue;
                    }
                    if self.duplicate(&recorded, &mut claimed, *id) {
                        continue;
                    }
                    self.verify_source(&recorded, *id, "TimerCreated")?;
                    prepared.push((
                        *id,
                        Event::TimerFired {
                            event_id: 0,
                            source_event_id: *id,
                            fire_at_ms: *fire_at_ms,
                        },
                    ));
                }
                WorkItem::SubOrchCompleted {
                    parent_execution_id,
                    parent_id,
                    result,
                    ..
                } => {
                    if self.stale(*parent_execution_id, *parent_id) {
                        continue;
                    }
                    if self.duplicate(&recorded, &mut claimed, *parent_id) {
                        continue;
                    }
                    self.verify_source(&recorded, *parent_id, "SubOrchestrationScheduled")?;
                    prepared.push((
                        *parent_id,
                        Event::SubOrchestrationCompleted {
                            event_id: 0,
                            source_event_id: *parent_id,
                            result: result.clone(),
                        },
                    ));
                }
                WorkItem::SubOrchFailed {
                    parent_execution_id,
                    parent_id,
                    details,
                    ..
                } => {
                    if self.stale(*parent_execution_id, *parent_id) {
                        continue;
                    }
                    if self.duplicate(&recorded, &mut claimed, *parent_id) {
                        continue;
                    }
                    self.verify_source(&recorded, *parent_id, "SubOrchestrationScheduled")?;
                    prepared.push((
                        *parent_id,
                        Event::SubOrchestrationFailed {
                            event_id: 0,
                            source_event_id: *parent_id,
                            details: details.clone(),
                        },
                    ));
                }
                WorkItem::ExternalRaised { name, data, .. } => {
                    let position = external_seen.entry(name.clone()).or_insert(0);
                    let key = pair_external(&recorded, name, *position);
                    *position += 1;
                    prepared.push((
                        key,
                        Event::ExternalEvent {
                            event_id: 0,
                            name: name.clone(),
                            data: data.clone(),
                        },
                    ));
                }
                other => {
                    warn!(instance = %self.instance, item = ?other, "non-completion in completion batch, dropping");
                }
            }
        }

        // Scheduling order of the answered work decides delivery order;
        // stable sort keeps arrival order for ties and unpaired externals.
        prepared.sort_by_key(|(key, _)| *key);

        let appended = prepared.len();
        for (_, event) in prepared {
            self.mgr.append(event);
        }
        Ok(appended)
    }

    /// Drive the orchestrator function over the combined history.
    ///
    /// The function is polled to a fixed point with completions resolved
    /// purely from history, so this never blocks on real work. New
    /// scheduling events land in the delta; the outbound decisions become
    /// [`pending_actions`](Self::pending_actions).
    pub fn execute(&mut self, handler: Arc<dyn OrchestrationHandler>) -> TurnResult {
        let seed = self.mgr.full_history();
        let seed_len = seed.len();
        let (input, _) = self.mgr.extract_context();

        let instance = self.instance.clone();
        let execution_id = self.execution_id;
        let custom_status = self.custom_status.clone();

        let run = catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn_seeded(instance, execution_id, seed, custom_status, move |ctx| {
                let handler = handler.clone();
                async move { handler.invoke(ctx, input).await }
            })
        }));

        let mut outcome = match run {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(instance = %self.instance, panic = %msg, "orchestration panicked");
                return TurnResult::Failed(ErrorDetails::nondeterminism(format!(
                    "orchestration panicked: {msg}"
                )));
            }
        };

        let new_events = outcome.history.split_off(seed_len);
        self.mgr.extend(new_events);
        self.custom_status = outcome.custom_status;
        self.custom_status_dirty |= outcome.custom_status_dirty;

        if let Some(msg) = outcome.nondeterminism {
            return TurnResult::Failed(ErrorDetails::nondeterminism(msg));
        }

        // Continue-as-new wins over a return value; anything else scheduled
        // in the same turn is abandoned with the old execution.
        let mut can: Option<(String, Option<String>)> = None;
        outcome.actions.retain(|action| match action {
            Action::ContinueAsNew { input, version } => {
                can = Some((input.clone(), version.clone()));
                false
            }
            _ => true,
        });
        if let Some((input, version)) = can {
            self.pending_actions.clear();
            return TurnResult::ContinueAsNew { input, version };
        }
        self.pending_actions = outcome.actions;

        match outcome.output {
            Some(Ok(output)) => TurnResult::Completed(output),
            Some(Err(error)) => TurnResult::Failed(ErrorDetails::Application {
                kind: AppErrorKind::OrchestrationFailed,
                message: error,
                retryable: false,
            }),
            None => TurnResult::Continue,
        }
    }

    fn stale(&self, execution_id: u64, id: u64) -> bool {
        if execution_id != self.execution_id {
            debug!(
                instance = %self.instance,
                completion_execution = execution_id,
                current_execution = self.execution_id,
                id,
                "dropping completion for another execution"
            );
            return true;
        }
        false
    }

    fn duplicate(
        &self,
        recorded: &[Event],
        claimed: &mut std::collections::HashSet<u64>,
        id: u64,
    ) -> bool {
        let already_recorded = recorded.iter().any(|e| {
            matches!(
                e,
                Event::ActivityCompleted { source_event_id, .. }
                | Event::ActivityFailed { source_event_id, .. }
                | Event::TimerFired { source_event_id, .. }
                | Event::SubOrchestrationCompleted { source_event_id, .. }
                | Event::SubOrchestrationFailed { source_event_id, .. }
                if *source_event_id == id
            )
        });
        if already_recorded || !claimed.insert(id) {
            debug!(instance = %self.instance, id, "dropping duplicate completion");
            return true;
        }
        false
    }

    fn verify_source(&self, recorded: &[Event], id: u64, expected: &str) -> Result<(), ErrorDetails> {
        match recorded.iter().find(|e| e.event_id() == id) {
            Some(event) if event.label() == expected => Ok(()),
            Some(event) => Err(ErrorDetails::nondeterminism(format!(
                "completion kind mismatch for id={id}, expected '{expected}', got '{}'",
                event.label()
            ))),
            None => Err(ErrorDetails::nondeterminism(format!(
                "no matching schedule for completion id={id}"
            ))),
        }
    }
}

/// Sort key for the `position`-th external event of `name` in this batch:
/// the event id of the subscription it pairs with, or [`UNPAIRED_KEY`]
/// when every open subscription is already answered.
fn pair_external(recorded: &[Event], name: &str, position: usize) -> u64 {
    let subscriptions: Vec<u64> = recorded
        .iter()
        .filter_map(|e| match e {
            Event::ExternalSubscribed { event_id, name: n } if n == name => Some(*event_id),
            _ => None,
        })
        .collect();
    let delivered = recorded
        .iter()
        .filter(|e| matches!(e, Event::ExternalEvent { name: n, .. } if n == name))
        .count();

    subscriptions
        .get(delivered + position)
        .copied()
        .unwrap_or(UNPAIRED_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FnOrchestration;

    fn started() -> Event {
        Event::OrchestrationStarted {
            event_id: 1,
            name: "Order".to_string(),
            version: "1.0.0".to_string(),
            input: "\"in\"".to_string(),
            parent_instance: None,
            parent_execution_id: None,
            parent_id: None,
        }
    }

    fn activity_scheduled(event_id: u64, name: &str) -> Event {
        Event::ActivityScheduled {
            event_id,
            name: name.to_string(),
            input: String::new(),
        }
    }

    fn activity_completed_item(id: u64, result: &str) -> WorkItem {
        WorkItem::ActivityCompleted {
            instance: "i1".to_string(),
            execution_id: 1,
            id,
            result: result.to_string(),
        }
    }

    fn turn_over(history: Vec<Event>) -> OrchestrationTurn {
        OrchestrationTurn::new("i1", 1, HistoryManager::from_history(&history))
    }

    #[test]
    fn completions_append_in_scheduling_order() {
        let mut turn = turn_over(vec![
            started(),
            activity_scheduled(2, "A"),
            activity_scheduled(3, "B"),
        ]);

        // B's result arrived first; A scheduled earlier so it lands first
        let appended = turn
            .prep_completions(&[activity_completed_item(3, "\"b\""), activity_completed_item(2, "\"a\"")])
            .unwrap();
        assert_eq!(appended, 2);

        let delta = turn.manager().delta();
        assert!(
            matches!(&delta[0], Event::ActivityCompleted { event_id: 4, source_event_id: 2, .. }),
            "unexpected first completion: {:?}",
            delta[0]
        );
        assert!(
            matches!(&delta[1], Event::ActivityCompleted { event_id: 5, source_event_id: 3, .. }),
            "unexpected second completion: {:?}",
            delta[1]
        );
    }

    #[test]
    fn duplicate_completions_are_dropped() {
        let mut turn = turn_over(vec![
            started(),
            activity_scheduled(2, "A"),
            Event::ActivityCompleted {
                event_id: 3,
                source_event_id: 2,
                result: "\"first\"".to_string(),
            },
        ]);

        // Already recorded, and repeated inside the batch
        let appended = turn
            .prep_completions(&[activity_completed_item(2, "\"again\""), activity_completed_item(2, "\"again\"")])
            .unwrap();
        assert_eq!(appended, 0);
        assert!(turn.manager().delta().is_empty());
    }

    #[test]
    fn stale_execution_completions_are_dropped() {
        let mut turn = turn_over(vec![started(), activity_scheduled(2, "A")]);
        let stale = WorkItem::ActivityCompleted {
            instance: "i1".to_string(),
            execution_id: 7,
            id: 2,
            result: "\"old\"".to_string(),
        };
        assert_eq!(turn.prep_completions(&[stale]).unwrap(), 0);
    }

    #[test]
    fn completion_for_wrong_kind_is_nondeterministic() {
        let mut turn = turn_over(vec![
            started(),
            Event::TimerCreated {
                event_id: 2,
                fire_at_ms: 1000,
            },
        ]);
        let err = turn
            .prep_completions(&[activity_completed_item(2, "\"x\"")])
            .unwrap_err();
        assert!(err.is_nondeterminism());
        assert!(err.display_message().contains("completion kind mismatch for id=2"));
    }

    #[test]
    fn completion_without_schedule_is_nondeterministic() {
        let mut turn = turn_over(vec![started()]);
        let err = turn
            .prep_completions(&[activity_completed_item(9, "\"x\"")])
            .unwrap_err();
        assert!(err.is_nondeterminism());
        assert!(err.display_message().contains("no matching schedule for completion id=9"));
    }

    #[test]
    fn external_events_pair_with_subscriptions_and_buffer_without() {
        let mut turn = turn_over(vec![
            started(),
            activity_scheduled(2, "A"),
            Event::ExternalSubscribed {
                event_id: 3,
                name: "Approval".to_string(),
            },
        ]);

        let raise = |data: &str| WorkItem::ExternalRaised {
            instance: "i1".to_string(),
            name: "Approval".to_string(),
            data: data.to_string(),
        };

        // Second Approval has no open subscription: it buffers after the
        // paired one and after the activity completion.
        let appended = turn
            .prep_completions(&[raise("\"late\""), activity_completed_item(2, "\"a\""), raise("\"extra\"")])
            .unwrap();
        assert_eq!(appended, 3);

        let delta = turn.manager().delta();
        assert!(matches!(&delta[0], Event::ActivityCompleted { source_event_id: 2, .. }));
        assert!(matches!(&delta[1], Event::ExternalEvent { data, .. } if data == "\"late\""));
        assert!(matches!(&delta[2], Event::ExternalEvent { data, .. } if data == "\"extra\""));
    }

    #[test]
    fn execute_records_schedules_then_completes_on_replay() {
        let handler: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(
            |ctx: crate::OrchestrationContext, _input: String| async move {
                let greeting = ctx.schedule_activity("Greet", "\"w\"").into_activity().await?;
                Ok(greeting)
            },
        ));

        let mut turn = turn_over(vec![started()]);
        let result = turn.execute(handler.clone());
        assert_eq!(result, TurnResult::Continue);
        assert_eq!(turn.pending_actions().len(), 1);
        assert!(matches!(
            turn.manager().delta(),
            [Event::ActivityScheduled { event_id: 2, .. }]
        ));

        // Next turn: completion recorded, replay finishes
        let (mgr, _) = turn.into_parts();
        let mut turn = OrchestrationTurn::new("i1", 1, HistoryManager::from_history(&mgr.full_history()));
        turn.prep_completions(&[activity_completed_item(2, "\"hello\"")]).unwrap();
        let result = turn.execute(handler);
        assert_eq!(result, TurnResult::Completed("\"hello\"".to_string()));
        assert!(turn.pending_actions().is_empty());
    }

    #[test]
    fn execute_maps_user_error_to_failed() {
        let handler: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(
            |_ctx: crate::OrchestrationContext, _input: String| async move { Err("bad order".to_string()) },
        ));
        let mut turn = turn_over(vec![started()]);
        match turn.execute(handler) {
            TurnResult::Failed(ErrorDetails::Application { kind, message, .. }) => {
                assert_eq!(kind, AppErrorKind::OrchestrationFailed);
                assert_eq!(message, "bad order");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn execute_surfaces_continue_as_new_decision() {
        let handler: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(
            |ctx: crate::OrchestrationContext, _input: String| async move {
                ctx.continue_as_new("\"round 2\"").await
            },
        ));
        let mut turn = turn_over(vec![started()]);
        match turn.execute(handler) {
            TurnResult::ContinueAsNew { input, version } => {
                assert_eq!(input, "\"round 2\"");
                assert_eq!(version, None);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(turn.pending_actions().is_empty());
    }

    #[test]
    fn execute_turns_panic_into_nondeterminism_failure() {
        let handler: Arc<dyn OrchestrationHandler> = Arc::new(FnOrchestration(
            |_ctx: crate::OrchestrationContext, _input: String| async move {
                panic!("boom");
                #[allow(unreachable_code)]
                Ok(String::new())
            },
        ));
        let mut turn = turn_over(vec![started()]);
        match turn.execute(handler) {
            TurnResult::Failed(details) => {
                assert!(details.is_nondeterminism());
                assert!(details.display_message().contains("boom"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
