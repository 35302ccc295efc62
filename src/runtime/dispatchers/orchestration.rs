//! Orchestration dispatcher: locks an instance's message batch, applies its
//! lifecycle items, runs a replay turn, and commits everything atomically.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::limits::MAX_CUSTOM_STATUS_BYTES;
use super::super::registry::DEFAULT_VERSION;
use super::super::replay_engine::{OrchestrationTurn, TurnResult};
use super::super::state_helpers::{HistoryManager, WorkItemReader};
use super::super::{OrchestrationHandler, Runtime};
use crate::providers::{ExecutionMetadata, OrchestrationItem, ProviderError, WorkItem};
use crate::{Action, AppErrorKind, ConfigErrorKind, ErrorDetails, Event};

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers.
    /// Instance-level locking in the provider keeps two workers off the same
    /// instance.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.orchestration_concurrency;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt
                            .history_store
                            .fetch_orchestration_item(rt.options.orchestrator_lock_timeout)
                            .await
                        {
                            Ok(Some(item)) => {
                                rt.process_orchestration_item(item, &worker_id).await;
                            }
                            Ok(None) => {
                                tokio::time::sleep(Duration::from_millis(rt.options.dispatcher_idle_sleep_ms)).await;
                            }
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "failed to fetch orchestration item");
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

    /// Apply one locked batch to its instance and commit the outcome.
    pub(in crate::runtime) async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem, worker_id: &str) {
        let instance = item.instance.clone();
        let lock_token = item.lock_token.clone();

        // Poison: the batch keeps coming back without ever committing.
        if item.attempt_count > self.options.max_attempts {
            warn!(
                instance = %instance,
                attempt_count = item.attempt_count,
                max_attempts = self.options.max_attempts,
                "batch exceeded max delivery attempts, failing orchestration"
            );
            self.fail_orchestration_as_poison(&item).await;
            return;
        }

        let mgr = HistoryManager::from_history(&item.history);
        let reader = WorkItemReader::from_messages(&item.messages, &mgr, &instance);

        // Stale redelivery for a finished execution: drop the batch. A
        // continued-as-new history stays live only for its rollover item.
        if mgr.is_terminal() && !(mgr.is_continued_as_new() && reader.is_continue_as_new) {
            debug!(
                instance = %instance,
                status = mgr.status(),
                "instance is terminal, acking batch without processing"
            );
            let _ = self
                .ack_orchestration_with_changes(
                    &lock_token,
                    item.execution_id,
                    vec![],
                    vec![],
                    vec![],
                    ExecutionMetadata::default(),
                )
                .await;
            return;
        }

        // Continue-as-new rolls into a fresh execution with empty history.
        let is_rollover = reader.is_continue_as_new && mgr.is_continued_as_new();
        let (execution_id, mut mgr) = if is_rollover {
            (item.execution_id + 1, HistoryManager::from_history(&[]))
        } else {
            (item.execution_id, mgr)
        };

        // Terminate is a hard override: no user code runs, in-flight
        // children are cancelled, and the batch's other messages die with
        // the execution.
        if let Some(reason) = reader.terminate_reason() {
            let reason = reason.to_string();
            self.terminate_orchestration(&item, &reader, mgr, execution_id, reason).await;
            return;
        }

        if !reader.has_orchestration_name() {
            warn!(instance = %instance, "batch has no orchestration context, acking without processing");
            let _ = self
                .ack_orchestration_with_changes(
                    &lock_token,
                    item.execution_id,
                    vec![],
                    vec![],
                    vec![],
                    ExecutionMetadata::default(),
                )
                .await;
            return;
        }

        debug!(
            target: "duraflow::runtime",
            instance = %instance,
            execution_id,
            orchestration = %reader.orchestration_name,
            worker_id = %worker_id,
            is_continue_as_new = reader.is_continue_as_new,
            messages = item.messages.len(),
            "processing batch"
        );

        // Bind a handler and make sure the started event exists.
        let handler = match self.resolve_turn_handler(&mut mgr, &reader) {
            Ok(handler) => handler,
            Err(details) => {
                error!(instance = %instance, error = %details, "cannot bind orchestration handler");
                self.fail_orchestration_with(&item, mgr, execution_id, details).await;
                return;
            }
        };

        let mut turn =
            OrchestrationTurn::new(instance.clone(), execution_id, mgr).with_custom_status(item.custom_status.clone());

        // A rollover opens a fresh execution row. The inherited status must
        // be written through with the first ack or it disappears once
        // current_execution_id advances; an explicit update still wins.
        let inherited_status = (is_rollover && item.custom_status.is_some()).then(|| item.custom_status.clone());

        // Suspension folds in arrival order; only state changes append
        // lifecycle events.
        let mut suspended = turn.manager().is_suspended();
        for control in &reader.control_messages {
            match control {
                WorkItem::SuspendInstance { reason, .. } if !suspended => {
                    debug!(instance = %instance, reason = ?reason, "suspending instance");
                    turn.manager_mut().append(Event::OrchestrationSuspended { event_id: 0 });
                    suspended = true;
                }
                WorkItem::ResumeInstance { reason, .. } if suspended => {
                    debug!(instance = %instance, reason = ?reason, "resuming instance");
                    turn.manager_mut().append(Event::OrchestrationResumed { event_id: 0 });
                    suspended = false;
                }
                _ => {}
            }
        }

        // Materialize completions even while suspended: they buffer in
        // history and replay delivers them after resume.
        if let Err(details) = turn.prep_completions(&reader.completion_messages) {
            warn!(instance = %instance, error = %details, "completion batch diverged from history");
            let (mgr, _) = turn.into_parts();
            self.fail_orchestration_with(&item, mgr, execution_id, details).await;
            return;
        }

        if suspended {
            debug!(instance = %instance, "instance suspended, committing batch without running");
            let metadata = Self::execution_metadata(turn.manager(), None, inherited_status.clone());
            let (mgr, _) = turn.into_parts();
            let _ = self
                .ack_orchestration_with_changes(&lock_token, execution_id, mgr.into_delta(), vec![], vec![], metadata)
                .await;
            return;
        }

        let result = turn.execute(handler);

        // An oversized custom status would bloat every later read of the
        // execution row; fail the orchestration instead of committing it.
        if let Some(Some(status)) = turn.custom_status_update() {
            if status.len() > MAX_CUSTOM_STATUS_BYTES {
                warn!(
                    instance = %instance,
                    size = status.len(),
                    limit = MAX_CUSTOM_STATUS_BYTES,
                    "custom status exceeds size limit, failing orchestration"
                );
                let details = ErrorDetails::Configuration {
                    kind: ConfigErrorKind::LimitExceeded,
                    resource: "custom_status".to_string(),
                    message: Some(format!(
                        "custom status is {} bytes, limit is {MAX_CUSTOM_STATUS_BYTES}",
                        status.len()
                    )),
                };
                let (mgr, _) = turn.into_parts();
                self.fail_orchestration_with(&item, mgr, execution_id, details).await;
                return;
            }
        }

        let mut worker_items: Vec<WorkItem> = Vec::new();
        let mut orchestrator_items: Vec<WorkItem> = Vec::new();
        let mut output: Option<String> = None;

        match result {
            TurnResult::Continue => {
                for action in turn.pending_actions() {
                    match action {
                        Action::CallActivity {
                            scheduling_event_id,
                            name,
                            input,
                        } => {
                            worker_items.push(WorkItem::ActivityExecute {
                                instance: instance.clone(),
                                execution_id,
                                id: *scheduling_event_id,
                                name: name.clone(),
                                input: input.clone(),
                            });
                        }
                        Action::CreateTimer {
                            scheduling_event_id,
                            fire_at_ms,
                        } => {
                            orchestrator_items.push(WorkItem::TimerFired {
                                instance: instance.clone(),
                                execution_id,
                                id: *scheduling_event_id,
                                fire_at_ms: *fire_at_ms,
                            });
                        }
                        Action::StartSubOrchestration {
                            scheduling_event_id,
                            name,
                            version,
                            instance: child,
                            input,
                        } => {
                            orchestrator_items.push(WorkItem::StartOrchestration {
                                instance: child.clone(),
                                orchestration: name.clone(),
                                input: input.clone(),
                                version: version.clone(),
                                parent_instance: Some(instance.clone()),
                                parent_execution_id: Some(execution_id),
                                parent_id: Some(*scheduling_event_id),
                            });
                        }
                        // Stripped out by the turn before it gets here.
                        Action::ContinueAsNew { .. } => {}
                    }
                }
            }
            TurnResult::Completed(value) => {
                debug!(
                    target: "duraflow::runtime",
                    instance = %instance,
                    execution_id,
                    worker_id = %worker_id,
                    history_events = turn.manager().full_history().len() + 1,
                    "orchestration completed"
                );
                turn.manager_mut().append(Event::OrchestrationCompleted {
                    event_id: 0,
                    output: value.clone(),
                });
                if let Some((parent_instance, parent_execution_id, parent_id)) = turn.manager().extract_context().1 {
                    orchestrator_items.push(WorkItem::SubOrchCompleted {
                        parent_instance,
                        parent_execution_id,
                        parent_id,
                        result: value.clone(),
                    });
                }
                output = Some(value);
            }
            TurnResult::Failed(details) => {
                // Application failures are expected business outcomes;
                // configuration and infrastructure failures are operator
                // problems.
                if details.category() == "application" {
                    warn!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        execution_id,
                        worker_id = %worker_id,
                        error = %details,
                        "orchestration failed"
                    );
                } else {
                    error!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        execution_id,
                        worker_id = %worker_id,
                        error_type = details.category(),
                        error = %details,
                        "orchestration failed"
                    );
                }
                turn.manager_mut().append(Event::OrchestrationFailed {
                    event_id: 0,
                    details: details.clone(),
                });
                if let Some((parent_instance, parent_execution_id, parent_id)) = turn.manager().extract_context().1 {
                    orchestrator_items.push(WorkItem::SubOrchFailed {
                        parent_instance,
                        parent_execution_id,
                        parent_id,
                        details: details.clone(),
                    });
                }
                output = Some(details.display_message());
            }
            TurnResult::ContinueAsNew { input, version } => {
                debug!(
                    target: "duraflow::runtime",
                    instance = %instance,
                    execution_id,
                    worker_id = %worker_id,
                    "orchestration continuing as new"
                );
                turn.manager_mut().append(Event::OrchestrationContinuedAsNew {
                    event_id: 0,
                    input: input.clone(),
                });
                let orchestration = turn
                    .manager()
                    .orchestration_name
                    .clone()
                    .unwrap_or_else(|| reader.orchestration_name.clone());
                orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: instance.clone(),
                    orchestration,
                    input,
                    version,
                });
            }
        }

        let metadata = Self::execution_metadata(turn.manager(), output, turn.custom_status_update().or(inherited_status));
        let (mgr, _) = turn.into_parts();

        match self
            .ack_orchestration_with_changes(
                &lock_token,
                execution_id,
                mgr.into_delta(),
                worker_items,
                orchestrator_items,
                metadata,
            )
            .await
        {
            Ok(()) => {}
            Err(e) => {
                // The turn could not commit. Try to pin a terminal
                // infrastructure failure while the lock is still ours;
                // abandon only if even that fails.
                warn!(instance = %instance, error = %e, "failed to commit turn, failing orchestration");
                let infra = e.to_infrastructure_error();

                let mut failure_mgr = HistoryManager::from_history(&item.history);
                failure_mgr.append(Event::OrchestrationFailed {
                    event_id: 0,
                    details: infra.clone(),
                });
                let failure_metadata = Self::execution_metadata(&failure_mgr, Some(infra.display_message()), None);

                match self
                    .ack_orchestration_with_changes(
                        &lock_token,
                        item.execution_id,
                        failure_mgr.into_delta(),
                        vec![],
                        vec![],
                        failure_metadata,
                    )
                    .await
                {
                    Ok(()) => {
                        warn!(instance = %instance, "committed infrastructure failure for instance");
                    }
                    Err(e2) => {
                        warn!(instance = %instance, error = %e2, "could not commit failure event, abandoning lock");
                        if let Err(e3) = self
                            .history_store
                            .abandon_orchestration_item(&lock_token, Some(Duration::from_millis(50)))
                            .await
                        {
                            warn!(instance = %instance, error = %e3, "failed to abandon orchestration item");
                        }
                    }
                }
            }
        }
    }

    /// Bind a handler for this turn and synthesize the started event for a
    /// brand-new execution.
    ///
    /// New executions bind by explicit version or registry policy and pin
    /// the choice in history. Replays bind to the pinned version, subject to
    /// the runtime's `version_match`/`version_miss` options.
    fn resolve_turn_handler(
        &self,
        mgr: &mut HistoryManager,
        reader: &WorkItemReader,
    ) -> Result<Arc<dyn OrchestrationHandler>, ErrorDetails> {
        if mgr.is_empty() {
            let resolved = match &reader.version {
                Some(v_str) => match semver::Version::parse(v_str) {
                    Ok(v) => self
                        .orchestration_registry
                        .resolve_handler_exact(&reader.orchestration_name, &v)
                        .map(|h| (v, h)),
                    Err(_) => None,
                },
                None => self.orchestration_registry.resolve_handler(&reader.orchestration_name),
            };

            match resolved {
                Some((version, handler)) => {
                    mgr.append(Event::OrchestrationStarted {
                        event_id: 0,
                        name: reader.orchestration_name.clone(),
                        version: version.to_string(),
                        input: reader.input.clone(),
                        parent_instance: reader.parent_instance.clone(),
                        parent_execution_id: reader.parent_execution_id,
                        parent_id: reader.parent_id,
                    });
                    Ok(handler)
                }
                None => {
                    // Record the attempt so the failure has a history to
                    // live in. "0.0.0" marks an execution that never bound.
                    mgr.append(Event::OrchestrationStarted {
                        event_id: 0,
                        name: reader.orchestration_name.clone(),
                        version: reader.version.clone().unwrap_or_else(|| "0.0.0".to_string()),
                        input: reader.input.clone(),
                        parent_instance: reader.parent_instance.clone(),
                        parent_execution_id: reader.parent_execution_id,
                        parent_id: reader.parent_id,
                    });
                    Err(match &reader.version {
                        Some(v) => ErrorDetails::Configuration {
                            kind: ConfigErrorKind::VersionNotFound,
                            resource: format!("{}@{v}", reader.orchestration_name),
                            message: None,
                        },
                        None => ErrorDetails::Configuration {
                            kind: ConfigErrorKind::UnregisteredOrchestration,
                            resource: reader.orchestration_name.clone(),
                            message: None,
                        },
                    })
                }
            }
        } else {
            let name = mgr
                .orchestration_name
                .clone()
                .unwrap_or_else(|| reader.orchestration_name.clone());
            let pinned = mgr
                .version()
                .and_then(|v| semver::Version::parse(&v).ok())
                .unwrap_or(DEFAULT_VERSION);

            match self.orchestration_registry.resolve_for_replay(
                &name,
                &pinned,
                self.options.version_match,
                self.options.version_miss,
            ) {
                Some((_, handler)) => Ok(handler),
                None if !self.orchestration_registry.has(&name) => Err(ErrorDetails::Configuration {
                    kind: ConfigErrorKind::UnregisteredOrchestration,
                    resource: name,
                    message: None,
                }),
                None => Err(ErrorDetails::Configuration {
                    kind: ConfigErrorKind::VersionNotFound,
                    resource: format!("{name}@{pinned}"),
                    message: None,
                }),
            }
        }
    }

    /// Hard-stop an execution without running user code. Children still in
    /// flight are terminated too, and a parent waiting on this instance gets
    /// a failure completion.
    async fn terminate_orchestration(
        self: &Arc<Self>,
        item: &OrchestrationItem,
        reader: &WorkItemReader,
        mut mgr: HistoryManager,
        execution_id: u64,
        reason: String,
    ) {
        let instance = &item.instance;
        warn!(instance = %instance, reason = %reason, "terminating orchestration");

        // An instance terminated before its first turn still needs a history.
        if mgr.is_empty() {
            let name = if reader.has_orchestration_name() {
                reader.orchestration_name.clone()
            } else {
                item.orchestration_name.clone()
            };
            mgr.append(Event::OrchestrationStarted {
                event_id: 0,
                name,
                version: reader.version.clone().unwrap_or_else(|| item.version.clone()),
                input: reader.input.clone(),
                parent_instance: reader.parent_instance.clone(),
                parent_execution_id: reader.parent_execution_id,
                parent_id: reader.parent_id,
            });
        }

        // Cascade to children with no completion recorded yet.
        let mut orchestrator_items: Vec<WorkItem> = Vec::new();
        let history = mgr.full_history();
        for event in &history {
            if let Event::SubOrchestrationScheduled {
                event_id,
                instance: child,
                ..
            } = event
            {
                let finished = history.iter().any(|e| {
                    matches!(
                        e,
                        Event::SubOrchestrationCompleted { source_event_id, .. }
                        | Event::SubOrchestrationFailed { source_event_id, .. }
                        if source_event_id == event_id
                    )
                });
                if !finished {
                    debug!(instance = %instance, child = %child, "cascading terminate to sub-orchestration");
                    orchestrator_items.push(WorkItem::TerminateInstance {
                        instance: child.clone(),
                        reason: reason.clone(),
                    });
                }
            }
        }

        mgr.append(Event::OrchestrationTerminated {
            event_id: 0,
            reason: reason.clone(),
        });

        if let Some((parent_instance, parent_execution_id, parent_id)) = mgr.extract_context().1 {
            orchestrator_items.push(WorkItem::SubOrchFailed {
                parent_instance,
                parent_execution_id,
                parent_id,
                details: ErrorDetails::Application {
                    kind: AppErrorKind::SubOrchestrationFailed,
                    message: format!("terminated: {reason}"),
                    retryable: false,
                },
            });
        }

        let metadata = Self::execution_metadata(&mgr, Some(reason), None);
        let _ = self
            .ack_orchestration_with_changes(
                &item.lock_token,
                execution_id,
                mgr.into_delta(),
                vec![],
                orchestrator_items,
                metadata,
            )
            .await;
    }

    /// Record a terminal failure for the execution and notify its parent.
    async fn fail_orchestration_with(
        self: &Arc<Self>,
        item: &OrchestrationItem,
        mut mgr: HistoryManager,
        execution_id: u64,
        details: ErrorDetails,
    ) {
        mgr.append(Event::OrchestrationFailed {
            event_id: 0,
            details: details.clone(),
        });

        let mut orchestrator_items = Vec::new();
        if let Some((parent_instance, parent_execution_id, parent_id)) = mgr.extract_context().1 {
            orchestrator_items.push(WorkItem::SubOrchFailed {
                parent_instance,
                parent_execution_id,
                parent_id,
                details: details.clone(),
            });
        }

        let metadata = Self::execution_metadata(&mgr, Some(details.display_message()), None);
        let _ = self
            .ack_orchestration_with_changes(
                &item.lock_token,
                execution_id,
                mgr.into_delta(),
                vec![],
                orchestrator_items,
                metadata,
            )
            .await;
    }

    /// The batch was delivered more times than allowed: record a terminal
    /// infrastructure failure instead of processing it again.
    async fn fail_orchestration_as_poison(self: &Arc<Self>, item: &OrchestrationItem) {
        let details = ErrorDetails::Infrastructure {
            operation: "dispatch".to_string(),
            message: format!(
                "batch redelivered {} times (max {})",
                item.attempt_count, self.options.max_attempts
            ),
            retryable: false,
        };

        let mut mgr = HistoryManager::from_history(&item.history);
        if mgr.is_empty() {
            // The instance never ran; pull its identity from the start
            // message when there is one.
            let (name, input, version, parent_instance, parent_execution_id, parent_id) = item
                .messages
                .iter()
                .find_map(|msg| match msg {
                    WorkItem::StartOrchestration {
                        orchestration,
                        input,
                        version,
                        parent_instance,
                        parent_execution_id,
                        parent_id,
                        ..
                    } => Some((
                        orchestration.clone(),
                        input.clone(),
                        version.clone(),
                        parent_instance.clone(),
                        *parent_execution_id,
                        *parent_id,
                    )),
                    WorkItem::ContinueAsNew {
                        orchestration,
                        input,
                        version,
                        ..
                    } => Some((orchestration.clone(), input.clone(), version.clone(), None, None, None)),
                    _ => None,
                })
                .unwrap_or_else(|| (item.orchestration_name.clone(), String::new(), None, None, None, None));

            mgr.append(Event::OrchestrationStarted {
                event_id: 0,
                name,
                version: version.unwrap_or_else(|| item.version.clone()),
                input,
                parent_instance,
                parent_execution_id,
                parent_id,
            });
        }

        self.fail_orchestration_with(item, mgr, item.execution_id, details).await;
    }

    /// Commit a turn, retrying transient provider errors with backoff.
    ///
    /// Returns the error with the lock still held, so the caller can decide
    /// between committing a failure event and abandoning.
    pub(in crate::runtime) async fn ack_orchestration_with_changes(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut attempts: u32 = 0;
        let max_attempts: u32 = 5;

        loop {
            match self
                .history_store
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    history_delta.clone(),
                    worker_items.clone(),
                    orchestrator_items.clone(),
                    metadata.clone(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    warn!(error = %e, "ack_orchestration_item failed with non-retryable error");
                    return Err(e);
                }
                Err(e) if attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff_ms, error = %e, "ack_orchestration_item failed, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(attempts, error = %e, "ack_orchestration_item failed after retries");
                    return Err(e);
                }
            }
        }
    }

    /// Execution-row state implied by the manager after this turn.
    fn execution_metadata(
        mgr: &HistoryManager,
        output: Option<String>,
        custom_status: Option<Option<String>>,
    ) -> ExecutionMetadata {
        ExecutionMetadata {
            orchestration_name: mgr.orchestration_name.clone(),
            orchestration_version: mgr.orchestration_version.clone(),
            parent_instance: mgr.parent_instance.clone(),
            status: Some(mgr.status().to_string()),
            output,
            custom_status,
        }
    }
}
