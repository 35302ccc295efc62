use crate::{providers::WorkItem, Event};
use tracing::warn;

/// One execution's recorded history plus the delta being built this turn.
///
/// Histories are stored per execution, so there is at most one
/// `OrchestrationStarted` and the lifecycle state is whatever the latest
/// lifecycle event says. Metadata from the start event is cached; lifecycle
/// queries scan delta-then-history so appends made mid-turn are visible
/// immediately.
#[derive(Debug, Clone)]
pub struct HistoryManager {
    /// Orchestration name (from OrchestrationStarted)
    pub orchestration_name: Option<String>,

    /// Pinned version (from OrchestrationStarted)
    pub orchestration_version: Option<String>,

    /// Input this execution started with
    pub orchestration_input: Option<String>,

    /// Parent linkage if this is a sub-orchestration
    pub parent_instance: Option<String>,
    pub parent_execution_id: Option<u64>,
    pub parent_id: Option<u64>,

    history: Vec<Event>,

    /// New events to be committed with this turn
    delta: Vec<Event>,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        let mut mgr = Self {
            orchestration_name: None,
            orchestration_version: None,
            orchestration_input: None,
            parent_instance: None,
            parent_execution_id: None,
            parent_id: None,
            history: history.to_vec(),
            delta: Vec::new(),
        };

        for event in history {
            if let Event::OrchestrationStarted {
                name,
                version,
                input,
                parent_instance,
                parent_execution_id,
                parent_id,
                ..
            } = event
            {
                mgr.orchestration_name = Some(name.clone());
                mgr.orchestration_version = Some(version.clone());
                mgr.orchestration_input = Some(input.clone());
                mgr.parent_instance = parent_instance.clone();
                mgr.parent_execution_id = *parent_execution_id;
                mgr.parent_id = *parent_id;
                break;
            }
        }

        mgr
    }

    /// Runtime status implied by the latest lifecycle event, delta included.
    pub fn status(&self) -> &'static str {
        for event in self.delta.iter().rev().chain(self.history.iter().rev()) {
            match event {
                Event::OrchestrationCompleted { .. } => return "Completed",
                Event::OrchestrationFailed { .. } => return "Failed",
                Event::OrchestrationContinuedAsNew { .. } => return "ContinuedAsNew",
                Event::OrchestrationTerminated { .. } => return "Terminated",
                Event::OrchestrationSuspended { .. } => return "Suspended",
                Event::OrchestrationResumed { .. } => return "Running",
                _ => {}
            }
        }
        "Running"
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), "Completed" | "Failed" | "ContinuedAsNew" | "Terminated")
    }

    pub fn is_suspended(&self) -> bool {
        self.status() == "Suspended"
    }

    pub fn is_continued_as_new(&self) -> bool {
        self.status() == "ContinuedAsNew"
    }

    /// True when nothing has been recorded or appended yet (brand new
    /// instance before its first turn).
    pub fn is_empty(&self) -> bool {
        self.history.is_empty() && self.delta.is_empty()
    }

    /// Next free event id across history and delta.
    pub fn next_event_id(&self) -> u64 {
        self.history
            .iter()
            .chain(self.delta.iter())
            .map(|e| e.event_id())
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Append an event to the delta, assigning it the next event id.
    pub fn append(&mut self, mut event: Event) -> u64 {
        let id = self.next_event_id();
        event.set_event_id(id);
        if let Event::OrchestrationStarted {
            name,
            version,
            input,
            parent_instance,
            parent_execution_id,
            parent_id,
            ..
        } = &event
        {
            self.orchestration_name = Some(name.clone());
            self.orchestration_version = Some(version.clone());
            self.orchestration_input = Some(input.clone());
            self.parent_instance = parent_instance.clone();
            self.parent_execution_id = *parent_execution_id;
            self.parent_id = *parent_id;
        }
        self.delta.push(event);
        id
    }

    /// Extend the delta with events whose ids are already assigned.
    pub fn extend(&mut self, events: Vec<Event>) {
        self.delta.extend(events);
    }

    pub fn delta(&self) -> &[Event] {
        &self.delta
    }

    pub fn into_delta(self) -> Vec<Event> {
        self.delta
    }

    pub fn history(&self) -> &[Event] {
        &self.history
    }

    pub fn full_history(&self) -> Vec<Event> {
        [&self.history[..], &self.delta[..]].concat()
    }

    /// Pinned version. "0.0.0" is the unregistered placeholder and reads as
    /// `None`.
    pub fn version(&self) -> Option<String> {
        self.orchestration_version.clone().filter(|v| v != "0.0.0")
    }

    pub fn input(&self) -> Option<&str> {
        self.orchestration_input.as_deref()
    }

    /// Input and parent linkage for driving a turn.
    pub fn extract_context(&self) -> (String, Option<(String, u64, u64)>) {
        let input = self.orchestration_input.clone().unwrap_or_default();
        let parent_link = match (&self.parent_instance, self.parent_execution_id, self.parent_id) {
            (Some(pinst), Some(pexec), Some(pid)) => Some((pinst.clone(), pexec, pid)),
            _ => None,
        };
        (input, parent_link)
    }
}

/// One fetched message batch, split by role.
///
/// Start/CAN items bind the execution, completion messages feed the replay,
/// and control messages (terminate/suspend/resume) change lifecycle state
/// without running orchestration code.
#[derive(Debug)]
pub struct WorkItemReader {
    pub start_item: Option<WorkItem>,

    /// Completions, in arrival order
    pub completion_messages: Vec<WorkItem>,

    /// Terminate/suspend/resume, in arrival order
    pub control_messages: Vec<WorkItem>,

    /// Orchestration name (from the start item, falling back to history)
    pub orchestration_name: String,

    /// Input (from the start item, empty otherwise)
    pub input: String,

    /// Requested version (from the start item)
    pub version: Option<String>,

    pub parent_instance: Option<String>,
    pub parent_execution_id: Option<u64>,
    pub parent_id: Option<u64>,

    pub is_continue_as_new: bool,
}

impl WorkItemReader {
    pub fn from_messages(messages: &[WorkItem], history_mgr: &HistoryManager, instance: &str) -> Self {
        let mut start_item: Option<WorkItem> = None;
        let mut completion_messages: Vec<WorkItem> = Vec::new();
        let mut control_messages: Vec<WorkItem> = Vec::new();

        for work_item in messages {
            match work_item {
                WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. } => {
                    if start_item.is_some() {
                        warn!(instance, "duplicate start/continue-as-new in batch, ignoring");
                        continue;
                    }
                    start_item = Some(work_item.clone());
                }
                WorkItem::ActivityCompleted { .. }
                | WorkItem::ActivityFailed { .. }
                | WorkItem::TimerFired { .. }
                | WorkItem::ExternalRaised { .. }
                | WorkItem::SubOrchCompleted { .. }
                | WorkItem::SubOrchFailed { .. } => {
                    completion_messages.push(work_item.clone());
                }
                WorkItem::TerminateInstance { .. }
                | WorkItem::SuspendInstance { .. }
                | WorkItem::ResumeInstance { .. } => {
                    control_messages.push(work_item.clone());
                }
                // Worker-queue items never belong in an orchestrator batch
                WorkItem::ActivityExecute { .. } => {
                    warn!(instance, "activity execute in orchestrator batch, dropping");
                }
            }
        }

        let (orchestration_name, input, version, parent_instance, parent_execution_id, parent_id, is_continue_as_new) =
            match &start_item {
                Some(WorkItem::StartOrchestration {
                    orchestration,
                    input,
                    version,
                    parent_instance,
                    parent_execution_id,
                    parent_id,
                    ..
                }) => (
                    orchestration.clone(),
                    input.clone(),
                    version.clone(),
                    parent_instance.clone(),
                    *parent_execution_id,
                    *parent_id,
                    false,
                ),
                Some(WorkItem::ContinueAsNew {
                    orchestration,
                    input,
                    version,
                    ..
                }) => (orchestration.clone(), input.clone(), version.clone(), None, None, None, true),
                _ => {
                    let orchestration_name = history_mgr.orchestration_name.clone().unwrap_or_else(|| {
                        if !completion_messages.is_empty() {
                            warn!(instance, "completion messages for unstarted instance");
                        }
                        String::new()
                    });
                    (orchestration_name, String::new(), None, None, None, None, false)
                }
            };

        Self {
            start_item,
            completion_messages,
            control_messages,
            orchestration_name,
            input,
            version,
            parent_instance,
            parent_execution_id,
            parent_id,
            is_continue_as_new,
        }
    }

    pub fn has_start_item(&self) -> bool {
        self.start_item.is_some()
    }

    pub fn has_orchestration_name(&self) -> bool {
        !self.orchestration_name.is_empty()
    }

    /// First terminate reason in the batch, if any. Terminate always wins
    /// over everything else fetched alongside it.
    pub fn terminate_reason(&self) -> Option<&str> {
        self.control_messages.iter().find_map(|m| match m {
            WorkItem::TerminateInstance { reason, .. } => Some(reason.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AppErrorKind, ErrorDetails};

    fn started(input: &str) -> Event {
        Event::OrchestrationStarted {
            event_id: 1,
            name: "test-orch".to_string(),
            version: "1.0.0".to_string(),
            input: input.to_string(),
            parent_instance: None,
            parent_execution_id: None,
            parent_id: None,
        }
    }

    #[test]
    fn empty_history_reads_as_running() {
        let mgr = HistoryManager::from_history(&[]);
        assert!(mgr.orchestration_name.is_none());
        assert!(mgr.is_empty());
        assert!(!mgr.is_terminal());
        assert_eq!(mgr.status(), "Running");
        assert_eq!(mgr.next_event_id(), 1);
    }

    #[test]
    fn started_history_exposes_metadata() {
        let mgr = HistoryManager::from_history(&[started("test-input")]);
        assert_eq!(mgr.orchestration_name.as_deref(), Some("test-orch"));
        assert_eq!(mgr.orchestration_version.as_deref(), Some("1.0.0"));
        assert_eq!(mgr.input(), Some("test-input"));
        assert!(!mgr.is_terminal());
        assert_eq!(mgr.next_event_id(), 2);
    }

    #[test]
    fn terminal_events_drive_status() {
        let completed = vec![
            started("in"),
            Event::OrchestrationCompleted {
                event_id: 2,
                output: "done".to_string(),
            },
        ];
        assert_eq!(HistoryManager::from_history(&completed).status(), "Completed");
        assert!(HistoryManager::from_history(&completed).is_terminal());

        let failed = vec![
            started("in"),
            Event::OrchestrationFailed {
                event_id: 2,
                details: ErrorDetails::Application {
                    kind: AppErrorKind::OrchestrationFailed,
                    message: "boom".to_string(),
                    retryable: false,
                },
            },
        ];
        assert_eq!(HistoryManager::from_history(&failed).status(), "Failed");

        let terminated = vec![
            started("in"),
            Event::OrchestrationTerminated {
                event_id: 2,
                reason: "operator".to_string(),
            },
        ];
        assert_eq!(HistoryManager::from_history(&terminated).status(), "Terminated");
    }

    #[test]
    fn suspension_toggles_with_resume() {
        let mut mgr = HistoryManager::from_history(&[started("in")]);
        assert!(!mgr.is_suspended());

        mgr.append(Event::OrchestrationSuspended { event_id: 0 });
        assert!(mgr.is_suspended());
        assert_eq!(mgr.status(), "Suspended");
        assert!(!mgr.is_terminal());

        mgr.append(Event::OrchestrationResumed { event_id: 0 });
        assert!(!mgr.is_suspended());
        assert_eq!(mgr.status(), "Running");
    }

    #[test]
    fn append_assigns_sequential_event_ids() {
        let mut mgr = HistoryManager::from_history(&[started("in")]);
        let id = mgr.append(Event::ActivityScheduled {
            event_id: 0,
            name: "A".to_string(),
            input: String::new(),
        });
        assert_eq!(id, 2);
        assert_eq!(mgr.next_event_id(), 3);
        assert_eq!(mgr.delta().len(), 1);
        assert_eq!(mgr.full_history().len(), 2);
    }

    #[test]
    fn version_in_delta_counts_and_placeholder_reads_none() {
        let mut mgr = HistoryManager::from_history(&[]);
        assert_eq!(mgr.version(), None);
        mgr.append(started("in"));
        assert_eq!(mgr.version().as_deref(), Some("1.0.0"));

        let unregistered = Event::OrchestrationStarted {
            event_id: 1,
            name: "ghost".to_string(),
            version: "0.0.0".to_string(),
            input: String::new(),
            parent_instance: None,
            parent_execution_id: None,
            parent_id: None,
        };
        assert_eq!(HistoryManager::from_history(&[unregistered]).version(), None);
    }

    #[test]
    fn extract_context_returns_parent_linkage() {
        let history = vec![Event::OrchestrationStarted {
            event_id: 1,
            name: "child".to_string(),
            version: "1.0.0".to_string(),
            input: "payload".to_string(),
            parent_instance: Some("parent-1".to_string()),
            parent_execution_id: Some(1),
            parent_id: Some(42),
        }];
        let (input, parent) = HistoryManager::from_history(&history).extract_context();
        assert_eq!(input, "payload");
        assert_eq!(parent, Some(("parent-1".to_string(), 1, 42)));
    }

    fn start_message(instance: &str) -> WorkItem {
        WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: "test-orch".to_string(),
            input: "test-input".to_string(),
            version: Some("1.0.0".to_string()),
            parent_instance: Some("parent".to_string()),
            parent_execution_id: Some(1),
            parent_id: Some(42),
        }
    }

    #[test]
    fn reader_splits_start_from_completions() {
        let messages = vec![
            start_message("i1"),
            WorkItem::ActivityCompleted {
                instance: "i1".to_string(),
                execution_id: 1,
                id: 2,
                result: "result".to_string(),
            },
        ];

        let mgr = HistoryManager::from_history(&[]);
        let reader = WorkItemReader::from_messages(&messages, &mgr, "i1");

        assert!(reader.has_start_item());
        assert_eq!(reader.orchestration_name, "test-orch");
        assert_eq!(reader.input, "test-input");
        assert_eq!(reader.version.as_deref(), Some("1.0.0"));
        assert_eq!(reader.parent_instance.as_deref(), Some("parent"));
        assert_eq!(reader.parent_execution_id, Some(1));
        assert_eq!(reader.parent_id, Some(42));
        assert!(!reader.is_continue_as_new);
        assert_eq!(reader.completion_messages.len(), 1);
        assert!(reader.control_messages.is_empty());
    }

    #[test]
    fn reader_recognizes_continue_as_new() {
        let messages = vec![WorkItem::ContinueAsNew {
            instance: "i1".to_string(),
            orchestration: "test-orch".to_string(),
            input: "new-input".to_string(),
            version: Some("2.0.0".to_string()),
        }];

        let mgr = HistoryManager::from_history(&[]);
        let reader = WorkItemReader::from_messages(&messages, &mgr, "i1");

        assert!(reader.has_start_item());
        assert!(reader.is_continue_as_new);
        assert_eq!(reader.input, "new-input");
        assert_eq!(reader.version.as_deref(), Some("2.0.0"));
        assert_eq!(reader.parent_instance, None);
    }

    #[test]
    fn reader_takes_name_from_history_when_no_start() {
        let messages = vec![WorkItem::TimerFired {
            instance: "i1".to_string(),
            execution_id: 1,
            id: 2,
            fire_at_ms: 1000,
        }];

        let mgr = HistoryManager::from_history(&[started("in")]);
        let reader = WorkItemReader::from_messages(&messages, &mgr, "i1");

        assert!(!reader.has_start_item());
        assert_eq!(reader.orchestration_name, "test-orch");
        assert_eq!(reader.input, "");
        assert_eq!(reader.completion_messages.len(), 1);
    }

    #[test]
    fn reader_ignores_duplicate_start() {
        let mut second = start_message("i1");
        if let WorkItem::StartOrchestration { orchestration, .. } = &mut second {
            *orchestration = "other-orch".to_string();
        }
        let messages = vec![start_message("i1"), second];

        let mgr = HistoryManager::from_history(&[]);
        let reader = WorkItemReader::from_messages(&messages, &mgr, "i1");
        assert_eq!(reader.orchestration_name, "test-orch");
    }

    #[test]
    fn reader_buckets_control_messages_and_finds_terminate() {
        let messages = vec![
            WorkItem::SuspendInstance {
                instance: "i1".to_string(),
                reason: None,
            },
            WorkItem::TerminateInstance {
                instance: "i1".to_string(),
                reason: "operator".to_string(),
            },
            WorkItem::ResumeInstance {
                instance: "i1".to_string(),
                reason: None,
            },
        ];

        let mgr = HistoryManager::from_history(&[started("in")]);
        let reader = WorkItemReader::from_messages(&messages, &mgr, "i1");

        assert!(reader.completion_messages.is_empty());
        assert_eq!(reader.control_messages.len(), 3);
        assert_eq!(reader.terminate_reason(), Some("operator"));
    }
}
