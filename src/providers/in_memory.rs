//! In-memory provider for tests and examples.
//!
//! One mutex guards all state, which makes every operation atomic the same
//! way a SQLite transaction does. Queue semantics (visibility delays,
//! instance locks, attempt counts) match the SQLite provider so runtime
//! behavior is identical across the two. Nothing survives process restart.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::Mutex;

use super::{
    ExecutionMetadata, InstanceMetadata, OrchestrationItem, Provider, ProviderError, WorkItem,
};
use crate::Event;

struct ExecutionRow {
    status: String,
    output: Option<String>,
    custom_status: Option<String>,
    history: Vec<Event>,
}

struct InstanceRow {
    orchestration_name: String,
    version: String,
    current_execution_id: u64,
    parent_instance: Option<String>,
    executions: BTreeMap<u64, ExecutionRow>,
}

struct QueuedMessage {
    item: WorkItem,
    visible_at: u64,
    /// Marker linking the message to the fetch that grabbed it. Stale after
    /// lock expiry; the next fetch overwrites it.
    lock_token: Option<String>,
    locked_until: u64,
    attempt_count: u32,
}

struct InstanceLock {
    lock_token: String,
    locked_until: u64,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceRow>,
    orchestrator_queue: Vec<QueuedMessage>,
    worker_queue: Vec<QueuedMessage>,
    instance_locks: HashMap<String, InstanceLock>,
    token_counter: u64,
}

impl State {
    fn next_lock_token(&mut self) -> String {
        self.token_counter += 1;
        format!("lock-{}", self.token_counter)
    }
}

#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

fn timestamp_after(delay: Option<Duration>) -> u64 {
    match delay {
        Some(d) => crate::wall_clock_ms().saturating_add(d.as_millis() as u64),
        None => crate::wall_clock_ms(),
    }
}

fn queued(item: WorkItem, visible_at: u64) -> QueuedMessage {
    QueuedMessage {
        item,
        visible_at,
        lock_token: None,
        locked_until: 0,
        attempt_count: 0,
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut s = self.state.lock().await;
        let now = crate::wall_clock_ms();

        // Candidate: first visible message whose instance is unlocked (or the
        // lock expired). Message-level tokens do not gate selection; the
        // instance lock is the real mutual exclusion.
        let instance = s
            .orchestrator_queue
            .iter()
            .find(|m| {
                m.visible_at <= now
                    && s.instance_locks
                        .get(m.item.instance())
                        .is_none_or(|l| l.locked_until <= now)
            })
            .map(|m| m.item.instance().to_string());
        let Some(instance) = instance else {
            return Ok(None);
        };

        // Resolve metadata before mutating anything so a dead end leaves the
        // queue untouched.
        let peeked: Vec<&WorkItem> = s
            .orchestrator_queue
            .iter()
            .filter(|m| m.item.instance() == instance && m.visible_at <= now)
            .map(|m| &m.item)
            .collect();
        // Only a committed execution row counts: register_instance creates
        // the instance row before any turn has run.
        let committed = s
            .instances
            .get(&instance)
            .and_then(|row| row.executions.get(&row.current_execution_id).map(|exec| (row, exec)));
        let resolved = match committed {
            Some((row, exec)) => Some((
                row.orchestration_name.clone(),
                row.version.clone(),
                row.current_execution_id,
                exec.history.clone(),
                exec.custom_status.clone(),
            )),
            // Nothing dispatched yet: derive name and version from the start
            // message.
            None => peeked.iter().find_map(|item| match item {
                WorkItem::StartOrchestration {
                    orchestration,
                    version,
                    ..
                }
                | WorkItem::ContinueAsNew {
                    orchestration,
                    version,
                    ..
                } => Some((
                    orchestration.clone(),
                    version.clone().unwrap_or_else(|| "unknown".to_string()),
                    1,
                    Vec::new(),
                    None,
                )),
                _ => None,
            }),
        };
        let Some((orchestration_name, version, execution_id, history, custom_status)) = resolved
        else {
            // A batch with no start message for an undispatched instance can
            // never form an item. Push it back so it does not shadow runnable
            // instances at the head of the queue.
            for m in s
                .orchestrator_queue
                .iter_mut()
                .filter(|m| m.item.instance() == instance && m.visible_at <= now)
            {
                m.visible_at = now.saturating_add(100);
            }
            return Ok(None);
        };

        let lock_token = s.next_lock_token();
        let locked_until = now.saturating_add(lock_timeout.as_millis() as u64);
        s.instance_locks.insert(
            instance.clone(),
            InstanceLock {
                lock_token: lock_token.clone(),
                locked_until,
            },
        );

        // Mark every visible message for the instance with our token, stale
        // markers from expired locks included, and count the delivery.
        let mut messages = Vec::new();
        let mut attempt_count = 0u32;
        for m in s
            .orchestrator_queue
            .iter_mut()
            .filter(|m| m.item.instance() == instance && m.visible_at <= now)
        {
            m.lock_token = Some(lock_token.clone());
            m.locked_until = locked_until;
            m.attempt_count += 1;
            attempt_count = attempt_count.max(m.attempt_count);
            messages.push(m.item.clone());
        }

        Ok(Some(OrchestrationItem {
            instance,
            orchestration_name,
            version,
            execution_id,
            history,
            messages,
            custom_status,
            lock_token,
            attempt_count,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let now = crate::wall_clock_ms();

        let instance = s
            .instance_locks
            .iter()
            .find(|(_, l)| l.lock_token == lock_token)
            .map(|(i, _)| i.clone())
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "invalid lock token"))?;
        if s.instance_locks[&instance].locked_until <= now {
            s.instance_locks.remove(&instance);
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                "instance lock expired",
            ));
        }

        // Delete only the messages this fetch marked; later arrivals stay
        // queued for the next turn.
        s.orchestrator_queue
            .retain(|m| m.lock_token.as_deref() != Some(lock_token));

        let row = s
            .instances
            .entry(instance.clone())
            .or_insert_with(|| InstanceRow {
                orchestration_name: metadata
                    .orchestration_name
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                version: metadata
                    .orchestration_version
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                current_execution_id: execution_id,
                parent_instance: metadata.parent_instance.clone(),
                executions: BTreeMap::new(),
            });
        if let Some(name) = &metadata.orchestration_name {
            row.orchestration_name = name.clone();
        }
        if let Some(version) = &metadata.orchestration_version {
            row.version = version.clone();
        }
        row.current_execution_id = row.current_execution_id.max(execution_id);

        let exec = row.executions.entry(execution_id).or_insert_with(|| ExecutionRow {
            status: "Running".to_string(),
            output: None,
            custom_status: None,
            history: Vec::new(),
        });
        exec.history.extend(history_delta);
        if let Some(status) = metadata.status {
            exec.status = status;
            exec.output = metadata.output;
        }
        if let Some(update) = metadata.custom_status {
            exec.custom_status = update;
        }

        for item in worker_items {
            s.worker_queue.push(queued(item, now));
        }
        for item in orchestrator_items {
            let visible_at = match &item {
                WorkItem::TimerFired { fire_at_ms, .. } => *fire_at_ms,
                _ => now,
            };
            s.orchestrator_queue.push(queued(item, visible_at));
        }

        s.instance_locks.remove(&instance);
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let now = crate::wall_clock_ms();

        let instance = s
            .instance_locks
            .iter()
            .find(|(_, l)| l.lock_token == lock_token)
            .map(|(i, _)| i.clone())
            .ok_or_else(|| {
                ProviderError::permanent("abandon_orchestration_item", "invalid lock token")
            })?;
        s.instance_locks.remove(&instance);

        if let Some(delay) = delay {
            let visible_at = now.saturating_add(delay.as_millis() as u64);
            for m in s
                .orchestrator_queue
                .iter_mut()
                .filter(|m| m.item.instance() == instance && m.visible_at <= now)
            {
                m.visible_at = visible_at;
            }
        }
        Ok(())
    }

    async fn register_instance(
        &self,
        instance: &str,
        orchestration: &str,
        version: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        s.instances
            .entry(instance.to_string())
            .or_insert_with(|| InstanceRow {
                orchestration_name: orchestration.to_string(),
                version: version.unwrap_or("unknown").to_string(),
                current_execution_id: 1,
                parent_instance: None,
                executions: BTreeMap::new(),
            });
        Ok(())
    }

    async fn enqueue_for_orchestrator(
        &self,
        item: WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let visible_at = timestamp_after(delay);
        let mut s = self.state.lock().await;
        s.orchestrator_queue.push(queued(item, visible_at));
        Ok(())
    }

    async fn enqueue_for_worker(&self, item: WorkItem) -> Result<(), ProviderError> {
        let visible_at = crate::wall_clock_ms();
        let mut s = self.state.lock().await;
        s.worker_queue.push(queued(item, visible_at));
        Ok(())
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String, u32)>, ProviderError> {
        let mut s = self.state.lock().await;
        let now = crate::wall_clock_ms();
        let lock_token = s.next_lock_token();
        let locked_until = now.saturating_add(lock_timeout.as_millis() as u64);

        let Some(m) = s
            .worker_queue
            .iter_mut()
            .find(|m| m.visible_at <= now && (m.lock_token.is_none() || m.locked_until <= now))
        else {
            return Ok(None);
        };
        m.lock_token = Some(lock_token.clone());
        m.locked_until = locked_until;
        m.attempt_count += 1;
        Ok(Some((m.item.clone(), lock_token, m.attempt_count)))
    }

    async fn ack_work_item(
        &self,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let before = s.worker_queue.len();
        s.worker_queue
            .retain(|m| m.lock_token.as_deref() != Some(lock_token));
        if s.worker_queue.len() == before {
            return Err(ProviderError::permanent(
                "ack_work_item",
                "invalid lock token or already acked",
            ));
        }

        if let Some(completion) = completion {
            match &completion {
                WorkItem::ActivityCompleted { .. } | WorkItem::ActivityFailed { .. } => {}
                _ => {
                    return Err(ProviderError::permanent(
                        "ack_work_item",
                        "invalid completion type for worker ack",
                    ));
                }
            }
            let visible_at = crate::wall_clock_ms();
            s.orchestrator_queue.push(queued(completion, visible_at));
        }
        Ok(())
    }

    async fn abandon_work_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let visible_at = timestamp_after(delay);
        let mut s = self.state.lock().await;
        let Some(m) = s
            .worker_queue
            .iter_mut()
            .find(|m| m.lock_token.as_deref() == Some(lock_token))
        else {
            return Err(ProviderError::permanent(
                "abandon_work_item",
                "invalid lock token or already acked",
            ));
        };
        m.lock_token = None;
        m.locked_until = 0;
        m.visible_at = visible_at;
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s.instances
            .get(instance)
            .and_then(|row| row.executions.get(&row.current_execution_id))
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn read_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s.instances
            .get(instance)
            .and_then(|row| row.executions.get(&execution_id))
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s.instances
            .get(instance)
            .and_then(|r| r.executions.keys().next_back().copied()))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let s = self.state.lock().await;
        let mut out: Vec<String> = s.instances.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s.instances
            .get(instance)
            .map(|r| r.executions.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn get_instance_metadata(
        &self,
        instance: &str,
    ) -> Result<Option<InstanceMetadata>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s.instances.get(instance).map(|row| {
            let exec = row.executions.get(&row.current_execution_id);
            InstanceMetadata {
                instance: instance.to_string(),
                orchestration_name: row.orchestration_name.clone(),
                version: row.version.clone(),
                execution_id: row.current_execution_id,
                // No execution row: registered but never dispatched
                status: exec
                    .map(|e| e.status.clone())
                    .unwrap_or_else(|| "Pending".to_string()),
                output: exec.and_then(|e| e.output.clone()),
                custom_status: exec.and_then(|e| e.custom_status.clone()),
                parent_instance: row.parent_instance.clone(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_item(instance: &str) -> WorkItem {
        WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: "Order".to_string(),
            input: "\"in\"".to_string(),
            version: Some("1.0.0".to_string()),
            parent_instance: None,
            parent_execution_id: None,
            parent_id: None,
        }
    }

    fn started_event() -> Event {
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

    fn running_metadata() -> ExecutionMetadata {
        ExecutionMetadata {
            orchestration_name: Some("Order".to_string()),
            orchestration_version: Some("1.0.0".to_string()),
            status: Some("Running".to_string()),
            ..Default::default()
        }
    }

    const LOCK: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn start_message_produces_item_and_locks_instance() {
        let p = InMemoryProvider::new();
        p.enqueue_for_orchestrator(start_item("i1"), None).await.unwrap();

        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.instance, "i1");
        assert_eq!(item.orchestration_name, "Order");
        assert_eq!(item.version, "1.0.0");
        assert_eq!(item.execution_id, 1);
        assert!(item.history.is_empty());
        assert_eq!(item.messages.len(), 1);
        assert_eq!(item.attempt_count, 1);

        // Instance is locked; nothing else to fetch.
        assert!(p.fetch_orchestration_item(LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registered_instance_is_pending_until_first_ack() {
        let p = InMemoryProvider::new();
        p.register_instance("i1", "Order", Some("1.0.0")).await.unwrap();

        let meta = p.get_instance_metadata("i1").await.unwrap().unwrap();
        assert_eq!(meta.status, "Pending");
        assert_eq!(p.latest_execution_id("i1").await.unwrap(), None);

        // A stray completion cannot form an item while nothing has run.
        p.enqueue_for_orchestrator(
            WorkItem::ExternalRaised {
                instance: "i1".to_string(),
                name: "Poke".to_string(),
                data: "{}".to_string(),
            },
            None,
        )
        .await
        .unwrap();
        assert!(p.fetch_orchestration_item(LOCK).await.unwrap().is_none());

        p.enqueue_for_orchestrator(start_item("i1"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.messages.len(), 2);
        p.ack_orchestration_item(&item.lock_token, 1, vec![started_event()], vec![], vec![], running_metadata())
            .await
            .unwrap();
        let meta = p.get_instance_metadata("i1").await.unwrap().unwrap();
        assert_eq!(meta.status, "Running");
    }

    #[tokio::test]
    async fn ack_commits_history_and_enqueued_work_atomically() {
        let p = InMemoryProvider::new();
        p.enqueue_for_orchestrator(start_item("i1"), None).await.unwrap();
        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();

        let activity = WorkItem::ActivityExecute {
            instance: "i1".to_string(),
            execution_id: 1,
            id: 2,
            name: "Charge".to_string(),
            input: "\"5\"".to_string(),
        };
        p.ack_orchestration_item(
            &item.lock_token,
            1,
            vec![started_event()],
            vec![activity.clone()],
            vec![],
            running_metadata(),
        )
        .await
        .unwrap();

        assert_eq!(p.read("i1").await.unwrap(), vec![started_event()]);
        let (fetched, _, attempts) = p.fetch_work_item(LOCK).await.unwrap().unwrap();
        assert_eq!(fetched, activity);
        assert_eq!(attempts, 1);
        // Start message consumed; instance unlocked but idle.
        assert!(p.fetch_orchestration_item(LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn timer_message_stays_invisible_until_fire_time() {
        let p = InMemoryProvider::new();
        p.enqueue_for_orchestrator(start_item("i1"), None).await.unwrap();
        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();

        let fire_at_ms = crate::wall_clock_ms() + 50;
        p.ack_orchestration_item(
            &item.lock_token,
            1,
            vec![started_event()],
            vec![],
            vec![WorkItem::TimerFired {
                instance: "i1".to_string(),
                execution_id: 1,
                id: 2,
                fire_at_ms,
            }],
            running_metadata(),
        )
        .await
        .unwrap();

        assert!(p.fetch_orchestration_item(LOCK).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert!(matches!(item.messages[0], WorkItem::TimerFired { .. }));
    }

    #[tokio::test]
    async fn abandoned_batch_redelivers_and_keeps_counting_attempts() {
        let p = InMemoryProvider::new();
        p.enqueue_for_orchestrator(start_item("i1"), None).await.unwrap();

        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.attempt_count, 1);
        p.abandon_orchestration_item(&item.lock_token, None).await.unwrap();

        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.attempt_count, 2);
    }

    #[tokio::test]
    async fn expired_lock_allows_refetch_and_fails_stale_ack() {
        let p = InMemoryProvider::new();
        p.enqueue_for_orchestrator(start_item("i1"), None).await.unwrap();

        let stale = p
            .fetch_orchestration_item(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_ne!(fresh.lock_token, stale.lock_token);

        let err = p
            .ack_orchestration_item(&stale.lock_token, 1, vec![], vec![], vec![], Default::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn worker_ack_routes_completion_to_orchestrator() {
        let p = InMemoryProvider::new();
        p.enqueue_for_orchestrator(start_item("i1"), None).await.unwrap();
        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        p.ack_orchestration_item(
            &item.lock_token,
            1,
            vec![started_event()],
            vec![WorkItem::ActivityExecute {
                instance: "i1".to_string(),
                execution_id: 1,
                id: 2,
                name: "Charge".to_string(),
                input: "\"5\"".to_string(),
            }],
            vec![],
            running_metadata(),
        )
        .await
        .unwrap();

        let (_, token, _) = p.fetch_work_item(LOCK).await.unwrap().unwrap();
        p.ack_work_item(
            &token,
            Some(WorkItem::ActivityCompleted {
                instance: "i1".to_string(),
                execution_id: 1,
                id: 2,
                result: "\"25\"".to_string(),
            }),
        )
        .await
        .unwrap();

        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert!(matches!(item.messages[0], WorkItem::ActivityCompleted { .. }));
        // Completion was delivered against the stored history.
        assert_eq!(item.history, vec![started_event()]);
    }

    #[tokio::test]
    async fn custom_status_updates_only_when_set() {
        let p = InMemoryProvider::new();
        p.enqueue_for_orchestrator(start_item("i1"), None).await.unwrap();
        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        p.ack_orchestration_item(
            &item.lock_token,
            1,
            vec![started_event()],
            vec![],
            vec![],
            ExecutionMetadata {
                custom_status: Some(Some("step 1".to_string())),
                ..running_metadata()
            },
        )
        .await
        .unwrap();
        let meta = p.get_instance_metadata("i1").await.unwrap().unwrap();
        assert_eq!(meta.custom_status.as_deref(), Some("step 1"));

        // Unchanged when the update is absent.
        p.enqueue_for_orchestrator(
            WorkItem::ExternalRaised {
                instance: "i1".to_string(),
                name: "Poke".to_string(),
                data: "{}".to_string(),
            },
            None,
        )
        .await
        .unwrap();
        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        assert_eq!(item.custom_status.as_deref(), Some("step 1"));
        p.ack_orchestration_item(&item.lock_token, 1, vec![], vec![], vec![], Default::default())
            .await
            .unwrap();
        let meta = p.get_instance_metadata("i1").await.unwrap().unwrap();
        assert_eq!(meta.custom_status.as_deref(), Some("step 1"));

        // Cleared with an explicit inner None.
        p.enqueue_for_orchestrator(
            WorkItem::ExternalRaised {
                instance: "i1".to_string(),
                name: "Poke".to_string(),
                data: "{}".to_string(),
            },
            None,
        )
        .await
        .unwrap();
        let item = p.fetch_orchestration_item(LOCK).await.unwrap().unwrap();
        p.ack_orchestration_item(
            &item.lock_token,
            1,
            vec![],
            vec![],
            vec![],
            ExecutionMetadata {
                custom_status: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let meta = p.get_instance_metadata("i1").await.unwrap().unwrap();
        assert_eq!(meta.custom_status, None);
    }
}
