// SQLite provider: Mutex/lock operations should panic on poison
#![allow(clippy::expect_used)]

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::{
    ExecutionMetadata, InstanceMetadata, OrchestrationItem, Provider, ProviderError, WorkItem,
};
use crate::Event;

/// SQLite-backed provider.
///
/// Every runtime-facing operation runs inside a transaction, so the atomic
/// turn commit (history delta + queue writes + metadata + lock release)
/// holds across process crashes. Works against a file database for real
/// durability or `new_in_memory` for tests.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        // SQLITE_BUSY (database locked) - retryable
        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        // Constraint violations (duplicate events, etc.) - permanent
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        // Connection errors - retryable
        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        // Default: treat as retryable
        ProviderError::retryable(operation, error_msg)
    }

    /// Create a new SQLite provider
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db" or "sqlite::memory:")
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    // Journal mode: WAL for file DBs; MEMORY for in-memory DBs
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        // WAL mode: only sync the WAL file, not the main database
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA wal_autocheckpoint = 10000")
                            .execute(&mut *conn)
                            .await?;
                        // 64MB page cache
                        sqlx::query("PRAGMA cache_size = -64000").execute(&mut *conn).await?;
                    }

                    // Retry on locks for up to 60 seconds before surfacing SQLITE_BUSY
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;

                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// Convenience: create a shared in-memory SQLite store for tests
    /// Uses a shared cache so multiple pooled connections see the same DB
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        // ref: https://www.sqlite.org/inmemorydb.html
        Self::new("sqlite::memory:?cache=shared").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                orchestration_version TEXT,
                current_execution_id INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                parent_instance_id TEXT REFERENCES instances(instance_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_instances_parent ON instances(parent_instance_id)"#)
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'Running',
                output TEXT,
                custom_status TEXT,
                started_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                completed_at TIMESTAMP,
                PRIMARY KEY (instance_id, execution_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (instance_id, execution_id, event_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL DEFAULT 0,
                lock_token TEXT,
                locked_until INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0 CHECK(attempt_count >= 0),
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worker_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item TEXT NOT NULL,
                visible_at INTEGER NOT NULL DEFAULT 0,
                lock_token TEXT,
                locked_until INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0 CHECK(attempt_count >= 0),
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Instance-level locks for concurrent dispatcher coordination
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_locks (
                instance_id TEXT PRIMARY KEY,
                lock_token TEXT NOT NULL,
                locked_until INTEGER NOT NULL,
                locked_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_visible ON orchestrator_queue(visible_at, lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_instance ON orchestrator_queue(instance_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orch_lock ON orchestrator_queue(lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_worker_available ON worker_queue(lock_token, id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Generate a unique lock token
    fn generate_lock_token() -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX epoch")
            .as_nanos();
        format!("lock_{now}_{}", std::process::id())
    }

    /// Get current timestamp in milliseconds
    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX epoch")
            .as_millis() as i64
    }

    /// Get future timestamp in milliseconds
    fn timestamp_after(duration: Duration) -> i64 {
        Self::now_millis() + duration.as_millis() as i64
    }

    async fn read_history_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        execution_id: Option<u64>,
    ) -> Result<Vec<Event>, sqlx::Error> {
        let execution_id = match execution_id {
            Some(id) => id as i64,
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COALESCE(MAX(execution_id), 1) FROM executions WHERE instance_id = ?",
                )
                .bind(instance)
                .fetch_one(&mut **tx)
                .await?
            }
        };

        let rows = sqlx::query(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ? AND execution_id = ?
            ORDER BY event_id
            "#,
        )
        .bind(instance)
        .bind(execution_id)
        .fetch_all(&mut **tx)
        .await?;

        let mut events = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            let event_data: String = row.try_get("event_data")?;
            let event: Event = serde_json::from_str::<Event>(&event_data).map_err(|e| {
                // Unknown or corrupt events must surface as a hard error, never
                // a silently shortened history.
                sqlx::Error::Protocol(format!(
                    "Failed to deserialize history event at position {idx} for instance '{instance}' execution {execution_id}: {e}"
                ))
            })?;
            events.push(event);
        }

        Ok(events)
    }

    async fn append_history_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        instance: &str,
        execution_id: u64,
        events: Vec<Event>,
    ) -> Result<(), sqlx::Error> {
        // The runtime assigns event ids; the provider never generates them
        for event in &events {
            if event.event_id() == 0 {
                return Err(sqlx::Error::Protocol("event_id must be set by runtime".into()));
            }
        }

        for event in &events {
            let event_data = serde_json::to_string(&event)
                .expect("Event serialization should never fail - this is a programming error");

            sqlx::query(
                r#"
                INSERT INTO history (instance_id, execution_id, event_id, event_type, event_data)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(instance)
            .bind(execution_id as i64)
            .bind(event.event_id() as i64)
            .bind(event.label())
            .bind(event_data)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    pub fn get_pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
        let now_ms = Self::now_millis();

        // Find an instance that has visible messages AND is not locked (or
        // the lock expired). Message-level lock tokens do not gate selection;
        // the instance lock is the mutual exclusion.
        let row = sqlx::query(
            r#"
            SELECT q.instance_id
            FROM orchestrator_queue q
            LEFT JOIN instance_locks il ON q.instance_id = il.instance_id
            WHERE q.visible_at <= ?1
              AND (il.instance_id IS NULL OR il.locked_until <= ?1)
            ORDER BY q.id
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let instance_id: String = row.try_get("instance_id").map_err(|e| {
            ProviderError::permanent("fetch_orchestration_item", format!("Failed to get instance_id: {e}"))
        })?;

        let lock_token = Self::generate_lock_token();
        let locked_until = Self::timestamp_after(lock_timeout);

        // Atomically acquire the instance lock; the WHERE clause on the upsert
        // refuses to steal a live lock.
        let lock_result = sqlx::query(
            r#"
            INSERT INTO instance_locks (instance_id, lock_token, locked_until, locked_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(instance_id) DO UPDATE
            SET lock_token = ?2, locked_until = ?3, locked_at = ?4
            WHERE locked_until <= ?4
            "#,
        )
        .bind(&instance_id)
        .bind(&lock_token)
        .bind(locked_until)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
        if lock_result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        // Mark every visible message for this instance with our token so ack
        // can delete exactly what we fetched. Messages whose previous lock
        // expired get re-marked here, which is how abandoned batches recover.
        // attempt_count feeds poison message detection.
        sqlx::query(
            r#"
            UPDATE orchestrator_queue
            SET lock_token = ?1, locked_until = ?2, attempt_count = attempt_count + 1
            WHERE instance_id = ?3 AND visible_at <= ?4
            "#,
        )
        .bind(&lock_token)
        .bind(locked_until)
        .bind(&instance_id)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        let messages = sqlx::query(
            r#"
            SELECT work_item, attempt_count
            FROM orchestrator_queue
            WHERE lock_token = ?1
            ORDER BY id
            "#,
        )
        .bind(&lock_token)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        if messages.is_empty() {
            // Another fetch consumed the messages between SELECT and UPDATE
            sqlx::query("DELETE FROM instance_locks WHERE instance_id = ?")
                .bind(&instance_id)
                .execute(&mut *tx)
                .await
                .ok();
            tx.rollback().await.ok();
            return Ok(None);
        }

        let mut attempt_count: u32 = 0;
        let work_items: Vec<WorkItem> = messages
            .iter()
            .filter_map(|r| {
                if let Ok(attempts) = r.try_get::<i64, _>("attempt_count") {
                    attempt_count = attempt_count.max(attempts as u32);
                }
                r.try_get::<String, _>("work_item")
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok())
            })
            .collect();

        let instance_info = sqlx::query(
            r#"
            SELECT i.orchestration_name, i.orchestration_version, i.current_execution_id,
                   e.execution_id AS exec_row, e.custom_status
            FROM instances i
            LEFT JOIN executions e ON i.instance_id = e.instance_id AND i.current_execution_id = e.execution_id
            WHERE i.instance_id = ?1
            "#,
        )
        .bind(&instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        // An instances row alone is not enough to replay: register_instance
        // creates one before any turn has committed. Only an execution row
        // means there is recorded state to load.
        let committed = instance_info
            .filter(|info| info.try_get::<Option<i64>, _>("exec_row").ok().flatten().is_some());

        let (orchestration_name, version, execution_id, history, custom_status) =
            if let Some(info) = committed {
                let name: String = info.try_get("orchestration_name").map_err(|e| {
                    ProviderError::permanent(
                        "fetch_orchestration_item",
                        format!("Failed to get orchestration_name: {e}"),
                    )
                })?;
                let version: Option<String> = info.try_get("orchestration_version").ok();
                let exec_id: i64 = info.try_get("current_execution_id").map_err(|e| {
                    ProviderError::permanent(
                        "fetch_orchestration_item",
                        format!("Failed to get current_execution_id: {e}"),
                    )
                })?;
                let custom_status: Option<String> = info.try_get("custom_status").ok().flatten();

                let history = self
                    .read_history_in_tx(&mut tx, &instance_id, Some(exec_id as u64))
                    .await
                    .map_err(|e| {
                        ProviderError::permanent(
                            "fetch_orchestration_item",
                            format!("Failed to read history: {e}"),
                        )
                    })?;

                (
                    name,
                    version.unwrap_or_else(|| "unknown".to_string()),
                    exec_id as u64,
                    history,
                    custom_status,
                )
            } else {
                // Brand new instance: derive name and version from the start
                // message. Completions for an unknown instance cannot build an
                // item and stay queued.
                let start = work_items.iter().find_map(|item| match item {
                    WorkItem::StartOrchestration {
                        orchestration,
                        version,
                        ..
                    }
                    | WorkItem::ContinueAsNew {
                        orchestration,
                        version,
                        ..
                    } => Some((orchestration.clone(), version.clone())),
                    _ => None,
                });
                match start {
                    Some((orchestration, version)) => (
                        orchestration,
                        version.unwrap_or_else(|| "unknown".to_string()),
                        1u64,
                        Vec::new(),
                        None,
                    ),
                    None => {
                        // A batch with no start message for an undispatched
                        // instance can never form an item. Push it back with a
                        // delay so it does not shadow runnable instances at
                        // the head of the queue, and undo the attempt
                        // increment so an eventual real batch is not charged
                        // for these cycles.
                        debug!(target: "duraflow::providers::sqlite", instance = %instance_id, "no instance info; cannot build orchestration item");
                        sqlx::query(
                            r#"
                            UPDATE orchestrator_queue
                            SET lock_token = NULL, locked_until = NULL,
                                attempt_count = attempt_count - 1, visible_at = ?1
                            WHERE lock_token = ?2
                            "#,
                        )
                        .bind(now_ms + 100)
                        .bind(&lock_token)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
                        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ? AND lock_token = ?")
                            .bind(&instance_id)
                            .bind(&lock_token)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
                        tx.commit()
                            .await
                            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;
                        return Ok(None);
                    }
                }
            };

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_orchestration_item", e))?;

        debug!(
            instance = %instance_id,
            messages = work_items.len(),
            history_len = history.len(),
            "Fetched orchestration item"
        );

        Ok(Some(OrchestrationItem {
            instance: instance_id,
            orchestration_name,
            version,
            execution_id,
            history,
            messages: work_items,
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        let row = sqlx::query("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "Invalid lock token"))?;
        let instance_id: String = row.try_get("instance_id").map_err(|e| {
            ProviderError::permanent("ack_orchestration_item", format!("Failed to decode instance_id: {e}"))
        })?;

        // Delete only the messages we fetched; later arrivals stay queued for
        // the next turn.
        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        // Create or update instance metadata; the runtime resolves the version
        // against its registry and passes it down here.
        if let (Some(name), Some(version)) = (&metadata.orchestration_name, &metadata.orchestration_version) {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO instances
                (instance_id, orchestration_name, orchestration_version, current_execution_id, parent_instance_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&instance_id)
            .bind(name)
            .bind(version.as_str())
            .bind(execution_id as i64)
            .bind(&metadata.parent_instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

            // parent_instance_id is immutable after creation
            sqlx::query(
                r#"
                UPDATE instances
                SET orchestration_name = ?, orchestration_version = ?
                WHERE instance_id = ?
                "#,
            )
            .bind(name)
            .bind(version)
            .bind(&instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        // Idempotent: the execution may already exist from a previous turn,
        // and its status must never be clobbered back to Running here.
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO executions (instance_id, execution_id, status)
            VALUES (?, ?, 'Running')
            "#,
        )
        .bind(&instance_id)
        .bind(execution_id as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        sqlx::query(
            r#"
            UPDATE instances
            SET current_execution_id = MAX(current_execution_id, ?)
            WHERE instance_id = ?
            "#,
        )
        .bind(execution_id as i64)
        .bind(&instance_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        if !history_delta.is_empty() {
            debug!(
                instance = %instance_id,
                events = history_delta.len(),
                "Appending history delta"
            );
            self.append_history_in_tx(&mut tx, &instance_id, execution_id, history_delta)
                .await
                .map_err(|e| {
                    ProviderError::permanent("ack_orchestration_item", format!("Failed to append history: {e}"))
                })?;
        }

        if let Some(status) = &metadata.status {
            // completed_at marks terminal executions only; Running/Suspended
            // turns leave it NULL.
            let terminal = matches!(status.as_str(), "Completed" | "Failed" | "ContinuedAsNew" | "Terminated");
            let completed_at: Option<i64> = terminal.then(|| Self::now_millis());
            sqlx::query(
                r#"
                UPDATE executions
                SET status = ?, output = ?, completed_at = ?
                WHERE instance_id = ? AND execution_id = ?
                "#,
            )
            .bind(status)
            .bind(&metadata.output)
            .bind(completed_at)
            .bind(&instance_id)
            .bind(execution_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        if let Some(custom_status) = &metadata.custom_status {
            sqlx::query(
                r#"
                UPDATE executions
                SET custom_status = ?
                WHERE instance_id = ? AND execution_id = ?
                "#,
            )
            .bind(custom_status)
            .bind(&instance_id)
            .bind(execution_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        let now_ms = Self::now_millis();
        for item in worker_items {
            let work_item = serde_json::to_string(&item).map_err(|e| {
                ProviderError::permanent("ack_orchestration_item", format!("Serialization error: {e}"))
            })?;
            sqlx::query("INSERT INTO worker_queue (work_item, visible_at) VALUES (?, ?)")
                .bind(work_item)
                .bind(now_ms)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        for item in orchestrator_items {
            let work_item = serde_json::to_string(&item).map_err(|e| {
                ProviderError::permanent("ack_orchestration_item", format!("Serialization error: {e}"))
            })?;

            // TimerFired stays invisible until its fire time
            let visible_at = match &item {
                WorkItem::TimerFired { fire_at_ms, .. } => *fire_at_ms as i64,
                _ => Self::now_millis(),
            };

            sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)")
                .bind(item.instance())
                .bind(work_item)
                .bind(visible_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;
        }

        // The lock must still be ours at commit time; an expired lock means
        // another runtime may already own this instance.
        let now_ms = Self::now_millis();
        let lock_valid = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM instance_locks
            WHERE instance_id = ? AND lock_token = ? AND locked_until > ?
            "#,
        )
        .bind(&instance_id)
        .bind(lock_token)
        .bind(now_ms)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        if lock_valid == 0 {
            tracing::warn!(
                instance = %instance_id,
                lock_token = %lock_token,
                "Instance lock expired or invalid, aborting ack"
            );
            tx.rollback().await.ok();
            return Err(ProviderError::permanent(
                "ack_orchestration_item",
                "Instance lock expired",
            ));
        }

        sqlx::query("DELETE FROM instance_locks WHERE instance_id = ? AND lock_token = ?")
            .bind(&instance_id)
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_orchestration_item", e))?;

        debug!(
            instance = %instance_id,
            "Acknowledged orchestration item and released lock"
        );

        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay: Option<Duration>,
    ) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;

        let instance_id: Option<String> =
            sqlx::query_scalar("SELECT instance_id FROM instance_locks WHERE lock_token = ?")
                .bind(lock_token)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;

        let Some(instance_id) = instance_id else {
            return Err(ProviderError::permanent(
                "abandon_orchestration_item",
                "Invalid lock token",
            ));
        };

        sqlx::query("DELETE FROM instance_locks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;

        // The message lock markers stay; the next fetch re-marks them. The
        // attempt counts are kept so redelivery still counts toward poison
        // detection.
        if let Some(delay) = delay {
            let delay_ms = delay.as_millis().min(i64::MAX as u128) as i64;
            let visible_at = Self::now_millis().saturating_add(delay_ms);
            sqlx::query("UPDATE orchestrator_queue SET visible_at = ? WHERE instance_id = ? AND visible_at <= ?")
                .bind(visible_at)
                .bind(&instance_id)
                .bind(Self::now_millis())
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon_orchestration_item", e))?;

        Ok(())
    }

    async fn register_instance(
        &self,
        instance: &str,
        orchestration: &str,
        version: Option<&str>,
    ) -> Result<(), ProviderError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO instances (instance_id, orchestration_name, orchestration_version)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(instance)
        .bind(orchestration)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("register_instance", e))?;
        Ok(())
    }

    async fn enqueue_for_orchestrator(&self, item: WorkItem, delay: Option<Duration>) -> Result<(), ProviderError> {
        let work_item = serde_json::to_string(&item)
            .map_err(|e| ProviderError::permanent("enqueue_for_orchestrator", format!("Serialization error: {e}")))?;

        let visible_at = if let Some(delay) = delay {
            let delay_ms = delay.as_millis().min(i64::MAX as u128) as i64;
            Self::now_millis().saturating_add(delay_ms)
        } else {
            Self::now_millis()
        };

        sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)")
            .bind(item.instance())
            .bind(work_item)
            .bind(visible_at)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue_for_orchestrator", e))?;

        Ok(())
    }

    async fn enqueue_for_worker(&self, item: WorkItem) -> Result<(), ProviderError> {
        let work_item = serde_json::to_string(&item)
            .map_err(|e| ProviderError::permanent("enqueue_for_worker", format!("Serialization error: {e}")))?;

        sqlx::query("INSERT INTO worker_queue (work_item, visible_at) VALUES (?, ?)")
            .bind(work_item)
            .bind(Self::now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue_for_worker", e))?;

        Ok(())
    }

    async fn fetch_work_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<(WorkItem, String, u32)>, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_work_item", e))?;

        let lock_token = Self::generate_lock_token();
        let locked_until = Self::timestamp_after(lock_timeout);
        let now_ms = Self::now_millis();

        // Item is available if visible and (unlocked OR lock expired)
        let next_item = sqlx::query(
            r#"
            SELECT id, work_item, attempt_count FROM worker_queue
            WHERE visible_at <= ?1
              AND (lock_token IS NULL OR locked_until <= ?1)
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_work_item", e))?;

        let Some(next_item) = next_item else {
            return Ok(None);
        };

        let id: i64 = next_item
            .try_get("id")
            .map_err(|e| ProviderError::permanent("fetch_work_item", format!("Failed to get id: {e}")))?;
        let work_item_str: String = next_item
            .try_get("work_item")
            .map_err(|e| ProviderError::permanent("fetch_work_item", format!("Failed to get work_item: {e}")))?;
        let current_attempt_count: i64 = next_item
            .try_get("attempt_count")
            .map_err(|e| ProviderError::permanent("fetch_work_item", format!("Failed to get attempt_count: {e}")))?;

        sqlx::query(
            r#"
            UPDATE worker_queue
            SET lock_token = ?1, locked_until = ?2, attempt_count = attempt_count + 1
            WHERE id = ?3
            "#,
        )
        .bind(&lock_token)
        .bind(locked_until)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_work_item", e))?;

        let work_item: WorkItem = serde_json::from_str(&work_item_str)
            .map_err(|e| ProviderError::permanent("fetch_work_item", format!("Deserialization error: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_work_item", e))?;

        Ok(Some((work_item, lock_token, (current_attempt_count + 1) as u32)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;

        let result = sqlx::query("DELETE FROM worker_queue WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "ack_work_item",
                "Invalid lock token or already acked",
            ));
        }

        // None means drop without notifying the orchestrator (terminal instance)
        if let Some(completion) = completion {
            let instance = match &completion {
                WorkItem::ActivityCompleted { instance, .. } | WorkItem::ActivityFailed { instance, .. } => instance,
                _ => {
                    return Err(ProviderError::permanent(
                        "ack_work_item",
                        "Invalid completion type for worker ack",
                    ));
                }
            };

            let work_item = serde_json::to_string(&completion)
                .map_err(|e| ProviderError::permanent("ack_work_item", format!("Serialization error: {e}")))?;

            sqlx::query("INSERT INTO orchestrator_queue (instance_id, work_item, visible_at) VALUES (?, ?, ?)")
                .bind(instance)
                .bind(work_item)
                .bind(Self::now_millis())
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack_work_item", e))?;

        Ok(())
    }

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let now_ms = Self::now_millis();
        let visible_at = if let Some(d) = delay {
            Self::timestamp_after(d)
        } else {
            now_ms
        };

        let result = sqlx::query(
            r#"
            UPDATE worker_queue
            SET lock_token = NULL, locked_until = NULL, visible_at = ?1
            WHERE lock_token = ?2
            "#,
        )
        .bind(visible_at)
        .bind(lock_token)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("abandon_work_item", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "abandon_work_item",
                "Invalid lock token or already acked",
            ));
        }

        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let execution_id = match self.latest_execution_id(instance).await? {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };
        self.read_with_execution(instance, execution_id).await
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query(
            r#"
            SELECT event_data
            FROM history
            WHERE instance_id = ? AND execution_id = ?
            ORDER BY event_id
            "#,
        )
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("read_with_execution", e))?;

        let mut events = Vec::new();
        for row in rows {
            let event_data: String = row.try_get("event_data").map_err(|e| {
                ProviderError::permanent("read_with_execution", format!("Failed to get event_data: {e}"))
            })?;
            let event: Event = serde_json::from_str(&event_data).map_err(|e| {
                ProviderError::permanent("read_with_execution", format!("Failed to deserialize event: {e}"))
            })?;
            events.push(event);
        }

        Ok(events)
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let max_id: Option<i64> =
            sqlx::query_scalar("SELECT MAX(execution_id) FROM executions WHERE instance_id = ?")
                .bind(instance)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("latest_execution_id", e))?;
        Ok(max_id.map(|id| id as u64))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let rows = sqlx::query("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;

        Ok(rows
            .into_iter()
            .map(|row| row.try_get("instance_id").unwrap_or_default())
            .collect())
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let rows = sqlx::query("SELECT execution_id FROM executions WHERE instance_id = ? ORDER BY execution_id")
            .bind(instance)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_executions", e))?;

        Ok(rows
            .into_iter()
            .map(|row| row.try_get::<i64, _>("execution_id").unwrap_or(0) as u64)
            .collect())
    }

    async fn get_instance_metadata(&self, instance: &str) -> Result<Option<InstanceMetadata>, ProviderError> {
        let row = sqlx::query(
            r#"
            SELECT
                i.orchestration_name,
                i.orchestration_version,
                i.current_execution_id,
                i.parent_instance_id,
                e.status,
                e.output,
                e.custom_status
            FROM instances i
            LEFT JOIN executions e ON i.instance_id = e.instance_id AND i.current_execution_id = e.execution_id
            WHERE i.instance_id = ?
            "#,
        )
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("get_instance_metadata", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let orchestration_name: String = row
            .try_get("orchestration_name")
            .map_err(|e| Self::sqlx_to_provider_error("get_instance_metadata", e))?;
        let version: Option<String> = row.try_get("orchestration_version").ok();
        let execution_id: i64 = row.try_get("current_execution_id").unwrap_or(1);
        // No execution row yet means the instance was registered but never
        // dispatched.
        let status: String = row
            .try_get::<Option<String>, _>("status")
            .ok()
            .flatten()
            .unwrap_or_else(|| "Pending".to_string());
        let output: Option<String> = row.try_get("output").ok().flatten();
        let custom_status: Option<String> = row.try_get("custom_status").ok().flatten();
        let parent_instance: Option<String> = row.try_get("parent_instance_id").ok().flatten();

        Ok(Some(InstanceMetadata {
            instance: instance.to_string(),
            orchestration_name,
            version: version.unwrap_or_else(|| "unknown".to_string()),
            execution_id: execution_id as u64,
            status,
            output,
            custom_status,
            parent_instance,
        }))
    }
}
