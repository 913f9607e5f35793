//! SQLite-backed message store.
//!
//! All messages share one queue table. SQLite has no `FOR UPDATE SKIP LOCKED`,
//! so exclusive delivery claims are emulated with advisory `claimed_by` /
//! `claim_expires_at` columns written by a single `UPDATE ... RETURNING`
//! statement; SQLite's serialized writers make the claim atomic across
//! concurrent consumers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::codec::{JsonPayloadCodec, PayloadCodec};
use crate::config::DEFAULT_QUEUE_TABLE_NAME;
use crate::error::{Error, Result};
use crate::store::MessageStore;
use crate::types::{
    duration_to_chrono, timestamp_from_micros, timestamp_micros, Message, MessageId, MessageOrder,
    QueueName, QueuedMessage, SortOrder, UpcomingDelivery,
};

/// SQLite store configuration.
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Database file path (`:memory:` or a `file:` URI for in-memory use).
    pub database_path: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Name of the shared queue table.
    pub table_name: String,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            database_path: "durq.db".to_string(),
            max_connections: 10,
            table_name: DEFAULT_QUEUE_TABLE_NAME.to_string(),
        }
    }
}

/// SQLite-backed [`MessageStore`].
pub struct SqliteMessageStore {
    pool: SqlitePool,
    table: String,
    codec: Arc<dyn PayloadCodec>,
}

const SNAPSHOT_COLUMNS: &str = "id, queue_name, payload, payload_type, metadata, added_ts, \
     next_delivery_ts, total_attempts, redelivery_attempts, last_delivery_error, is_dead_letter, \
     message_key, key_order";

impl SqliteMessageStore {
    /// Connect with the default JSON payload codec.
    pub async fn connect(config: SqliteStoreConfig) -> Result<Self> {
        Self::connect_with_codec(config, Arc::new(JsonPayloadCodec)).await
    }

    /// Connect with a custom payload codec.
    pub async fn connect_with_codec(
        config: SqliteStoreConfig,
        codec: Arc<dyn PayloadCodec>,
    ) -> Result<Self> {
        crate::types::validation::validate_table_name(&config.table_name)?;

        info!(
            database_path = %config.database_path,
            table_name = %config.table_name,
            max_connections = config.max_connections,
            "Initializing SQLite message store"
        );

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            // WAL mode for better concurrency
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to connect to SQLite: {}", e)))?;

        let store = Self {
            pool,
            table: config.table_name,
            codec,
        };
        store.create_schema().await?;

        info!("SQLite message store initialized");
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        let t = &self.table;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload BLOB NOT NULL,
                payload_type TEXT NOT NULL,
                metadata TEXT,
                added_ts INTEGER NOT NULL,
                next_delivery_ts INTEGER NOT NULL,
                total_attempts INTEGER NOT NULL DEFAULT 0,
                redelivery_attempts INTEGER NOT NULL DEFAULT 0,
                last_delivery_error TEXT,
                is_dead_letter INTEGER NOT NULL DEFAULT 0,
                delivery_mode TEXT NOT NULL DEFAULT 'normal',
                message_key TEXT,
                key_order INTEGER,
                claimed_by TEXT,
                claim_expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{t}_due
                ON {t} (queue_name, is_dead_letter, next_delivery_ts);
            CREATE INDEX IF NOT EXISTS idx_{t}_key
                ON {t} (queue_name, message_key, key_order);
            "#
        );

        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to create queue table: {}", e)))?;
        Ok(())
    }

    async fn insert_row(
        &self,
        queue_name: &QueueName,
        message: &Message,
        next_delivery_at: DateTime<Utc>,
        total_attempts: u32,
        last_error: Option<&str>,
        is_dead_letter: bool,
    ) -> Result<MessageId> {
        let id = MessageId::new();
        let payload = self.codec.encode(&message.payload)?;
        let metadata_json = if message.metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.metadata)?)
        };
        let (delivery_mode, key, key_order) = match &message.ordering {
            Some(order) => ("ordered", Some(order.key.as_str()), Some(order.key_order)),
            None => ("normal", None, None),
        };

        let sql = format!(
            r#"
            INSERT INTO {t} (
                id, queue_name, payload, payload_type, metadata, added_ts, next_delivery_ts,
                total_attempts, redelivery_attempts, last_delivery_error, is_dead_letter,
                delivery_mode, message_key, key_order
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)
            "#,
            t = self.table
        );

        sqlx::query(&sql)
            .bind(&id.0)
            .bind(queue_name.as_str())
            .bind(&payload)
            .bind(&message.payload_type)
            .bind(metadata_json)
            .bind(timestamp_micros(Utc::now()))
            .bind(timestamp_micros(next_delivery_at))
            .bind(total_attempts as i64)
            .bind(last_error)
            .bind(is_dead_letter)
            .bind(delivery_mode)
            .bind(key)
            .bind(key_order)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to insert message: {}", e)))?;

        debug!(
            queue_name = %queue_name,
            message_id = %id,
            is_dead_letter = is_dead_letter,
            "Message inserted"
        );
        Ok(id)
    }

    fn parse_snapshot_row(&self, row: &SqliteRow) -> Result<QueuedMessage> {
        let payload_bytes: Vec<u8> = row.get("payload");
        let payload = self.codec.decode(&payload_bytes)?;

        let metadata = row
            .get::<Option<String>, _>("metadata")
            .map(|json| serde_json::from_str(&json))
            .transpose()?
            .unwrap_or_default();

        let ordering = match row.get::<Option<String>, _>("message_key") {
            Some(key) => Some(MessageOrder {
                key,
                key_order: row.get::<Option<i64>, _>("key_order").unwrap_or(0),
            }),
            None => None,
        };

        Ok(QueuedMessage {
            id: MessageId(row.get("id")),
            queue_name: QueueName::new(row.get::<String, _>("queue_name"))?,
            payload,
            payload_type: row.get("payload_type"),
            metadata,
            added_timestamp: timestamp_from_micros(row.get("added_ts"))?,
            next_delivery_timestamp: timestamp_from_micros(row.get("next_delivery_ts"))?,
            total_delivery_attempts: row.get::<i64, _>("total_attempts") as u32,
            redelivery_attempts: row.get::<i64, _>("redelivery_attempts") as u32,
            last_delivery_error: row.get("last_delivery_error"),
            is_dead_letter: row.get("is_dead_letter"),
            ordering,
        })
    }

    async fn get_with_dead_letter_flag(
        &self,
        id: &MessageId,
        is_dead_letter: bool,
    ) -> Result<Option<QueuedMessage>> {
        let sql = format!(
            "SELECT {cols} FROM {t} WHERE id = ? AND is_dead_letter = ?",
            cols = SNAPSHOT_COLUMNS,
            t = self.table
        );
        let row = sqlx::query(&sql)
            .bind(&id.0)
            .bind(is_dead_letter)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to get message: {}", e)))?;

        row.map(|row| self.parse_snapshot_row(&row)).transpose()
    }

    async fn list_with_dead_letter_flag(
        &self,
        queue_name: &QueueName,
        is_dead_letter: bool,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>> {
        let direction = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let sql = format!(
            "SELECT {cols} FROM {t} \
             WHERE queue_name = ? AND is_dead_letter = ? \
             ORDER BY next_delivery_ts {dir}, added_ts {dir}, rowid {dir} \
             LIMIT ? OFFSET ?",
            cols = SNAPSHOT_COLUMNS,
            t = self.table,
            dir = direction
        );

        let rows = sqlx::query(&sql)
            .bind(queue_name.as_str())
            .bind(is_dead_letter)
            .bind(limit as i64)
            .bind(skip as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to list messages: {}", e)))?;

        rows.iter()
            .map(|row| self.parse_snapshot_row(row))
            .collect()
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert(
        &self,
        queue_name: &QueueName,
        message: &Message,
        delivery_delay: Option<Duration>,
    ) -> Result<MessageId> {
        let next_delivery_at = match delivery_delay {
            Some(delay) => Utc::now() + duration_to_chrono(delay),
            None => Utc::now(),
        };
        self.insert_row(queue_name, message, next_delivery_at, 0, None, false)
            .await
    }

    async fn insert_as_dead_letter(
        &self,
        queue_name: &QueueName,
        message: &Message,
        cause: &str,
    ) -> Result<MessageId> {
        self.insert_row(queue_name, message, Utc::now(), 1, Some(cause), true)
            .await
    }

    async fn claim_next_due(
        &self,
        queue_name: &QueueName,
        claimed_by: &str,
        claim_timeout: Duration,
    ) -> Result<Option<QueuedMessage>> {
        let now = Utc::now();
        let now_micros = timestamp_micros(now);
        let expires_micros = timestamp_micros(now + duration_to_chrono(claim_timeout));

        // The candidate subquery skips rows another consumer holds a live
        // claim on, and holds back any ordered message whose key still has an
        // earlier row outstanding (queued, claimed or dead-lettered).
        let sql = format!(
            r#"
            UPDATE {t}
               SET claimed_by = ?, claim_expires_at = ?
             WHERE id = (
                   SELECT m.id FROM {t} m
                    WHERE m.queue_name = ?
                      AND m.is_dead_letter = 0
                      AND m.next_delivery_ts <= ?
                      AND (m.claimed_by IS NULL OR m.claim_expires_at <= ?)
                      AND (m.message_key IS NULL OR NOT EXISTS (
                            SELECT 1 FROM {t} p
                             WHERE p.queue_name = m.queue_name
                               AND p.message_key = m.message_key
                               AND p.key_order < m.key_order))
                    ORDER BY m.next_delivery_ts ASC, m.added_ts ASC, m.rowid ASC
                    LIMIT 1)
            RETURNING {cols}
            "#,
            t = self.table,
            cols = SNAPSHOT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(claimed_by)
            .bind(expires_micros)
            .bind(queue_name.as_str())
            .bind(now_micros)
            .bind(now_micros)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to claim message: {}", e)))?;

        row.map(|row| self.parse_snapshot_row(&row)).transpose()
    }

    async fn ack(&self, id: &MessageId) -> Result<()> {
        let sql = format!("DELETE FROM {t} WHERE id = ?", t = self.table);
        let result = sqlx::query(&sql)
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to acknowledge message: {}", e)))?;

        if result.rows_affected() == 0 {
            debug!(message_id = %id, "Acknowledge skipped, message already gone");
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: &MessageId,
        next_delivery_at: DateTime<Utc>,
        error: &str,
        increment_attempts: bool,
    ) -> Result<()> {
        let increment: i64 = if increment_attempts { 1 } else { 0 };
        let sql = format!(
            r#"
            UPDATE {t}
               SET next_delivery_ts = ?,
                   last_delivery_error = ?,
                   total_attempts = total_attempts + ?,
                   redelivery_attempts = redelivery_attempts + ?,
                   claimed_by = NULL,
                   claim_expires_at = NULL
             WHERE id = ?
            "#,
            t = self.table
        );

        let result = sqlx::query(&sql)
            .bind(timestamp_micros(next_delivery_at))
            .bind(error)
            .bind(increment)
            .bind(increment)
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to reschedule message: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::MessageNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_dead_letter(&self, id: &MessageId, error: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {t}
               SET is_dead_letter = 1,
                   last_delivery_error = ?,
                   total_attempts = total_attempts + 1,
                   claimed_by = NULL,
                   claim_expires_at = NULL
             WHERE id = ?
            "#,
            t = self.table
        );

        let result = sqlx::query(&sql)
            .bind(error)
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to mark dead letter: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::MessageNotFound(id.to_string()));
        }
        info!(message_id = %id, "Message marked as dead letter");
        Ok(())
    }

    async fn resurrect(
        &self,
        id: &MessageId,
        delivery_delay: Duration,
    ) -> Result<Option<QueuedMessage>> {
        let next_delivery_at = Utc::now() + duration_to_chrono(delivery_delay);
        let sql = format!(
            r#"
            UPDATE {t}
               SET is_dead_letter = 0,
                   next_delivery_ts = ?,
                   redelivery_attempts = 0,
                   claimed_by = NULL,
                   claim_expires_at = NULL
             WHERE id = ? AND is_dead_letter = 1
            RETURNING {cols}
            "#,
            t = self.table,
            cols = SNAPSHOT_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(timestamp_micros(next_delivery_at))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to resurrect message: {}", e)))?;

        if row.is_some() {
            info!(message_id = %id, "Dead letter resurrected");
        }
        row.map(|row| self.parse_snapshot_row(&row)).transpose()
    }

    async fn get(&self, id: &MessageId) -> Result<Option<QueuedMessage>> {
        self.get_with_dead_letter_flag(id, false).await
    }

    async fn get_dead_letter(&self, id: &MessageId) -> Result<Option<QueuedMessage>> {
        self.get_with_dead_letter_flag(id, true).await
    }

    async fn list_queued(
        &self,
        queue_name: &QueueName,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>> {
        self.list_with_dead_letter_flag(queue_name, false, order, skip, limit)
            .await
    }

    async fn list_dead_letters(
        &self,
        queue_name: &QueueName,
        order: SortOrder,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<QueuedMessage>> {
        self.list_with_dead_letter_flag(queue_name, true, order, skip, limit)
            .await
    }

    async fn count_queued(&self, queue_name: &QueueName) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {t} WHERE queue_name = ? AND is_dead_letter = 0",
            t = self.table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(queue_name.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to count messages: {}", e)))?;
        Ok(count as u64)
    }

    async fn query_due_soon(
        &self,
        queue_name: &QueueName,
        ready_after: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<UpcomingDelivery>> {
        let sql = format!(
            "SELECT id, added_ts, next_delivery_ts FROM {t} \
             WHERE queue_name = ? AND is_dead_letter = 0 AND next_delivery_ts >= ? \
             ORDER BY next_delivery_ts ASC, added_ts ASC, rowid ASC \
             LIMIT ?",
            t = self.table
        );

        let rows = sqlx::query(&sql)
            .bind(queue_name.as_str())
            .bind(timestamp_micros(ready_after))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to query due messages: {}", e)))?;

        rows.iter()
            .map(|row| {
                Ok(UpcomingDelivery {
                    id: MessageId(row.get("id")),
                    added_timestamp: timestamp_from_micros(row.get("added_ts"))?,
                    next_delivery_timestamp: timestamp_from_micros(row.get("next_delivery_ts"))?,
                })
            })
            .collect()
    }

    async fn purge(&self, queue_name: &QueueName) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {t} WHERE queue_name = ? \
             AND (claimed_by IS NULL OR claim_expires_at <= ?)",
            t = self.table
        );
        let result = sqlx::query(&sql)
            .bind(queue_name.as_str())
            .bind(timestamp_micros(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to purge queue: {}", e)))?;

        let deleted = result.rows_affected();
        info!(queue_name = %queue_name, messages_purged = deleted, "Queue purged");
        Ok(deleted)
    }

    async fn release_expired_claims(&self) -> Result<u64> {
        let sql = format!(
            "UPDATE {t} SET claimed_by = NULL, claim_expires_at = NULL \
             WHERE claimed_by IS NOT NULL AND claim_expires_at <= ?",
            t = self.table
        );
        let result = sqlx::query(&sql)
            .bind(timestamp_micros(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to release claims: {}", e)))?;

        let released = result.rows_affected();
        if released > 0 {
            debug!(claims_released = released, "Released expired claims");
        }
        Ok(released)
    }
}
