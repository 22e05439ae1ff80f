use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use super::{validate_append, HistoryStore, ProviderError};
use crate::Event;

/// SQLite-backed history store with transactional appends.
///
/// Each append runs in one transaction that re-reads the instance history,
/// validates the new events against it and inserts them; the
/// `(instance_id, event_id)` primary key rejects concurrent writers that
/// raced past validation. File databases run with `synchronous = FULL` so a
/// committed append survives power loss.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if matches!(e, sqlx::Error::Protocol(_) | sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. }) {
            return ProviderError::permanent(operation, error_msg);
        }

        ProviderError::retryable(operation, error_msg)
    }

    /// Create a new SQLite store
    ///
    /// `database_url` is a SQLite connection string such as `sqlite:history.db`
    /// or `sqlite::memory:`. The file is created if missing.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = open_pool(database_url).await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Convenience: create an in-memory SQLite store for tests
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                created_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                PRIMARY KEY (instance_id, event_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        debug!(target: "durable_ingest::providers::sqlite", "schema ready");
        Ok(())
    }

    async fn read_history_in_tx(tx: &mut Transaction<'_, Sqlite>, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query("SELECT event_data FROM history WHERE instance_id = ? ORDER BY event_id")
            .bind(instance)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        Self::decode_rows(instance, &rows)
    }

    fn decode_rows(instance: &str, rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Event>, ProviderError> {
        let mut events = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let data: String = row
                .try_get("event_data")
                .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
            // Undecodable rows are never skipped: replay over a partial history would be wrong.
            let event = serde_json::from_str::<Event>(&data).map_err(|e| {
                ProviderError::permanent(
                    "read",
                    format!("failed to deserialize history event at position {idx} for instance '{instance}': {e}"),
                )
            })?;
            events.push(event);
        }
        Ok(events)
    }

    async fn insert_events_in_tx(tx: &mut Transaction<'_, Sqlite>, events: &[Event]) -> Result<(), ProviderError> {
        for event in events {
            let data = serde_json::to_string(event)
                .map_err(|e| ProviderError::permanent("append", format!("serialization error: {e}")))?;
            sqlx::query(
                "INSERT INTO history (instance_id, event_id, event_type, event_data, timestamp_ms) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&event.instance_id)
            .bind(event.event_id as i64)
            .bind(event.type_name())
            .bind(data)
            .bind(event.timestamp_ms as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        }
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Sqlite>, ProviderError> {
        self.pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }
}

/// Open a pool with durable settings for file databases.
///
/// A private in-memory database lives and dies with its single connection,
/// so in-memory pools never recycle it.
pub(crate) async fn open_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let url = if is_memory || database_url.contains("mode=") {
        database_url.to_string()
    } else if database_url.contains('?') {
        format!("{database_url}&mode=rwc")
    } else {
        format!("{database_url}?mode=rwc")
    };
    let options = if is_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    options
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if is_memory {
                    sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                } else {
                    sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA synchronous = FULL").execute(&mut *conn).await?;
                }
                sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistoryStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let rows = sqlx::query("SELECT event_data FROM history WHERE instance_id = ? ORDER BY event_id")
            .bind(instance)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read", e))?;
        Self::decode_rows(instance, &rows)
    }

    async fn create_instance(&self, instance: &str, initial_events: Vec<Event>) -> Result<bool, ProviderError> {
        validate_append(instance, &[], &initial_events)?;
        let mut tx = self.begin("create_instance").await?;
        let created_at = initial_events.first().map(|e| e.timestamp_ms).unwrap_or_default();
        let inserted = sqlx::query("INSERT OR IGNORE INTO instances (instance_id, created_at_ms) VALUES (?, ?)")
            .bind(instance)
            .bind(created_at as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?
            .rows_affected();
        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?;
            return Ok(false);
        }
        Self::insert_events_in_tx(&mut tx, &initial_events).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?;
        Ok(true)
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let mut tx = self.begin("append").await?;
        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE instance_id = ?")
            .bind(instance)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        if exists == 0 {
            return Err(ProviderError::permanent("append", format!("instance not found: {instance}")));
        }
        let existing = Self::read_history_in_tx(&mut tx, instance).await?;
        validate_append(instance, &existing, &new_events)?;
        Self::insert_events_in_tx(&mut tx, &new_events).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("append", e))?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let rows = sqlx::query("SELECT instance_id FROM instances ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;
        rows.iter()
            .map(|r| {
                r.try_get::<String, _>("instance_id")
                    .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))
            })
            .collect()
    }

    async fn latest_event_id(&self, instance: &str) -> Result<u64, ProviderError> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(event_id), 0) FROM history WHERE instance_id = ?")
            .bind(instance)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("latest_event_id", e))?;
        Ok(id as u64)
    }
}
