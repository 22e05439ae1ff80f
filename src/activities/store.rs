use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::providers::sqlite::open_pool;
use crate::runtime::activity::ActivityError;
use crate::FileMetadata;

/// Destination of extracted metadata.
///
/// `store` may run more than once for the same file and must leave exactly
/// one record behind.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn store(&self, metadata: &FileMetadata) -> Result<(), ActivityError>;
}

/// `file_metadata` table keyed by file name; repeated stores update in place.
pub struct SqliteMetadataSink {
    pool: SqlitePool,
}

impl SqliteMetadataSink {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = open_pool(database_url).await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_metadata (
                file_name TEXT PRIMARY KEY,
                file_size_kb REAL NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                format TEXT NOT NULL,
                uploaded TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM file_metadata")
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get(&self, file_name: &str) -> Result<Option<FileMetadata>, sqlx::Error> {
        let row = sqlx::query("SELECT file_name, file_size_kb, width, height, format FROM file_metadata WHERE file_name = ?")
            .bind(file_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok::<_, sqlx::Error>(FileMetadata {
                file_name: r.try_get("file_name")?,
                file_size_kb: r.try_get("file_size_kb")?,
                width: r.try_get::<i64, _>("width")? as u32,
                height: r.try_get::<i64, _>("height")? as u32,
                format: r.try_get("format")?,
            })
        })
        .transpose()
    }

    fn classify(e: sqlx::Error) -> ActivityError {
        let msg = e.to_string();
        match &e {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_check_violation()
                    || db.is_foreign_key_violation()
                    || msg.contains("no such table")
                    || msg.contains("NOT NULL constraint") =>
            {
                ActivityError::non_retryable(format!("metadata rejected: {msg}"))
            }
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::TypeNotFound { .. } => {
                ActivityError::non_retryable(format!("metadata schema mismatch: {msg}"))
            }
            _ => ActivityError::transient(format!("metadata store unavailable: {msg}")),
        }
    }
}

#[async_trait]
impl MetadataSink for SqliteMetadataSink {
    async fn store(&self, metadata: &FileMetadata) -> Result<(), ActivityError> {
        let uploaded = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO file_metadata (file_name, file_size_kb, width, height, format, uploaded)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_name) DO UPDATE SET
                file_size_kb = excluded.file_size_kb,
                width = excluded.width,
                height = excluded.height,
                format = excluded.format
            "#,
        )
        .bind(&metadata.file_name)
        .bind(metadata.file_size_kb)
        .bind(i64::from(metadata.width))
        .bind(i64::from(metadata.height))
        .bind(&metadata.format)
        .bind(uploaded)
        .execute(&self.pool)
        .await
        .map_err(Self::classify)?;
        tracing::debug!(
            target: "durable_ingest::activities::store",
            file_name = %metadata.file_name,
            "metadata stored"
        );
        Ok(())
    }
}

/// Sink for tests: keeps the latest record per file and counts every call.
#[derive(Default)]
pub struct InMemoryMetadataSink {
    rows: Mutex<HashMap<String, FileMetadata>>,
    calls: AtomicUsize,
}

impl InMemoryMetadataSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<FileMetadata> {
        let mut rows: Vec<FileMetadata> = self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        rows
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSink for InMemoryMetadataSink {
    async fn store(&self, metadata: &FileMetadata) -> Result<(), ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(metadata.file_name.clone(), metadata.clone());
        Ok(())
    }
}
