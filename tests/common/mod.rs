#![allow(dead_code)]

use async_trait::async_trait;
use durable_ingest::activities::{register_metadata_activities, BlobSource, InMemoryBlobSource, MetadataSink};
use durable_ingest::providers::fs::FsHistoryStore;
use durable_ingest::providers::in_memory::InMemoryHistoryStore;
use durable_ingest::providers::sqlite::SqliteHistoryStore;
use durable_ingest::providers::{HistoryStore, ProviderError};
use durable_ingest::runtime::ActivityRegistry;
use durable_ingest::{BackoffStrategy, Event, EventKind, RetryPolicy, RuntimeOptions};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const CONTAINER: &str = "images-input";

pub fn in_memory_store() -> StdArc<dyn HistoryStore> {
    StdArc::new(InMemoryHistoryStore::new()) as StdArc<dyn HistoryStore>
}

pub fn create_fs_store() -> (StdArc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), false).unwrap()) as StdArc<dyn HistoryStore>;
    (store, td)
}

pub fn reopen_fs_store(td: &TempDir) -> StdArc<dyn HistoryStore> {
    StdArc::new(FsHistoryStore::new(td.path(), false).unwrap()) as StdArc<dyn HistoryStore>
}

pub fn sqlite_url(td: &TempDir) -> String {
    format!("sqlite:{}", td.path().join("history.db").display())
}

pub async fn create_sqlite_store_disk() -> (StdArc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(SqliteHistoryStore::new(&sqlite_url(&td)).await.unwrap()) as StdArc<dyn HistoryStore>;
    (store, td)
}

pub async fn reopen_sqlite_store(td: &TempDir) -> StdArc<dyn HistoryStore> {
    StdArc::new(SqliteHistoryStore::new(&sqlite_url(td)).await.unwrap()) as StdArc<dyn HistoryStore>
}

/// Options with immediate retries and short deadlines.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        retry: RetryPolicy::new(3).with_backoff(BackoffStrategy::None),
        default_activity_timeout: Duration::from_secs(5),
        report_retry_delay: Duration::from_millis(10),
        ..RuntimeOptions::default()
    }
}

pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::new(width, height);
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

pub fn blobs_with(name: &str, bytes: Vec<u8>) -> StdArc<InMemoryBlobSource> {
    let blobs = StdArc::new(InMemoryBlobSource::new());
    blobs.insert(CONTAINER, name, bytes);
    blobs
}

pub fn metadata_registry(blobs: StdArc<dyn BlobSource>, sink: StdArc<dyn MetadataSink>) -> ActivityRegistry {
    register_metadata_activities(ActivityRegistry::builder(), blobs, sink).build()
}

pub fn count_scheduled(hist: &[Event], sequence_no: u64) -> usize {
    hist.iter()
        .filter(|e| matches!(&e.kind, EventKind::ActivityScheduled { sequence_no: s, .. } if *s == sequence_no))
        .count()
}

pub fn count_kind(hist: &[Event], type_name: &str) -> usize {
    hist.iter().filter(|e| e.type_name() == type_name).count()
}

pub fn assert_contiguous(hist: &[Event]) {
    for (i, e) in hist.iter().enumerate() {
        assert_eq!(e.event_id, i as u64 + 1, "event ids must be contiguous: {hist:#?}");
    }
}

pub async fn wait_for_history<F>(store: StdArc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await {
            if predicate(&hist) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Store wrapper that can be switched into a simulated outage.
pub struct FaultyStore {
    inner: StdArc<dyn HistoryStore>,
    fail_reads: AtomicBool,
    fail_appends: AtomicBool,
    rejected: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: StdArc<dyn HistoryStore>) -> StdArc<Self> {
        StdArc::new(Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_appends: AtomicBool::new(false),
            rejected: AtomicUsize::new(0),
        })
    }

    pub fn set_outage(&self, reads: bool, appends: bool) {
        self.fail_reads.store(reads, Ordering::SeqCst);
        self.fail_appends.store(appends, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.set_outage(false, false);
    }

    /// Calls refused while the outage was active.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, op: &str) -> Result<(), ProviderError> {
        if flag.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::retryable(op, "simulated outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FaultyStore {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.check(&self.fail_reads, "read")?;
        self.inner.read(instance).await
    }

    async fn create_instance(&self, instance: &str, initial_events: Vec<Event>) -> Result<bool, ProviderError> {
        self.check(&self.fail_appends, "create_instance")?;
        self.inner.create_instance(instance, initial_events).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        self.check(&self.fail_appends, "append")?;
        self.inner.append(instance, new_events).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.check(&self.fail_reads, "list_instances")?;
        self.inner.list_instances().await
    }
}
