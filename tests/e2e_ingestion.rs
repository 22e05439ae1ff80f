use durable_ingest::activities::{InMemoryMetadataSink, SqliteMetadataSink};
use durable_ingest::providers::HistoryStore;
use durable_ingest::runtime::{ActivityError, ActivityRegistry};
use durable_ingest::trigger::request_for_upload;
use durable_ingest::{
    ErrorKind, EventKind, FileMetadata, InstanceStatus, Runtime, RuntimeOptions, TriggerInput,
    EXTRACT_METADATA_ACTIVITY, STORE_METADATA_ACTIVITY,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::*;

const WAIT: Duration = Duration::from_secs(10);

fn photo() -> FileMetadata {
    FileMetadata {
        file_name: "photo.jpg".into(),
        file_size_kb: 200.0,
        width: 800,
        height: 600,
        format: "JPEG".into(),
    }
}

async fn photo_scenario(store: Arc<dyn HistoryStore>) {
    let blobs = blobs_with("photo.jpg", jpeg(800, 600));
    let sink = Arc::new(InMemoryMetadataSink::new());
    let rt = Runtime::start_with_options(store.clone(), metadata_registry(blobs, sink.clone()), fast_options()).await;

    let request = request_for_upload(CONTAINER, "photo.jpg", 204800, "mem://images-input/photo.jpg");
    rt.trigger(&request).await.unwrap();
    let status = rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();

    let InstanceStatus::Completed { output } = status else {
        panic!("unexpected status {status:?}");
    };
    let output: FileMetadata = serde_json::from_str(&output).unwrap();
    assert_eq!(output, photo());
    assert_eq!(sink.rows(), vec![photo()]);

    let hist = store.read(&request.instance_id).await.unwrap();
    assert_contiguous(&hist);
    let kinds: Vec<&str> = hist.iter().map(|e| e.type_name()).collect();
    assert_eq!(
        kinds,
        vec![
            "InstanceStarted",
            "ActivityScheduled",
            "ActivityCompleted",
            "ActivityScheduled",
            "ActivityCompleted",
            "InstanceCompleted"
        ]
    );
    match &hist[1].kind {
        EventKind::ActivityScheduled {
            name,
            sequence_no,
            attempt,
            ..
        } => {
            assert_eq!(name, EXTRACT_METADATA_ACTIVITY);
            assert_eq!((*sequence_no, *attempt), (1, 1));
        }
        other => panic!("unexpected {other:?}"),
    }
    match &hist[3].kind {
        EventKind::ActivityScheduled { name, sequence_no, .. } => {
            assert_eq!(name, STORE_METADATA_ACTIVITY);
            assert_eq!(*sequence_no, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn photo_ingestion_in_memory() {
    photo_scenario(in_memory_store()).await;
}

#[tokio::test]
async fn photo_ingestion_fs() {
    let (store, _td) = create_fs_store();
    photo_scenario(store).await;
}

#[tokio::test]
async fn photo_ingestion_sqlite() {
    let (store, _td) = create_sqlite_store_disk().await;
    photo_scenario(store).await;
}

#[tokio::test]
async fn metadata_lands_in_sqlite_sink() {
    let blobs = blobs_with("photo.jpg", jpeg(800, 600));
    let sink = Arc::new(SqliteMetadataSink::new_in_memory().await.unwrap());
    let rt = Runtime::start_with_options(in_memory_store(), metadata_registry(blobs, sink.clone()), fast_options()).await;
    let request = request_for_upload(CONTAINER, "photo.jpg", 204800, "mem://images-input/photo.jpg");
    rt.trigger(&request).await.unwrap();
    let status = rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();
    assert!(matches!(status, InstanceStatus::Completed { .. }));
    assert_eq!(sink.count().await.unwrap(), 1);
    assert_eq!(sink.get("photo.jpg").await.unwrap(), Some(photo()));
    rt.shutdown().await;
}

#[tokio::test]
async fn svg_upload_is_measured() {
    let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 64 32"></svg>"#.to_vec();
    let blobs = blobs_with("logo.svg", svg);
    let sink = Arc::new(InMemoryMetadataSink::new());
    let rt = Runtime::start_with_options(in_memory_store(), metadata_registry(blobs, sink.clone()), fast_options()).await;
    let request = request_for_upload(CONTAINER, "logo.svg", 2048, "mem://images-input/logo.svg");
    rt.trigger(&request).await.unwrap();
    rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();
    let md: FileMetadata = rt.client().get_output(&request.instance_id).await.unwrap().unwrap();
    assert_eq!((md.width, md.height, md.format.as_str()), (64, 32, "SVG"));
    assert_eq!(md.file_size_kb, 2.0);
    rt.shutdown().await;
}

#[tokio::test]
async fn malformed_trigger_fails_without_scheduling() {
    let blobs = blobs_with("photo.jpg", jpeg(8, 8));
    let sink = Arc::new(InMemoryMetadataSink::new());
    let store = in_memory_store();
    let rt = Runtime::start_with_options(store.clone(), metadata_registry(blobs.clone(), sink.clone()), fast_options()).await;

    let input = TriggerInput {
        name: "photo.jpg".into(),
        size: 10,
        uri: "mem://photo.jpg".into(),
    };
    rt.start_instance("bad-1", &input).await.unwrap();
    let status = rt.client().wait_for_instance("bad-1", WAIT).await.unwrap();
    assert!(matches!(
        status,
        InstanceStatus::Failed {
            error_kind: ErrorKind::TriggerMalformed,
            ..
        }
    ));
    let hist = store.read("bad-1").await.unwrap();
    assert_eq!(hist.len(), 2);
    assert_eq!(count_kind(&hist, "ActivityScheduled"), 0);
    assert_eq!(blobs.fetch_count(), 0);
    assert_eq!(sink.call_count(), 0);

    // A payload that is not a trigger at all takes the same path.
    rt.dispatcher().on_trigger("bad-2", "not json".into()).await.unwrap();
    assert!(matches!(
        rt.client().wait_for_instance("bad-2", WAIT).await.unwrap(),
        InstanceStatus::Failed {
            error_kind: ErrorKind::TriggerMalformed,
            ..
        }
    ));
    rt.shutdown().await;
}

#[tokio::test]
async fn timeout_twice_then_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = calls.clone();
    let registry = ActivityRegistry::builder()
        .register(EXTRACT_METADATA_ACTIVITY, move |_input: String| {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(serde_json::to_string(&photo()).unwrap())
            }
        })
        .register(STORE_METADATA_ACTIVITY, |_input: String| async move { Ok("null".to_string()) })
        .build();
    let mut options = fast_options();
    options
        .activity_timeouts
        .insert(EXTRACT_METADATA_ACTIVITY.to_string(), Duration::from_millis(50));
    let store = in_memory_store();
    let rt = Runtime::start_with_options(store.clone(), registry, options).await;

    let request = request_for_upload(CONTAINER, "photo.jpg", 204800, "mem://images-input/photo.jpg");
    rt.trigger(&request).await.unwrap();
    let status = rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();
    assert!(matches!(status, InstanceStatus::Completed { .. }), "{status:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let hist = store.read(&request.instance_id).await.unwrap();
    assert_contiguous(&hist);
    let seq1: Vec<(&str, Option<u32>)> = hist
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled {
                sequence_no: 1, attempt, ..
            } => Some(("scheduled", Some(*attempt))),
            EventKind::ActivityFailed {
                sequence_no: 1,
                attempt,
                error_kind,
                ..
            } => {
                assert_eq!(*error_kind, ErrorKind::ActivityTransient);
                Some(("failed", Some(*attempt)))
            }
            EventKind::ActivityCompleted { sequence_no: 1, .. } => Some(("completed", None)),
            _ => None,
        })
        .collect();
    assert_eq!(
        seq1,
        vec![
            ("scheduled", Some(1)),
            ("failed", Some(1)),
            ("scheduled", Some(2)),
            ("failed", Some(2)),
            ("scheduled", Some(3)),
            ("completed", None)
        ]
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn retries_are_bounded_by_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = calls.clone();
    let registry = ActivityRegistry::builder()
        .register(EXTRACT_METADATA_ACTIVITY, move |_input: String| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ActivityError::transient("blob service busy"))
            }
        })
        .build();
    let store = in_memory_store();
    let rt = Runtime::start_with_options(store.clone(), registry, fast_options()).await;
    let request = request_for_upload(CONTAINER, "photo.jpg", 1, "mem://x");
    rt.trigger(&request).await.unwrap();

    let status = rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();
    let InstanceStatus::Failed { error_kind, message } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(error_kind, ErrorKind::ActivityNonRetryable);
    assert!(message.contains("3 attempt"), "{message}");

    let hist = store.read(&request.instance_id).await.unwrap();
    assert_eq!(count_scheduled(&hist, 1), 3);
    assert_eq!(count_kind(&hist, "ActivityFailed"), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn non_retryable_failure_fails_immediately() {
    let blobs = Arc::new(durable_ingest::activities::InMemoryBlobSource::new());
    let sink = Arc::new(InMemoryMetadataSink::new());
    let store = in_memory_store();
    let rt = Runtime::start_with_options(store.clone(), metadata_registry(blobs, sink.clone()), fast_options()).await;
    let request = request_for_upload(CONTAINER, "missing.jpg", 1, "mem://x");
    rt.trigger(&request).await.unwrap();

    let status = rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();
    assert!(matches!(
        status,
        InstanceStatus::Failed {
            error_kind: ErrorKind::ActivityNonRetryable,
            ..
        }
    ));
    let hist = store.read(&request.instance_id).await.unwrap();
    assert_eq!(count_scheduled(&hist, 1), 1);
    assert_eq!(count_scheduled(&hist, 2), 0);
    assert_eq!(sink.call_count(), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn transient_fetch_errors_are_retried() {
    let blobs = blobs_with("photo.jpg", jpeg(800, 600));
    blobs.fail_next(2);
    let sink = Arc::new(InMemoryMetadataSink::new());
    let store = in_memory_store();
    let rt = Runtime::start_with_options(store.clone(), metadata_registry(blobs.clone(), sink), fast_options()).await;
    let request = request_for_upload(CONTAINER, "photo.jpg", 204800, "mem://x");
    rt.trigger(&request).await.unwrap();
    let status = rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();
    assert!(matches!(status, InstanceStatus::Completed { .. }));
    assert_eq!(blobs.fetch_count(), 3);
    assert_eq!(count_scheduled(&store.read(&request.instance_id).await.unwrap(), 1), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_instance() {
    let options = RuntimeOptions {
        retry: durable_ingest::RetryPolicy::new(5),
        ..fast_options()
    };
    let rt = Runtime::start_with_options(in_memory_store(), ActivityRegistry::builder().build(), options).await;
    let request = request_for_upload(CONTAINER, "photo.jpg", 1, "mem://x");
    rt.trigger(&request).await.unwrap();
    let status = rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();
    assert!(matches!(
        status,
        InstanceStatus::Failed {
            error_kind: ErrorKind::ActivityNonRetryable,
            ..
        }
    ));
    rt.shutdown().await;
}

#[tokio::test]
async fn retries_that_outgrow_the_history_limit_fail_the_instance() {
    let td = tempfile::tempdir().unwrap();
    let store: Arc<dyn HistoryStore> =
        Arc::new(durable_ingest::providers::fs::FsHistoryStore::new_with_cap(td.path(), false, 6).unwrap());
    let registry = ActivityRegistry::builder()
        .register(EXTRACT_METADATA_ACTIVITY, |_input: String| async move {
            Err(ActivityError::transient("blob service busy"))
        })
        .build();
    let options = RuntimeOptions {
        retry: durable_ingest::RetryPolicy::new(10).with_backoff(durable_ingest::BackoffStrategy::None),
        ..fast_options()
    };
    let rt = Runtime::start_with_options(store.clone(), registry, options).await;
    let request = request_for_upload(CONTAINER, "photo.jpg", 1, "mem://x");
    rt.trigger(&request).await.unwrap();

    let status = rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();
    let InstanceStatus::Failed { error_kind, message } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(error_kind, ErrorKind::ActivityNonRetryable);
    assert!(message.contains("history limit"), "{message}");

    let hist = store.read(&request.instance_id).await.unwrap();
    assert_contiguous(&hist);
    assert_eq!(hist.len(), 6);
    assert_eq!(count_scheduled(&hist, 1), 2);
    assert!(matches!(hist[5].kind, EventKind::InstanceFailed { .. }));
    rt.shutdown().await;
}
