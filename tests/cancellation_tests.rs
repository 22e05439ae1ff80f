use durable_ingest::activities::InMemoryMetadataSink;
use durable_ingest::runtime::{ActivityRegistry, DispatchError};
use durable_ingest::trigger::request_for_upload;
use durable_ingest::{Decision, ErrorKind, InstanceStatus, Runtime, EXTRACT_METADATA_ACTIVITY};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::*;

const WAIT: Duration = Duration::from_secs(10);

fn stuck_registry() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register(EXTRACT_METADATA_ACTIVITY, |_input: String| async move {
            std::future::pending::<()>().await;
            Ok(String::new())
        })
        .build()
}

#[tokio::test]
async fn cancel_running_instance() {
    let store = in_memory_store();
    let rt = Runtime::start_with_options(store.clone(), stuck_registry(), fast_options()).await;
    let request = request_for_upload(CONTAINER, "photo.jpg", 1, "mem://x");
    rt.trigger(&request).await.unwrap();
    let id = request.instance_id.as_str();

    let decision = rt.cancel_instance(id, "operator request").await.unwrap();
    assert!(matches!(
        decision,
        Decision::Fail {
            error_kind: ErrorKind::Cancelled,
            ..
        }
    ));
    let status = rt.client().wait_for_instance(id, WAIT).await.unwrap();
    let InstanceStatus::Failed { error_kind, message } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(error_kind, ErrorKind::Cancelled);
    assert!(message.contains("operator request"));

    let hist = store.read(id).await.unwrap();
    assert_contiguous(&hist);
    assert_eq!(count_kind(&hist, "InstanceCancelRequested"), 1);

    // The outstanding attempt's late outcome is dropped.
    let err = rt
        .dispatcher()
        .on_activity_completion(id, 1, 1, "{}".into())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::StaleCompletion { .. }));

    // Cancelling again reports the terminal status and records nothing.
    let again = rt.cancel_instance(id, "twice").await.unwrap();
    assert!(matches!(again, Decision::Terminal(InstanceStatus::Failed { .. })));
    assert_eq!(store.read(id).await.unwrap(), hist);
    rt.shutdown().await;
}

#[tokio::test]
async fn cancel_completed_instance_is_a_no_op() {
    let blobs = blobs_with("photo.jpg", jpeg(800, 600));
    let sink = Arc::new(InMemoryMetadataSink::new());
    let store = in_memory_store();
    let rt = Runtime::start_with_options(store.clone(), metadata_registry(blobs, sink), fast_options()).await;
    let request = request_for_upload(CONTAINER, "photo.jpg", 204800, "mem://x");
    rt.trigger(&request).await.unwrap();
    rt.client().wait_for_instance(&request.instance_id, WAIT).await.unwrap();

    let before = store.read(&request.instance_id).await.unwrap();
    let decision = rt.cancel_instance(&request.instance_id, "too late").await.unwrap();
    assert!(matches!(decision, Decision::Terminal(InstanceStatus::Completed { .. })));
    assert_eq!(store.read(&request.instance_id).await.unwrap(), before);
    rt.shutdown().await;
}

#[tokio::test]
async fn cancel_unknown_instance() {
    let rt = Runtime::start_with_options(in_memory_store(), stuck_registry(), fast_options()).await;
    let err = rt.cancel_instance("images-input/nope.jpg", "x").await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownInstance(_)));
    rt.shutdown().await;
}

#[tokio::test]
async fn cancellation_survives_restart() {
    let (store, td) = create_fs_store();
    let rt = Runtime::start_with_options(store.clone(), stuck_registry(), fast_options()).await;
    let request = request_for_upload(CONTAINER, "photo.jpg", 1, "mem://x");
    rt.trigger(&request).await.unwrap();
    rt.cancel_instance(&request.instance_id, "shutdown").await.unwrap();
    rt.shutdown().await;

    let reopened = reopen_fs_store(&td);
    let rt = Runtime::start_with_options(reopened.clone(), stuck_registry(), fast_options()).await;
    let status = rt.get_instance_status(&request.instance_id).await.unwrap();
    assert!(matches!(
        status,
        InstanceStatus::Failed {
            error_kind: ErrorKind::Cancelled,
            ..
        }
    ));
    assert_eq!(count_scheduled(&reopened.read(&request.instance_id).await.unwrap(), 1), 1);
    rt.shutdown().await;
}
