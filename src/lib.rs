//! Durable, replay-driven orchestration of upload metadata ingestion.
//!
//! Every workflow instance is an append-only sequence of [`Event`]s kept in a
//! [`providers::HistoryStore`]. The orchestration engine never keeps state of
//! its own: on every decision cycle it folds the full history into a
//! [`runtime::replay::ReplayState`], decides the next step of the fixed
//! `ExtractMetadata -> StoreMetadata` workflow, persists the resulting events
//! and only then hands activity work to the activity runner.
//!
//! - Data model: [`Event`], [`EventKind`], [`ErrorKind`], [`InstanceStatus`]
//! - History stores: in-memory, filesystem (JSONL) and SQLite providers
//! - Runtime: [`runtime::Runtime`], the instance dispatcher and activity runner
//! - Control plane: [`Client`] for status queries
//! - Activities: metadata extraction and idempotent metadata persistence

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod activities;
pub mod client;
pub mod config;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod trigger;

pub use client::{Client, WaitError};
pub use runtime::engine::{ActivityCall, Decision, WorkflowDefinition};
pub use runtime::retry::{BackoffStrategy, RetryPolicy};
pub use runtime::{Runtime, RuntimeOptions};

/// Activity that turns a [`TriggerInput`] into [`FileMetadata`].
pub const EXTRACT_METADATA_ACTIVITY: &str = "ExtractMetadata";
/// Activity that persists [`FileMetadata`] to the metadata sink.
pub const STORE_METADATA_ACTIVITY: &str = "StoreMetadata";

/// One persisted history record of a workflow instance.
///
/// `event_id` is the 1-based position of the event in the instance history.
/// It is assigned by the runtime, never by a provider or an activity, and is
/// contiguous: a provider must reject an append whose first id is not
/// `last + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub instance_id: String,
    /// Wall clock at persist time. Replay never looks at it.
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(instance_id: impl Into<String>, event_id: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            instance_id: instance_id.into(),
            timestamp_ms: now_ms(),
            kind,
        }
    }

    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    /// Stable name of the event type, used as the `event_type` column by stores.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    /// First event of every instance; carries the trigger payload.
    InstanceStarted { input: String },
    /// An activity attempt was scheduled. Retries reuse `sequence_no`.
    ActivityScheduled {
        name: String,
        input: String,
        sequence_no: u64,
        attempt: u32,
    },
    ActivityCompleted { sequence_no: u64, output: String },
    ActivityFailed {
        sequence_no: u64,
        error_kind: ErrorKind,
        message: String,
        attempt: u32,
    },
    InstanceCancelRequested { reason: String },
    InstanceCompleted { output: String },
    InstanceFailed { error_kind: ErrorKind, message: String },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::InstanceStarted { .. } => "InstanceStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::InstanceCancelRequested { .. } => "InstanceCancelRequested",
            EventKind::InstanceCompleted { .. } => "InstanceCompleted",
            EventKind::InstanceFailed { .. } => "InstanceFailed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::InstanceCompleted { .. } | EventKind::InstanceFailed { .. })
    }
}

/// Failure classification recorded in history.
///
/// Store outages and stale completions are deliberately absent: they are
/// runtime conditions, never part of an instance's recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The trigger payload cannot be processed. Never retried.
    TriggerMalformed,
    /// Timeout or transient infrastructure error; retried per [`RetryPolicy`].
    ActivityTransient,
    /// Validation or programming error; fails the instance immediately.
    ActivityNonRetryable,
    /// The instance was cancelled externally.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ActivityTransient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TriggerMalformed => "TriggerMalformed",
            ErrorKind::ActivityTransient => "ActivityTransient",
            ErrorKind::ActivityNonRetryable => "ActivityNonRetryable",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// High-level instance status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error_kind: ErrorKind, message: String },
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed { .. } | InstanceStatus::Failed { .. })
    }

    /// Derive the status from a history without replaying activity state.
    pub fn from_history(history: &[Event]) -> Self {
        if history.is_empty() {
            return InstanceStatus::NotFound;
        }
        for event in history.iter().rev() {
            match &event.kind {
                EventKind::InstanceCompleted { output } => {
                    return InstanceStatus::Completed { output: output.clone() };
                }
                EventKind::InstanceFailed { error_kind, message } => {
                    return InstanceStatus::Failed {
                        error_kind: *error_kind,
                        message: message.clone(),
                    };
                }
                _ => {}
            }
        }
        InstanceStatus::Running
    }
}

/// Payload supplied by the trigger source for a newly uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInput {
    /// `container/blob` path of the uploaded object.
    pub name: String,
    /// Object size in bytes.
    pub size: u64,
    pub uri: String,
}

/// Result of the extraction activity and final output of a completed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,
    #[serde(rename = "fileSizeKB")]
    pub file_size_kb: f64,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
