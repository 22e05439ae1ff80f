//! Trigger source adapter for blob-created notifications.
//!
//! Turns a storage notification into a [`TriggerRequest`] whose instance id is
//! derived from the container and blob name, so redelivery of the same
//! notification maps to the same instance.

use serde::Deserialize;
use tracing::debug;

use crate::TriggerInput;

const SUBJECT_BLOBS: &str = "/blobs/";

/// Storage notification for a created blob.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobCreatedEvent {
    pub api: String,
    /// Full URL of the blob.
    pub url: String,
    /// e.g. `/blobServices/default/containers/images-input/blobs/photo.jpg`
    pub subject: String,
    #[serde(default)]
    pub content_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("invalid notification: {0}")]
    InvalidNotification(String),
    #[error("malformed blob subject '{0}'")]
    MalformedSubject(String),
}

/// Instance to start and its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    pub instance_id: String,
    pub input: TriggerInput,
}

impl BlobCreatedEvent {
    pub fn from_json(json: &str) -> Result<Self, TriggerError> {
        serde_json::from_str(json).map_err(|e| TriggerError::InvalidNotification(e.to_string()))
    }

    /// `Ok(None)` for anything but a `PutBlob` notification.
    pub fn into_request(self) -> Result<Option<TriggerRequest>, TriggerError> {
        if self.api != "PutBlob" {
            debug!(target: "durable_ingest::trigger", api = %self.api, "ignoring notification");
            return Ok(None);
        }
        let (container, blob) =
            split_subject(&self.subject).ok_or_else(|| TriggerError::MalformedSubject(self.subject.clone()))?;
        Ok(Some(request_for_upload(container, blob, self.content_length, self.url)))
    }
}

/// Stable instance id for a blob.
pub fn instance_id_for(container: &str, blob: &str) -> String {
    format!("{container}/{blob}")
}

pub fn request_for_upload(container: &str, blob: &str, size: u64, uri: impl Into<String>) -> TriggerRequest {
    let name = instance_id_for(container, blob);
    TriggerRequest {
        instance_id: name.clone(),
        input: TriggerInput {
            name,
            size,
            uri: uri.into(),
        },
    }
}

/// `(container, blob)` of a `.../{container}/blobs/{blob}` subject.
fn split_subject(subject: &str) -> Option<(&str, &str)> {
    let (prefix, blob) = subject.split_once(SUBJECT_BLOBS)?;
    let container = prefix.rsplit('/').next()?;
    (!container.is_empty() && !blob.is_empty()).then_some((container, blob))
}

/// `(container, blob)` of a trigger name.
///
/// Accepts `container/blob` and, for names with a leading `/`, the subject
/// form, which must contain `/blobs/`.
pub fn split_blob_name(name: &str) -> Option<(&str, &str)> {
    if name.starts_with('/') {
        return split_subject(name);
    }
    let (container, blob) = name.split_once('/')?;
    (!container.is_empty() && !blob.is_empty()).then_some((container, blob))
}

pub fn validate_trigger_input(input: &TriggerInput) -> Result<(), String> {
    if split_blob_name(&input.name).is_some() {
        return Ok(());
    }
    if input.name.starts_with('/') {
        Err(format!("trigger name '{}' has no '{SUBJECT_BLOBS}' separator", input.name))
    } else {
        Err(format!("trigger name '{}' is not of the form container/blob", input.name))
    }
}

/// Validator over the JSON payload recorded in `InstanceStarted`.
pub fn validate_trigger_payload(payload: &str) -> Result<(), String> {
    let input: TriggerInput =
        serde_json::from_str(payload).map_err(|e| format!("trigger payload is not a valid trigger input: {e}"))?;
    validate_trigger_input(&input)
}
