use std::collections::HashMap;

use crate::{Event, EventKind};

pub mod error;
pub use error::ProviderError;

/// Storage abstraction for append-only history per workflow instance.
///
/// Providers are datastores only: they never allocate event ids or sequence
/// numbers and never interpret activity payloads. They must be durable
/// (data is flushed/committed before a call returns `Ok`) and linearizable per
/// instance: concurrent appends for one instance are totally ordered and an
/// append that does not continue the current history is rejected.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Read the full history for an instance. Unknown instances read as empty.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Atomically create an instance with its initial events.
    ///
    /// Returns `Ok(false)` without writing anything when the instance already
    /// exists, which makes duplicate trigger delivery a no-op.
    async fn create_instance(&self, instance: &str, initial_events: Vec<Event>) -> Result<bool, ProviderError>;

    /// Append events to an existing instance.
    ///
    /// Fails permanently if the instance does not exist or the events do not
    /// pass [`validate_append`] against the stored history.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Largest number of events one instance may hold, if the provider has a limit.
    fn history_cap(&self) -> Option<usize> {
        None
    }

    /// Id of the last event of the instance, 0 when it has no history.
    async fn latest_event_id(&self, instance: &str) -> Result<u64, ProviderError> {
        Ok(self.read(instance).await?.last().map(|e| e.event_id).unwrap_or(0))
    }
}

/// Validate that `new_events` may be appended after `existing`.
///
/// Enforced rules:
/// - events belong to `instance` and continue the event id sequence (`last + 1`, contiguous)
/// - the first event of an instance is `InstanceStarted`, and only the first
/// - nothing is appended after `InstanceCompleted`/`InstanceFailed`
/// - a new step's `sequence_no` is greater than every previous one; re-scheduling an
///   existing `sequence_no` is only allowed after its last attempt failed, with `attempt + 1`
/// - `ActivityCompleted`/`ActivityFailed` for `N` require an unresolved `ActivityScheduled` for `N`
pub fn validate_append(instance: &str, existing: &[Event], new_events: &[Event]) -> Result<(), ProviderError> {
    const OP: &str = "append";

    #[derive(Clone, Copy, PartialEq)]
    enum Slot {
        Outstanding(u32),
        Failed(u32),
        Completed,
    }

    let mut slots: HashMap<u64, Slot> = HashMap::new();
    let mut max_seq = 0u64;
    let mut terminal = false;
    let mut last_id = 0u64;

    let mut apply = |ev: &Event, is_new: bool| -> Result<(), ProviderError> {
        if ev.instance_id != instance {
            return Err(ProviderError::permanent(
                OP,
                format!("event {} belongs to '{}', not '{instance}'", ev.event_id, ev.instance_id),
            ));
        }
        if is_new && ev.event_id != last_id + 1 {
            return Err(ProviderError::permanent(
                OP,
                format!(
                    "event_id conflict for '{instance}': expected {}, got {}",
                    last_id + 1,
                    ev.event_id
                ),
            ));
        }
        last_id = ev.event_id;
        if terminal && is_new {
            return Err(ProviderError::permanent(OP, format!("instance '{instance}' is terminal")));
        }
        let first = ev.event_id == 1;
        match &ev.kind {
            EventKind::InstanceStarted { .. } if !first => {
                return Err(ProviderError::permanent(OP, "InstanceStarted must be the first event"));
            }
            _ if first && !matches!(ev.kind, EventKind::InstanceStarted { .. }) => {
                return Err(ProviderError::permanent(OP, "history must start with InstanceStarted"));
            }
            EventKind::ActivityScheduled { sequence_no, attempt, .. } => {
                match slots.get(sequence_no).copied() {
                    None if *sequence_no > max_seq && *attempt == 1 => {
                        max_seq = *sequence_no;
                        slots.insert(*sequence_no, Slot::Outstanding(1));
                    }
                    Some(Slot::Failed(prev)) if *attempt == prev + 1 => {
                        slots.insert(*sequence_no, Slot::Outstanding(*attempt));
                    }
                    _ if is_new => {
                        return Err(ProviderError::permanent(
                            OP,
                            format!("invalid schedule of sequence_no {sequence_no} attempt {attempt}"),
                        ));
                    }
                    _ => {}
                }
            }
            EventKind::ActivityCompleted { sequence_no, .. } => match slots.get(sequence_no).copied() {
                Some(Slot::Outstanding(_)) => {
                    slots.insert(*sequence_no, Slot::Completed);
                }
                _ if is_new => {
                    return Err(ProviderError::permanent(
                        OP,
                        format!("completion for sequence_no {sequence_no} without an outstanding schedule"),
                    ));
                }
                _ => {}
            },
            EventKind::ActivityFailed {
                sequence_no, attempt, ..
            } => match slots.get(sequence_no).copied() {
                Some(Slot::Outstanding(current)) if current == *attempt => {
                    slots.insert(*sequence_no, Slot::Failed(*attempt));
                }
                _ if is_new => {
                    return Err(ProviderError::permanent(
                        OP,
                        format!("failure for sequence_no {sequence_no} attempt {attempt} without an outstanding schedule"),
                    ));
                }
                _ => {}
            },
            EventKind::InstanceCompleted { .. } | EventKind::InstanceFailed { .. } => {
                terminal = true;
            }
            _ => {}
        }
        Ok(())
    };

    for ev in existing {
        apply(ev, false)?;
    }
    if new_events.is_empty() {
        return Err(ProviderError::permanent(OP, "nothing to append"));
    }
    for ev in new_events {
        apply(ev, true)?;
    }
    Ok(())
}

/// In-memory provider for tests.
pub mod in_memory;
/// Filesystem-backed provider writing one JSONL file per instance.
pub mod fs;
/// SQLite-backed provider with transactional appends.
pub mod sqlite;
