use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{validate_append, HistoryStore, ProviderError};
use crate::Event;

const CAP: usize = 1024;

/// Volatile history store. All data is lost with the process; intended for tests.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Vec<Event>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    fn history_cap(&self) -> Option<usize> {
        Some(CAP)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self.inner.lock().await.get(instance).cloned().unwrap_or_default())
    }

    async fn create_instance(&self, instance: &str, initial_events: Vec<Event>) -> Result<bool, ProviderError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Ok(false);
        }
        validate_append(instance, &[], &initial_events)?;
        g.insert(instance.to_string(), initial_events);
        Ok(true)
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let cur = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;
        if cur.len() + new_events.len() > CAP {
            return Err(ProviderError::permanent(
                "append",
                format!(
                    "history cap exceeded (cap={CAP}, have={}, append={})",
                    cur.len(),
                    new_events.len()
                ),
            ));
        }
        validate_append(instance, cur, &new_events)?;
        cur.extend(new_events);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut ids: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
