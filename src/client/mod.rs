use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::providers::{HistoryStore, ProviderError};
use crate::runtime::replay::ReplayState;
use crate::{Event, InstanceStatus};

/// Error type returned by instance wait helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for instance")]
    Timeout,
    #[error(transparent)]
    Store(ProviderError),
}

/// Thin read-only client for control-plane queries.
///
/// Talks to the runtime exclusively through the shared history store, so it
/// works from another process pointed at the same store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
}

impl Client {
    /// Create a client bound to a history store.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Status derived from history. A failed instance reports its recorded
    /// error kind and message.
    pub async fn get_instance_status(&self, instance: &str) -> Result<InstanceStatus, ProviderError> {
        let history = self.store.read(instance).await?;
        // Corrupted histories still report what their terminal event says.
        Ok(match ReplayState::fold(&history) {
            Ok(state) => state.status(),
            Err(_) => InstanceStatus::from_history(&history),
        })
    }

    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.store.read(instance).await
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.store.list_instances().await
    }

    /// Poll until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_instance(&self, instance: &str, timeout: Duration) -> Result<InstanceStatus, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.get_instance_status(instance).await.map_err(WaitError::Store)?;
            if status.is_terminal() {
                return Ok(status);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Decode the output of a completed instance. `Ok(None)` while it is not completed.
    pub async fn get_output<T: serde::de::DeserializeOwned>(&self, instance: &str) -> Result<Option<T>, ProviderError> {
        match self.get_instance_status(instance).await? {
            InstanceStatus::Completed { output } => serde_json::from_str(&output)
                .map(Some)
                .map_err(|e| ProviderError::permanent("get_output", format!("undecodable output: {e}"))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryHistoryStore;
    use crate::EventKind;

    #[tokio::test]
    async fn wait_times_out_for_running_instance() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let started = Event::new("i", 1, EventKind::InstanceStarted { input: "{}".into() });
        store.create_instance("i", vec![started]).await.unwrap();
        let client = Client::new(store);
        assert_eq!(client.get_instance_status("i").await.unwrap(), InstanceStatus::Running);
        assert_eq!(
            client.wait_for_instance("i", Duration::from_millis(30)).await,
            Err(WaitError::Timeout)
        );
        assert_eq!(client.get_instance_status("nope").await.unwrap(), InstanceStatus::NotFound);
    }

    #[tokio::test]
    async fn wait_returns_terminal_status_and_output() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let started = Event::new("i", 1, EventKind::InstanceStarted { input: "{}".into() });
        store.create_instance("i", vec![started]).await.unwrap();
        let done = Event::new("i", 2, EventKind::InstanceCompleted { output: "[1,2]".into() });
        store.append("i", vec![done]).await.unwrap();
        let client = Client::new(store);
        let status = client.wait_for_instance("i", Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, InstanceStatus::Completed { output: "[1,2]".into() });
        assert_eq!(client.get_output::<Vec<u32>>("i").await.unwrap(), Some(vec![1, 2]));
    }
}
