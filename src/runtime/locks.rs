//! Per-instance serialization of decision cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per instance id. Different instances never contend.
#[derive(Default)]
pub struct InstanceLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Proof that the holder is the only decision cycle running for `instance`.
pub struct InstanceGuard {
    instance: String,
    _guard: OwnedMutexGuard<()>,
}

impl InstanceGuard {
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, instance: &str) -> InstanceGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds or waits on before the map grows further.
            if map.len() >= 1024 {
                map.retain(|_, m| Arc::strong_count(m) > 1);
            }
            map.entry(instance.to_string()).or_default().clone()
        };
        InstanceGuard {
            instance: instance.to_string(),
            _guard: slot.lock_owned().await,
        }
    }

    /// Number of tracked instances (test utility).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_instance_is_serialized() {
        let locks = Arc::new(InstanceLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let (locks, active, max_seen) = (locks.clone(), active.clone(), max_seen.clone());
            handles.push(tokio::spawn(async move {
                let _g = locks.lock("inst").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_instances_do_not_block() {
        let locks = InstanceLocks::new();
        let a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b"))
            .await
            .expect("lock for another instance must not wait");
        assert_eq!(a.instance(), "a");
        assert_eq!(b.instance(), "b");
        assert_eq!(locks.len(), 2);
    }
}
