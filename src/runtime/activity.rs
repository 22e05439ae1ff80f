//! Activity handlers, their registry and the deadline-enforcing runner.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::ErrorKind;

/// Classified failure of one activity attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ActivityError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActivityError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActivityTransient, message)
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActivityNonRetryable, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
///
/// Handlers know nothing about workflow history and may run more than once
/// for the same step.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

/// Immutable registry mapping activity names to handlers.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder { map: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    /// Register a handler object. A later registration under the same name replaces it.
    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) -> Self {
        self.map.insert(name.into(), handler);
        self
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnActivity(f)))
    }

    /// Register an activity over JSON-encoded input and output.
    ///
    /// Undecodable input is a non-retryable failure.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        let wrapper = move |input_s: String| {
            let f = f.clone();
            async move {
                let input: In = serde_json::from_str(&input_s)
                    .map_err(|e| ActivityError::non_retryable(format!("invalid activity input: {e}")))?;
                let out = f(input).await?;
                serde_json::to_string(&out)
                    .map_err(|e| ActivityError::non_retryable(format!("unserializable activity output: {e}")))
            }
        };
        self.register(name, wrapper)
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}

/// Executes one activity attempt under a deadline.
///
/// Stateless with respect to history: it neither reads nor writes events.
#[derive(Clone)]
pub struct ActivityRunner {
    registry: ActivityRegistry,
    timeout_is_transient: bool,
}

impl ActivityRunner {
    pub fn new(registry: ActivityRegistry, timeout_is_transient: bool) -> Self {
        Self {
            registry,
            timeout_is_transient,
        }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Run `name` with `input`, abandoning it once `deadline` elapses.
    pub async fn invoke(&self, name: &str, input: String, deadline: Duration) -> Result<String, ActivityError> {
        let Some(handler) = self.registry.get(name) else {
            return Err(ActivityError::non_retryable(format!("unregistered activity '{name}'")));
        };
        let mut task = tokio::spawn(async move { handler.invoke(input).await });
        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(ActivityError::non_retryable(format!("activity '{name}' panicked")))
            }
            Ok(Err(_)) => Err(ActivityError::transient(format!("activity '{name}' was cancelled"))),
            Err(_) => {
                task.abort();
                let message = format!("activity '{name}' timed out after {}ms", deadline.as_millis());
                Err(if self.timeout_is_transient {
                    ActivityError::transient(message)
                } else {
                    ActivityError::non_retryable(message)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn runner(timeout_is_transient: bool) -> ActivityRunner {
        let registry = ActivityRegistry::builder()
            .register("Echo", |input: String| async move { Ok(input) })
            .register("Slow", |_input: String| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            })
            .register("Panics", |_input: String| async move {
                if true {
                    panic!("boom");
                }
                Ok(String::new())
            })
            .build();
        ActivityRunner::new(registry, timeout_is_transient)
    }

    #[test]
    fn registry_lists_sorted_unique_names() {
        let registry = ActivityRegistry::builder()
            .register("StoreMetadata", |input: String| async move { Ok(input) })
            .register("ExtractMetadata", |input: String| async move { Ok(input) })
            .register("StoreMetadata", |_input: String| async move { Ok(String::new()) })
            .build();
        assert_eq!(registry.list_names(), vec!["ExtractMetadata".to_string(), "StoreMetadata".to_string()]);
        assert!(registry.has("ExtractMetadata"));
        assert!(!registry.has("ResizeImage"));
    }

    #[tokio::test]
    async fn invokes_registered_handler() {
        let out = runner(true).invoke("Echo", "hi".into(), Duration::from_secs(1)).await;
        assert_eq!(out.unwrap(), "hi");
    }

    #[tokio::test]
    async fn deadline_classification_follows_configuration() {
        let err = runner(true)
            .invoke("Slow", String::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ActivityTransient);
        assert!(err.message.contains("timed out"));

        let err = runner(false)
            .invoke("Slow", String::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ActivityNonRetryable);
    }

    #[tokio::test]
    async fn abandoned_attempt_is_aborted() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let registry = ActivityRegistry::builder()
            .register("Slow", move |_input: String| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(String::new())
                }
            })
            .build();
        let runner = ActivityRunner::new(registry, true);
        assert!(runner.invoke("Slow", String::new(), Duration::from_millis(10)).await.is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unregistered_and_panicking_activities_are_not_retried() {
        let r = runner(true);
        let err = r.invoke("Missing", String::new(), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ActivityNonRetryable);
        let err = r.invoke("Panics", String::new(), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ActivityNonRetryable);
    }

    #[tokio::test]
    async fn typed_registration_decodes_input() {
        let registry = ActivityRegistry::builder()
            .register_typed("Double", |n: u32| async move { Ok::<u32, ActivityError>(n * 2) })
            .build();
        let runner = ActivityRunner::new(registry, true);
        assert_eq!(runner.invoke("Double", "21".into(), Duration::from_secs(1)).await.unwrap(), "42");
        let err = runner.invoke("Double", "nope".into(), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ActivityNonRetryable);
    }
}
