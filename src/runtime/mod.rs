//! In-process runtime: options, wiring and lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub mod activity;
pub mod dispatchers;
pub mod engine;
pub mod locks;
pub mod replay;
pub mod retry;

pub use activity::{ActivityError, ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, ActivityRunner, FnActivity};
pub use dispatchers::{DispatchError, InstanceDispatcher, TriggerOutcome};

use crate::client::Client;
use crate::logging::{init_logging, LoggingConfig};
use crate::providers::HistoryStore;
use crate::trigger::TriggerRequest;
use crate::{InstanceStatus, TriggerInput};
use engine::{Decision, WorkflowDefinition};
use retry::RetryPolicy;

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Retry policy applied to every activity of the workflow.
    pub retry: RetryPolicy,
    /// Deadline of an attempt when neither `retry.timeout` nor `activity_timeouts` names one.
    pub default_activity_timeout: Duration,
    /// Per-activity deadlines by activity name.
    pub activity_timeouts: HashMap<String, Duration>,
    /// Whether an expired deadline is retried (`ActivityTransient`) or fails the
    /// instance (`ActivityNonRetryable`).
    pub timeout_is_transient: bool,
    /// Maximum number of activity attempts executing at once.
    pub worker_concurrency: usize,
    /// Pause between attempts to report an outcome while the history store is down.
    pub report_retry_delay: Duration,
    pub workflow: WorkflowDefinition,
    /// Installs a global subscriber on start when set. An existing subscriber is kept.
    pub logging: Option<LoggingConfig>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_activity_timeout: Duration::from_secs(30),
            activity_timeouts: HashMap::new(),
            timeout_is_transient: true,
            worker_concurrency: 8,
            report_retry_delay: Duration::from_millis(50),
            workflow: WorkflowDefinition::metadata_pipeline(),
            logging: None,
        }
    }
}

/// In-process runtime executing the workflow against a history store.
pub struct Runtime {
    dispatcher: Arc<InstanceDispatcher>,
}

impl Runtime {
    /// Start with an in-memory history store.
    pub async fn start(activities: ActivityRegistry) -> Arc<Self> {
        let store: Arc<dyn HistoryStore> = Arc::new(crate::providers::in_memory::InMemoryHistoryStore::new());
        Self::start_with_options(store, activities, RuntimeOptions::default()).await
    }

    pub async fn start_with_store(store: Arc<dyn HistoryStore>, activities: ActivityRegistry) -> Arc<Self> {
        Self::start_with_options(store, activities, RuntimeOptions::default()).await
    }

    /// Start the runtime and run the recovery sweep.
    ///
    /// A failed sweep is logged; [`Runtime::recover`] can be called again once
    /// the store is reachable.
    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        if let Some(cfg) = &options.logging {
            if let Err(e) = init_logging(cfg) {
                debug!(target: "durable_ingest::runtime", error = %e, "keeping existing tracing subscriber");
            }
        }
        for step in &options.workflow.steps {
            if !activities.has(step) {
                warn!(target: "durable_ingest::runtime", activity_name = %step, "workflow step has no registered activity");
            }
        }
        debug!(
            target: "durable_ingest::runtime",
            store = store.name(),
            workflow = %options.workflow.name,
            max_attempts = options.retry.max_attempts,
            activities = ?activities.list_names(),
            "starting runtime"
        );

        let runner = ActivityRunner::new(activities, options.timeout_is_transient);
        let dispatcher = InstanceDispatcher::new(store, runner, options);
        let rt = Arc::new(Self { dispatcher });
        if let Err(e) = rt.recover().await {
            warn!(target: "durable_ingest::runtime", error = %e, "recovery sweep failed at start");
        }
        rt
    }

    pub fn dispatcher(&self) -> &Arc<InstanceDispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.dispatcher.store().clone()
    }

    pub fn client(&self) -> Client {
        Client::new(self.store())
    }

    /// Start an instance for `input` under `instance`. Duplicate delivery is a no-op.
    pub async fn start_instance(&self, instance: &str, input: &TriggerInput) -> Result<TriggerOutcome, DispatchError> {
        let payload = serde_json::to_string(input).map_err(|e| DispatchError::InvalidInput(e.to_string()))?;
        self.dispatcher.on_trigger(instance, payload).await
    }

    pub async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerOutcome, DispatchError> {
        self.start_instance(&request.instance_id, &request.input).await
    }

    pub async fn cancel_instance(&self, instance: &str, reason: &str) -> Result<Decision, DispatchError> {
        self.dispatcher.request_cancel(instance, reason).await
    }

    pub async fn recover(&self) -> Result<usize, DispatchError> {
        self.dispatcher.recover().await
    }

    pub async fn get_instance_status(&self, instance: &str) -> Result<InstanceStatus, crate::providers::ProviderError> {
        self.client().get_instance_status(instance).await
    }

    /// Abort running attempts and stop dispatching.
    pub async fn shutdown(self: Arc<Self>) {
        self.dispatcher.shutdown().await;
    }
}
