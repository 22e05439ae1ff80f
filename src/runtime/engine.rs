//! Orchestration engine: replay, decide, persist.
//!
//! A decision cycle reads the full history of an instance, folds it with
//! [`ReplayState::fold`], computes the next [`Decision`] with the pure
//! [`decide`] function and appends the events that decision implies. The
//! caller only acts on a decision (dispatching activity work) after
//! [`Engine::advance`] returned it, so every side effect is preceded by a
//! durable record of the intent.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::locks::{InstanceGuard, InstanceLocks};
use super::replay::{ReplayError, ReplayState, StepState};
use super::retry::RetryPolicy;
use crate::providers::{HistoryStore, ProviderError};
use crate::{ErrorKind, Event, EventKind, InstanceStatus, EXTRACT_METADATA_ACTIVITY, STORE_METADATA_ACTIVITY};

/// Pure check applied to the instance input before the first step is scheduled.
pub type InputValidator = fn(&str) -> Result<(), String>;

/// Ordered list of activities run one after another, each fed the previous output.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<String>,
    /// Index of the step whose output becomes the instance output.
    pub output_step: usize,
    input_validator: Option<InputValidator>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<String>, output_step: usize) -> Self {
        Self {
            name: name.into(),
            steps,
            output_step,
            input_validator: None,
        }
    }

    /// `ExtractMetadata -> StoreMetadata`, completing with the extraction result.
    pub fn metadata_pipeline() -> Self {
        Self::new(
            "MetadataIngestion",
            vec![EXTRACT_METADATA_ACTIVITY.to_string(), STORE_METADATA_ACTIVITY.to_string()],
            0,
        )
        .with_input_validator(crate::trigger::validate_trigger_payload)
    }

    pub fn with_input_validator(mut self, validator: InputValidator) -> Self {
        self.input_validator = Some(validator);
        self
    }

    pub fn validate_input(&self, input: &str) -> Result<(), String> {
        match self.input_validator {
            Some(v) => v(input),
            None => Ok(()),
        }
    }

    /// Steps recorded in history must be a prefix of the definition.
    pub fn check_history(&self, state: &ReplayState) -> Result<(), ReplayError> {
        for (index, step) in state.steps.iter().enumerate() {
            match self.steps.get(index) {
                Some(expected) if *expected == step.name => {}
                expected => {
                    return Err(ReplayError::DefinitionMismatch {
                        index,
                        expected: expected.cloned().unwrap_or_default(),
                        found: step.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("output_step", &self.output_step)
            .field("validates_input", &self.input_validator.is_some())
            .finish()
    }
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self::metadata_pipeline()
    }
}

/// One activity attempt to hand to the activity runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityCall {
    pub sequence_no: u64,
    pub name: String,
    pub input: String,
    pub attempt: u32,
    /// Backoff to wait before running the attempt.
    pub delay: Duration,
}

/// Outcome of one decision cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No history for this instance.
    NotFound,
    /// A new attempt was scheduled and must be dispatched.
    Schedule(ActivityCall),
    /// An attempt is already scheduled and unresolved; nothing was appended.
    Await(ActivityCall),
    Complete { output: String },
    Fail { error_kind: ErrorKind, message: String },
    /// The instance was already terminal; nothing was appended.
    Terminal(InstanceStatus),
}

impl Decision {
    /// The event this decision appends, if any.
    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            Decision::Schedule(call) => Some(EventKind::ActivityScheduled {
                name: call.name.clone(),
                input: call.input.clone(),
                sequence_no: call.sequence_no,
                attempt: call.attempt,
            }),
            Decision::Complete { output } => Some(EventKind::InstanceCompleted { output: output.clone() }),
            Decision::Fail { error_kind, message } => Some(EventKind::InstanceFailed {
                error_kind: *error_kind,
                message: message.clone(),
            }),
            Decision::NotFound | Decision::Await(_) | Decision::Terminal(_) => None,
        }
    }

    /// Activity call to dispatch after the decision is persisted.
    pub fn activity_call(&self) -> Option<&ActivityCall> {
        match self {
            Decision::Schedule(call) | Decision::Await(call) => Some(call),
            _ => None,
        }
    }
}

/// Compute the next action from replayed state.
///
/// Pure: the result depends only on the arguments. `state` must have passed
/// [`WorkflowDefinition::check_history`].
pub fn decide(state: &ReplayState, def: &WorkflowDefinition, retry: &RetryPolicy) -> Decision {
    let Some(instance_input) = state.input.as_ref() else {
        return Decision::NotFound;
    };
    if let Some(status) = &state.terminal {
        return Decision::Terminal(status.clone());
    }
    if let Some(reason) = &state.cancel_reason {
        return Decision::Fail {
            error_kind: ErrorKind::Cancelled,
            message: format!("cancelled: {reason}"),
        };
    }
    if state.steps.is_empty() {
        if let Err(message) = def.validate_input(instance_input) {
            return Decision::Fail {
                error_kind: ErrorKind::TriggerMalformed,
                message,
            };
        }
    }

    let mut outputs: Vec<&str> = Vec::with_capacity(def.steps.len());
    for (index, name) in def.steps.iter().enumerate() {
        let Some(step) = state.steps.get(index) else {
            let input = outputs.last().copied().unwrap_or(instance_input.as_str());
            return Decision::Schedule(ActivityCall {
                sequence_no: state.next_sequence_no(),
                name: name.clone(),
                input: input.to_string(),
                attempt: 1,
                delay: Duration::ZERO,
            });
        };
        match &step.state {
            StepState::Completed { output } => outputs.push(output),
            StepState::Scheduled => {
                return Decision::Await(ActivityCall {
                    sequence_no: step.sequence_no,
                    name: step.name.clone(),
                    input: step.input.clone(),
                    attempt: step.attempt,
                    delay: if step.attempt > 1 {
                        retry.backoff.delay_for_attempt(step.attempt - 1)
                    } else {
                        Duration::ZERO
                    },
                });
            }
            StepState::Failed { error_kind, message } => {
                if error_kind.is_retryable() && retry.allows_retry_after(step.attempt) {
                    return Decision::Schedule(ActivityCall {
                        sequence_no: step.sequence_no,
                        name: step.name.clone(),
                        input: step.input.clone(),
                        attempt: step.attempt + 1,
                        delay: retry.backoff.delay_for_attempt(step.attempt),
                    });
                }
                let error_kind = if error_kind.is_retryable() {
                    ErrorKind::ActivityNonRetryable
                } else {
                    *error_kind
                };
                return Decision::Fail {
                    error_kind,
                    message: format!("{} failed after {} attempt(s): {message}", step.name, step.attempt),
                };
            }
        }
    }

    let output = outputs
        .get(def.output_step)
        .or(outputs.last())
        .map(|s| s.to_string())
        .unwrap_or_default();
    Decision::Complete { output }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No progress was made and nothing was dispatched. Safe to retry later.
    #[error("history store unavailable: {0}")]
    HistoryStoreUnavailable(ProviderError),
    #[error("history of '{instance}' is corrupted: {source}")]
    HistoryCorrupted {
        instance: String,
        #[source]
        source: ReplayError,
    },
    /// The store refused the append because it does not continue the stored history.
    #[error("append rejected: {0}")]
    Conflict(ProviderError),
    /// The history reached the store's event limit. The instance was failed
    /// in place of the requested append.
    #[error("history of '{instance}' reached the limit of {cap} events")]
    HistoryLimitReached { instance: String, cap: usize },
}

impl EngineError {
    fn from_append(e: ProviderError) -> Self {
        if e.is_retryable() {
            EngineError::HistoryStoreUnavailable(e)
        } else {
            EngineError::Conflict(e)
        }
    }
}

/// Drives decision cycles against a history store.
pub struct Engine {
    store: Arc<dyn HistoryStore>,
    locks: InstanceLocks,
    definition: WorkflowDefinition,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(store: Arc<dyn HistoryStore>, definition: WorkflowDefinition, retry: RetryPolicy) -> Self {
        Self {
            store,
            locks: InstanceLocks::new(),
            definition,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Serialize with every other decision cycle of `instance`.
    pub async fn lock(&self, instance: &str) -> InstanceGuard {
        self.locks.lock(instance).await
    }

    pub async fn advance(&self, instance: &str) -> Result<Decision, EngineError> {
        let guard = self.lock(instance).await;
        self.advance_locked(&guard).await
    }

    pub async fn advance_locked(&self, guard: &InstanceGuard) -> Result<Decision, EngineError> {
        let state = self.replay(guard.instance()).await?;
        let decision = decide(&state, &self.definition, &self.retry);
        if let Some(kind) = decision.event_kind() {
            self.append_locked(guard, &state, vec![kind]).await?;
        }
        log_decision(guard.instance(), &decision);
        Ok(decision)
    }

    /// Read and fold the history of `instance`.
    pub async fn replay(&self, instance: &str) -> Result<ReplayState, EngineError> {
        let history = self
            .store
            .read(instance)
            .await
            .map_err(EngineError::HistoryStoreUnavailable)?;
        let corrupted = |source| {
            warn!(
                target: "durable_ingest::runtime::engine",
                instance_id = %instance,
                error = %source,
                "refusing to advance corrupted history"
            );
            EngineError::HistoryCorrupted {
                instance: instance.to_string(),
                source,
            }
        };
        let state = ReplayState::fold(&history).map_err(corrupted)?;
        self.definition.check_history(&state).map_err(corrupted)?;
        Ok(state)
    }

    /// Append `kinds` after the last event of `state`.
    ///
    /// `state` must be the latest replay of the instance held by `guard`.
    pub async fn append_locked(
        &self,
        guard: &InstanceGuard,
        state: &ReplayState,
        kinds: Vec<EventKind>,
    ) -> Result<(), EngineError> {
        let first = state.next_event_id();
        if let Some(cap) = self.store.history_cap() {
            // The last slot is kept for the terminal event.
            let reaches_cap = state.last_event_id as usize + kinds.len() >= cap;
            if reaches_cap && !kinds.iter().any(EventKind::is_terminal) {
                return self.fail_at_cap(guard, first, cap).await;
            }
        }
        let events: Vec<Event> = kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| Event::new(guard.instance(), first + i as u64, kind))
            .collect();
        self.store
            .append(guard.instance(), events)
            .await
            .map_err(EngineError::from_append)
    }

    async fn fail_at_cap(&self, guard: &InstanceGuard, event_id: u64, cap: usize) -> Result<(), EngineError> {
        warn!(
            target: "durable_ingest::runtime::engine",
            instance_id = %guard.instance(),
            cap,
            "history limit reached, failing instance"
        );
        let failed = EventKind::InstanceFailed {
            error_kind: ErrorKind::ActivityNonRetryable,
            message: format!("history limit of {cap} events reached"),
        };
        self.store
            .append(guard.instance(), vec![Event::new(guard.instance(), event_id, failed)])
            .await
            .map_err(EngineError::from_append)?;
        Err(EngineError::HistoryLimitReached {
            instance: guard.instance().to_string(),
            cap,
        })
    }
}

fn log_decision(instance: &str, decision: &Decision) {
    const TARGET: &str = "durable_ingest::runtime::engine";
    match decision {
        Decision::Schedule(call) => debug!(
            target: TARGET,
            instance_id = %instance,
            activity_name = %call.name,
            sequence_no = call.sequence_no,
            attempt = call.attempt,
            delay_ms = call.delay.as_millis() as u64,
            "activity scheduled"
        ),
        Decision::Complete { .. } => info!(target: TARGET, instance_id = %instance, outcome = "completed", "instance completed"),
        Decision::Fail { error_kind, message } => info!(
            target: TARGET,
            instance_id = %instance,
            outcome = "failed",
            error_kind = %error_kind,
            error = %message,
            "instance failed"
        ),
        Decision::Await(call) => debug!(
            target: TARGET,
            instance_id = %instance,
            sequence_no = call.sequence_no,
            "awaiting outstanding activity"
        ),
        Decision::NotFound | Decision::Terminal(_) => {}
    }
}
