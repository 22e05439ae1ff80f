//! Instance dispatcher
//!
//! Every entry point takes the per-instance lock, validates the incoming
//! notification against replayed history, appends at most the events it
//! implies, runs one decision cycle and releases the lock before handing the
//! resulting activity call to the worker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::providers::{HistoryStore, ProviderError};
use crate::runtime::activity::ActivityRunner;
use crate::runtime::engine::{Decision, Engine, EngineError};
use crate::runtime::replay::{ReplayState, StepState};
use crate::runtime::RuntimeOptions;
use crate::{ErrorKind, Event, EventKind};

const TARGET: &str = "durable_ingest::runtime::dispatchers::instance";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Created,
    /// The instance already existed; nothing was recorded.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Nothing was recorded. The caller should retry the same notification.
    #[error("history store unavailable: {0}")]
    HistoryStoreUnavailable(ProviderError),
    /// The notification does not match an outstanding attempt and was dropped.
    #[error("stale completion for '{instance}' sequence_no {sequence_no} attempt {attempt}: {reason}")]
    StaleCompletion {
        instance: String,
        sequence_no: u64,
        attempt: u32,
        reason: String,
    },
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),
    #[error("invalid instance input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for DispatchError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::HistoryStoreUnavailable(e) => DispatchError::HistoryStoreUnavailable(e),
            other => DispatchError::Engine(other),
        }
    }
}

/// Receives triggers and activity outcomes and drives decision cycles.
///
/// Takes its history store and activity runner as constructor arguments; the
/// engine is private to it.
pub struct InstanceDispatcher {
    pub(super) engine: Engine,
    pub(super) runner: ActivityRunner,
    pub(super) options: RuntimeOptions,
    pub(super) permits: Arc<Semaphore>,
    pub(super) joins: Mutex<Vec<JoinHandle<()>>>,
    /// `(instance, sequence_no, attempt)` currently owned by a worker task.
    pub(super) in_flight: Mutex<HashSet<(String, u64, u32)>>,
    pub(super) shutdown: AtomicBool,
}

impl InstanceDispatcher {
    pub fn new(store: Arc<dyn HistoryStore>, runner: ActivityRunner, options: RuntimeOptions) -> Arc<Self> {
        let engine = Engine::new(store, options.workflow.clone(), options.retry.clone());
        Arc::new(Self {
            engine,
            runner,
            permits: Arc::new(Semaphore::new(options.worker_concurrency.max(1))),
            options,
            joins: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        self.engine.store()
    }

    /// Create-or-ignore an instance and run its first decision cycle.
    ///
    /// A duplicate delivery appends nothing unless an earlier delivery stopped
    /// before the first decision was recorded, in which case it completes that
    /// decision.
    pub async fn on_trigger(self: &Arc<Self>, instance: &str, input: String) -> Result<TriggerOutcome, DispatchError> {
        let guard = self.engine.lock(instance).await;
        let started = Event::new(instance, 1, EventKind::InstanceStarted { input });
        let created = self
            .engine
            .store()
            .create_instance(instance, vec![started])
            .await
            .map_err(DispatchError::HistoryStoreUnavailable)?;
        let outcome = if created {
            info!(target: TARGET, instance_id = %instance, "instance created");
            TriggerOutcome::Created
        } else {
            debug!(target: TARGET, instance_id = %instance, "duplicate trigger ignored");
            TriggerOutcome::Duplicate
        };
        let decision = self.engine.advance_locked(&guard).await?;
        drop(guard);
        self.dispatch_decision(instance, &decision);
        Ok(outcome)
    }

    /// Record the output of an outstanding step and advance.
    ///
    /// Any attempt of the outstanding step may complete it, so a slow earlier
    /// attempt that finishes after a retry was scheduled still counts.
    pub async fn on_activity_completion(
        self: &Arc<Self>,
        instance: &str,
        sequence_no: u64,
        attempt: u32,
        output: String,
    ) -> Result<Decision, DispatchError> {
        let guard = self.engine.lock(instance).await;
        let state = self.engine.replay(instance).await?;
        if let Err(reason) = check_outstanding(&state, sequence_no, None) {
            return Err(stale(instance, sequence_no, attempt, reason));
        }
        self.engine
            .append_locked(&guard, &state, vec![EventKind::ActivityCompleted { sequence_no, output }])
            .await?;
        debug!(
            target: TARGET,
            instance_id = %instance,
            sequence_no,
            attempt,
            "activity completion recorded"
        );
        let decision = self.engine.advance_locked(&guard).await?;
        drop(guard);
        self.dispatch_decision(instance, &decision);
        Ok(decision)
    }

    /// Record a failed attempt and advance, which either re-schedules the step
    /// or fails the instance.
    pub async fn on_activity_failure(
        self: &Arc<Self>,
        instance: &str,
        sequence_no: u64,
        attempt: u32,
        error_kind: ErrorKind,
        message: String,
    ) -> Result<Decision, DispatchError> {
        let guard = self.engine.lock(instance).await;
        let state = self.engine.replay(instance).await?;
        if let Err(reason) = check_outstanding(&state, sequence_no, Some(attempt)) {
            return Err(stale(instance, sequence_no, attempt, reason));
        }
        self.engine
            .append_locked(
                &guard,
                &state,
                vec![EventKind::ActivityFailed {
                    sequence_no,
                    error_kind,
                    message,
                    attempt,
                }],
            )
            .await?;
        let decision = self.engine.advance_locked(&guard).await?;
        drop(guard);
        self.dispatch_decision(instance, &decision);
        Ok(decision)
    }

    /// Mark the instance cancelled. Honored by the decision cycle that follows;
    /// in-flight attempts are not interrupted and their outcomes are dropped.
    pub async fn request_cancel(self: &Arc<Self>, instance: &str, reason: &str) -> Result<Decision, DispatchError> {
        let guard = self.engine.lock(instance).await;
        let state = self.engine.replay(instance).await?;
        if !state.is_started() {
            return Err(DispatchError::UnknownInstance(instance.to_string()));
        }
        if let Some(status) = state.terminal {
            debug!(target: TARGET, instance_id = %instance, "cancel of terminal instance ignored");
            return Ok(Decision::Terminal(status));
        }
        if state.cancel_reason.is_none() {
            self.engine
                .append_locked(
                    &guard,
                    &state,
                    vec![EventKind::InstanceCancelRequested {
                        reason: reason.to_string(),
                    }],
                )
                .await?;
            info!(target: TARGET, instance_id = %instance, reason = %reason, "cancellation requested");
        }
        let decision = self.engine.advance_locked(&guard).await?;
        Ok(decision)
    }

    /// Run one decision cycle and dispatch whatever it asks for.
    pub async fn advance(self: &Arc<Self>, instance: &str) -> Result<Decision, DispatchError> {
        let decision = self.engine.advance(instance).await?;
        self.dispatch_decision(instance, &decision);
        Ok(decision)
    }

    /// Recovery sweep: advance every non-terminal instance and re-dispatch
    /// outstanding attempts. Returns the number of attempts dispatched.
    ///
    /// Corrupted instances are logged and skipped; a store outage aborts the sweep.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, DispatchError> {
        let instances = self
            .engine
            .store()
            .list_instances()
            .await
            .map_err(DispatchError::HistoryStoreUnavailable)?;
        let mut dispatched = 0;
        for instance in &instances {
            match self.advance(instance).await {
                Ok(decision) => {
                    if decision.activity_call().is_some() {
                        dispatched += 1;
                    }
                }
                Err(DispatchError::Engine(e)) => {
                    error!(target: TARGET, instance_id = %instance, error = %e, "skipping instance during recovery");
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            target: TARGET,
            instances = instances.len(),
            dispatched,
            "recovery sweep finished"
        );
        Ok(dispatched)
    }

    fn dispatch_decision(self: &Arc<Self>, instance: &str, decision: &Decision) {
        if let Some(call) = decision.activity_call() {
            self.dispatch(instance.to_string(), call.clone());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Stop dispatching and abort running attempts. Their outcomes are never
    /// recorded; the next recovery sweep re-dispatches them.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.permits.close();
        let joins: Vec<JoinHandle<()>> = std::mem::take(&mut *self.joins.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in &joins {
            handle.abort();
        }
        futures::future::join_all(joins).await;
        debug!(target: TARGET, "dispatcher stopped");
    }
}

/// `Ok` when `sequence_no` is scheduled and unresolved, and `attempt` (if
/// given) is its latest attempt.
fn check_outstanding(state: &ReplayState, sequence_no: u64, attempt: Option<u32>) -> Result<(), String> {
    if !state.is_started() {
        return Err("instance has no history".to_string());
    }
    if state.is_terminal() {
        return Err("instance is terminal".to_string());
    }
    if state.cancel_reason.is_some() {
        return Err("instance is being cancelled".to_string());
    }
    let Some(step) = state.step(sequence_no) else {
        return Err("sequence_no was never scheduled".to_string());
    };
    match (&step.state, attempt) {
        (StepState::Completed { .. }, _) => Err("sequence_no already completed".to_string()),
        (StepState::Failed { .. }, _) => Err(format!("attempt {} already failed", step.attempt)),
        (StepState::Scheduled, Some(a)) if a != step.attempt => {
            Err(format!("outstanding attempt is {}", step.attempt))
        }
        (StepState::Scheduled, _) => Ok(()),
    }
}

fn stale(instance: &str, sequence_no: u64, attempt: u32, reason: String) -> DispatchError {
    warn!(
        target: TARGET,
        instance_id = %instance,
        sequence_no,
        attempt,
        reason = %reason,
        "dropping stale activity outcome"
    );
    DispatchError::StaleCompletion {
        instance: instance.to_string(),
        sequence_no,
        attempt,
        reason,
    }
}
