//! Worker side of the instance dispatcher
//!
//! Each dispatched attempt runs on its own task:
//! - waits out its backoff delay, then takes a concurrency permit
//! - invokes the activity under its deadline
//! - reports exactly one outcome, retrying the report while the history store is down

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::instance::{DispatchError, InstanceDispatcher};
use crate::runtime::activity::ActivityError;
use crate::runtime::engine::ActivityCall;

const TARGET: &str = "durable_ingest::runtime::worker";

impl InstanceDispatcher {
    /// Hand a persisted activity call to a worker task.
    ///
    /// An attempt already running in this process is not started twice.
    pub(super) fn dispatch(self: &Arc<Self>, instance: String, call: ActivityCall) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let key = (instance.clone(), call.sequence_no, call.attempt);
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone())
        {
            debug!(
                target: TARGET,
                instance_id = %instance,
                sequence_no = call.sequence_no,
                attempt = call.attempt,
                "attempt already running"
            );
            return;
        }

        let rt = self.clone();
        let handle = tokio::spawn(async move {
            rt.run_attempt(&instance, &call).await;
            rt.in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
        });
        let mut joins = self.joins.lock().unwrap_or_else(PoisonError::into_inner);
        joins.retain(|h| !h.is_finished());
        joins.push(handle);
    }

    /// Deadline for one attempt of `name`.
    pub(crate) fn timeout_for(&self, name: &str) -> Duration {
        self.options
            .retry
            .timeout
            .or_else(|| self.options.activity_timeouts.get(name).copied())
            .unwrap_or(self.options.default_activity_timeout)
    }

    async fn run_attempt(self: &Arc<Self>, instance: &str, call: &ActivityCall) {
        if !call.delay.is_zero() {
            tokio::time::sleep(call.delay).await;
        }
        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        if self.is_shutting_down() {
            return;
        }

        debug!(
            target: TARGET,
            instance_id = %instance,
            activity_name = %call.name,
            sequence_no = call.sequence_no,
            attempt = call.attempt,
            "activity started"
        );
        let start = Instant::now();
        let result = self
            .runner
            .invoke(&call.name, call.input.clone(), self.timeout_for(&call.name))
            .await;
        drop(permit);
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(output) => debug!(
                target: TARGET,
                instance_id = %instance,
                activity_name = %call.name,
                sequence_no = call.sequence_no,
                attempt = call.attempt,
                outcome = "success",
                duration_ms,
                result_size = output.len(),
                "activity completed"
            ),
            Err(e) => warn!(
                target: TARGET,
                instance_id = %instance,
                activity_name = %call.name,
                sequence_no = call.sequence_no,
                attempt = call.attempt,
                outcome = "failure",
                error_kind = %e.kind,
                duration_ms,
                error = %e.message,
                "activity failed"
            ),
        }

        self.report(instance, call, result).await;
    }

    async fn report(self: &Arc<Self>, instance: &str, call: &ActivityCall, result: Result<String, ActivityError>) {
        // Set once a report may have been recorded without its decision cycle finishing.
        let mut interrupted = false;
        loop {
            let outcome = match &result {
                Ok(output) => {
                    self.on_activity_completion(instance, call.sequence_no, call.attempt, output.clone())
                        .await
                }
                Err(e) => {
                    self.on_activity_failure(instance, call.sequence_no, call.attempt, e.kind, e.message.clone())
                        .await
                }
            };
            match outcome {
                Ok(_) => return,
                Err(DispatchError::HistoryStoreUnavailable(e)) => {
                    if self.is_shutting_down() {
                        warn!(
                            target: TARGET,
                            instance_id = %instance,
                            sequence_no = call.sequence_no,
                            error = %e,
                            "giving up report on shutdown; recovery will re-run the attempt"
                        );
                        return;
                    }
                    warn!(
                        target: TARGET,
                        instance_id = %instance,
                        sequence_no = call.sequence_no,
                        attempt = call.attempt,
                        error = %e,
                        "history store unavailable, retrying report"
                    );
                    interrupted = true;
                    tokio::time::sleep(self.options.report_retry_delay).await;
                }
                Err(DispatchError::StaleCompletion { .. }) if interrupted => {
                    // The outcome landed before the store failed; finish the cycle it started.
                    match self.advance(instance).await {
                        Err(DispatchError::HistoryStoreUnavailable(_)) if !self.is_shutting_down() => {
                            tokio::time::sleep(self.options.report_retry_delay).await;
                        }
                        _ => return,
                    }
                }
                Err(e @ DispatchError::Engine(_)) => {
                    warn!(
                        target: TARGET,
                        instance_id = %instance,
                        sequence_no = call.sequence_no,
                        error = %e,
                        "activity outcome not recorded"
                    );
                    return;
                }
                Err(e) => {
                    debug!(
                        target: TARGET,
                        instance_id = %instance,
                        sequence_no = call.sequence_no,
                        error = %e,
                        "activity outcome not recorded"
                    );
                    return;
                }
            }
        }
    }
}
