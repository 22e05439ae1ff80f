//! Dispatcher implementations for the runtime
//!
//! - `instance`: trigger, completion, cancellation and recovery entry points
//! - `worker`: runs dispatched activity attempts and reports their outcome

pub mod instance;
mod worker;

pub use instance::{DispatchError, InstanceDispatcher, TriggerOutcome};
