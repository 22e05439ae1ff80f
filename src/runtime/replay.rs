//! Deterministic replay of an instance history.
//!
//! [`ReplayState::fold`] is the only way decision state is built. It reads
//! nothing but the events it is given: no clock, no randomness, no I/O.
//! Folding the same history twice always yields equal states.

use crate::{ErrorKind, Event, EventKind, InstanceStatus};

/// Progress of one scheduled step, identified by its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub sequence_no: u64,
    pub name: String,
    pub input: String,
    /// Latest scheduled attempt (1-based).
    pub attempt: u32,
    pub state: StepState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepState {
    /// Attempt `attempt` is in flight.
    Scheduled,
    Completed { output: String },
    /// Attempt `attempt` failed. Whether it is final is a policy question for the engine.
    Failed { error_kind: ErrorKind, message: String },
}

/// History that cannot have been produced by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("history does not start with InstanceStarted")]
    MissingStart,
    #[error("event_id gap: expected {expected}, found {found}")]
    EventIdGap { expected: u64, found: u64 },
    #[error("event {event_id} references unknown sequence_no {sequence_no}")]
    UnknownSequence { event_id: u64, sequence_no: u64 },
    #[error("event {event_id} is out of order: {detail}")]
    OutOfOrder { event_id: u64, detail: String },
    #[error("event {event_id} follows a terminal event")]
    AfterTerminal { event_id: u64 },
    #[error("step {index} is '{found}' in history but '{expected}' in the workflow")]
    DefinitionMismatch {
        index: usize,
        expected: String,
        found: String,
    },
}

/// In-memory decision state reconstructed from history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplayState {
    /// Trigger payload, `None` for an instance without history.
    pub input: Option<String>,
    /// Steps in scheduling order (ascending `sequence_no`).
    pub steps: Vec<StepRecord>,
    pub cancel_reason: Option<String>,
    pub terminal: Option<InstanceStatus>,
    pub last_event_id: u64,
}

impl ReplayState {
    pub fn fold(history: &[Event]) -> Result<Self, ReplayError> {
        let mut state = ReplayState::default();
        for ev in history {
            state.apply(ev)?;
        }
        Ok(state)
    }

    fn apply(&mut self, ev: &Event) -> Result<(), ReplayError> {
        let expected = self.last_event_id + 1;
        if ev.event_id != expected {
            return Err(ReplayError::EventIdGap {
                expected,
                found: ev.event_id,
            });
        }
        if self.terminal.is_some() {
            return Err(ReplayError::AfterTerminal { event_id: ev.event_id });
        }
        if self.input.is_none() && !matches!(ev.kind, EventKind::InstanceStarted { .. }) {
            return Err(ReplayError::MissingStart);
        }
        let out_of_order = |detail: String| ReplayError::OutOfOrder {
            event_id: ev.event_id,
            detail,
        };

        match &ev.kind {
            EventKind::InstanceStarted { input } => {
                if self.input.is_some() {
                    return Err(out_of_order("duplicate InstanceStarted".to_string()));
                }
                self.input = Some(input.clone());
            }
            EventKind::ActivityScheduled {
                name,
                input,
                sequence_no,
                attempt,
            } => match self.steps.iter_mut().find(|s| s.sequence_no == *sequence_no) {
                Some(step) => {
                    let retry_ok = matches!(step.state, StepState::Failed { .. }) && *attempt == step.attempt + 1;
                    if !retry_ok || step.name != *name {
                        return Err(out_of_order(format!(
                            "re-schedule of sequence_no {sequence_no} attempt {attempt}"
                        )));
                    }
                    step.attempt = *attempt;
                    step.state = StepState::Scheduled;
                }
                None => {
                    if *sequence_no <= self.last_sequence_no() || *attempt != 1 {
                        return Err(out_of_order(format!(
                            "new step with sequence_no {sequence_no} attempt {attempt}"
                        )));
                    }
                    self.steps.push(StepRecord {
                        sequence_no: *sequence_no,
                        name: name.clone(),
                        input: input.clone(),
                        attempt: 1,
                        state: StepState::Scheduled,
                    });
                }
            },
            EventKind::ActivityCompleted { sequence_no, output } => {
                let step = self.step_mut(ev.event_id, *sequence_no)?;
                if step.state != StepState::Scheduled {
                    return Err(out_of_order(format!("completion of unresolved sequence_no {sequence_no} expected")));
                }
                step.state = StepState::Completed { output: output.clone() };
            }
            EventKind::ActivityFailed {
                sequence_no,
                error_kind,
                message,
                attempt,
            } => {
                let step = self.step_mut(ev.event_id, *sequence_no)?;
                if step.state != StepState::Scheduled || step.attempt != *attempt {
                    return Err(out_of_order(format!(
                        "failure of sequence_no {sequence_no} attempt {attempt} is not outstanding"
                    )));
                }
                step.state = StepState::Failed {
                    error_kind: *error_kind,
                    message: message.clone(),
                };
            }
            EventKind::InstanceCancelRequested { reason } => {
                if self.cancel_reason.is_none() {
                    self.cancel_reason = Some(reason.clone());
                }
            }
            EventKind::InstanceCompleted { output } => {
                self.terminal = Some(InstanceStatus::Completed { output: output.clone() });
            }
            EventKind::InstanceFailed { error_kind, message } => {
                self.terminal = Some(InstanceStatus::Failed {
                    error_kind: *error_kind,
                    message: message.clone(),
                });
            }
        }
        self.last_event_id = ev.event_id;
        Ok(())
    }

    fn step_mut(&mut self, event_id: u64, sequence_no: u64) -> Result<&mut StepRecord, ReplayError> {
        self.steps
            .iter_mut()
            .find(|s| s.sequence_no == sequence_no)
            .ok_or(ReplayError::UnknownSequence { event_id, sequence_no })
    }

    pub fn is_started(&self) -> bool {
        self.input.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn next_event_id(&self) -> u64 {
        self.last_event_id + 1
    }

    pub fn last_sequence_no(&self) -> u64 {
        self.steps.last().map(|s| s.sequence_no).unwrap_or(0)
    }

    pub fn next_sequence_no(&self) -> u64 {
        self.last_sequence_no() + 1
    }

    pub fn step(&self, sequence_no: u64) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.sequence_no == sequence_no)
    }

    /// The step whose latest attempt is still in flight, if any.
    pub fn outstanding(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.state == StepState::Scheduled)
    }

    /// Status as seen by clients.
    pub fn status(&self) -> InstanceStatus {
        match (&self.terminal, self.is_started()) {
            (Some(t), _) => t.clone(),
            (None, true) => InstanceStatus::Running,
            (None, false) => InstanceStatus::NotFound,
        }
    }
}
