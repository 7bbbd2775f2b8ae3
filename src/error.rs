use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{MachineId, MachineState};

/// Machine monitor error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("Malformed sample for machine {machine_id}: {reason}")]
    MalformedSample { machine_id: MachineId, reason: String },

    #[error("Out-of-order sample for machine {machine_id}: {received} is before {previous}")]
    OutOfOrderSample {
        machine_id: MachineId,
        previous: DateTime<Utc>,
        received: DateTime<Utc>,
    },

    #[error("Unknown machine id {0}")]
    UnknownMachine(MachineId),

    #[error("Machine {machine_id} is already {state}")]
    DuplicateTransition {
        machine_id: MachineId,
        state: MachineState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    /// Errors that reject a single input and leave all state untouched.
    pub fn is_rejected_input(&self) -> bool {
        matches!(
            self,
            MonitorError::MalformedSample { .. }
                | MonitorError::OutOfOrderSample { .. }
                | MonitorError::UnknownMachine(_)
        )
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
