use chrono::{DateTime, Duration, Utc};

use crate::types::{MachineId, MachineState, Transition};

/// Debounces the raw running bit into committed IDLE/RUNNING transitions.
///
/// Start: `start_confirm` consecutive raw-running samples.
/// Stop: raw-running must stay false for `quiet_delay`, measured on sample
/// timestamps. Any raw-running sample before the deadline cancels the stop.
#[derive(Clone, Debug)]
pub struct StateDetector {
    machine_id: MachineId,
    state: MachineState,
    start_confirm: u32,
    quiet_delay: Duration,
    consecutive_running: u32,
    quiet_since: Option<DateTime<Utc>>,
}

impl StateDetector {
    pub fn new(machine_id: MachineId, start_confirm: u32, quiet_delay: Duration) -> Self {
        Self {
            machine_id,
            state: MachineState::Idle,
            start_confirm: start_confirm.max(1),
            quiet_delay,
            consecutive_running: 0,
            quiet_since: None,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Timestamp at which a pending stop commits, if one is pending.
    pub fn stop_deadline(&self) -> Option<DateTime<Utc>> {
        self.quiet_since.map(|since| since + self.quiet_delay)
    }

    /// Feed one interpreted sample; returns the transition it commits, if any.
    pub fn update(&mut self, raw_running: bool, timestamp: DateTime<Utc>) -> Option<Transition> {
        match self.state {
            MachineState::Idle => {
                if !raw_running {
                    self.consecutive_running = 0;
                    return None;
                }
                self.consecutive_running += 1;
                if self.consecutive_running < self.start_confirm {
                    return None;
                }
                self.consecutive_running = 0;
                self.commit(MachineState::Running, timestamp)
            }
            MachineState::Running => {
                if raw_running {
                    self.quiet_since = None;
                    return None;
                }
                let since = *self.quiet_since.get_or_insert(timestamp);
                if timestamp - since < self.quiet_delay {
                    return None;
                }
                self.quiet_since = None;
                // The machine actually went quiet at `since`.
                self.commit(MachineState::Idle, since)
            }
        }
    }

    fn commit(&mut self, state: MachineState, timestamp: DateTime<Utc>) -> Option<Transition> {
        self.state = state;
        Some(Transition {
            machine_id: self.machine_id,
            state,
            timestamp,
        })
    }
}
