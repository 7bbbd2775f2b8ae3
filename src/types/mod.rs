use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MachineId = u32;

/// Committed machine state. Machines start out `Idle`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    #[default]
    Idle,
    Running,
}

impl MachineState {
    pub fn is_running(self) -> bool {
        self == MachineState::Running
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Idle => f.write_str("IDLE"),
            MachineState::Running => f.write_str("RUNNING"),
        }
    }
}

/// One accelerometer reading as delivered by a transport.
///
/// Axes are optional because transports may deliver partial payloads; the
/// signal interpreter rejects those before they touch any state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub machine_id: MachineId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub ax: Option<f64>,
    #[serde(default)]
    pub ay: Option<f64>,
    #[serde(default)]
    pub az: Option<f64>,
}

impl RawSample {
    pub fn new(machine_id: MachineId, timestamp: DateTime<Utc>, ax: f64, ay: f64, az: f64) -> Self {
        Self {
            machine_id,
            timestamp,
            ax: Some(ax),
            ay: Some(ay),
            az: Some(az),
        }
    }
}

/// A committed state change for one machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub machine_id: MachineId,
    pub state: MachineState,
    pub timestamp: DateTime<Utc>,
}

/// A closed usage session. Duration is fixed at construction so a closed
/// session can never be observed without one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub machine_id: MachineId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
}

impl Session {
    /// Build a closed session; an end before the start is clamped to the start.
    pub fn closed(machine_id: MachineId, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        let end_time = end_time.max(start_time);
        let duration_secs = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
        Self {
            machine_id,
            start_time,
            end_time,
            duration_secs,
        }
    }
}

/// Point-in-time view of one machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub id: MachineId,
    pub name: String,
    pub running: bool,
    pub last_status_change: Option<DateTime<Utc>>,
    /// Start of the open session, present exactly when `running` is true.
    pub running_since: Option<DateTime<Utc>>,
    pub total_uses: u64,
    pub total_time_used_secs: f64,
}

/// Idle machine as listed by the availability endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableMachine {
    pub id: MachineId,
    pub name: String,
}

/// Human readable `HH:00 - HH:00` label for an hour-of-day bucket.
pub fn hour_range(hour: u32) -> String {
    format!("{:02}:00 - {:02}:00", hour % 24, (hour + 1) % 24)
}
