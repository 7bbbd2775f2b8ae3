use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::types::{AvailableMachine, MachineId, MachineSnapshot, MachineState, Session};

/// What a committed transition did to the store.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    Opened { machine_id: MachineId, start_time: DateTime<Utc> },
    Closed(Session),
}

/// Aggregate counters over all machines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub machines_running: usize,
    pub machines_idle: usize,
    pub total_uses: u64,
    pub total_time_used_secs: f64,
    pub average_time_per_use_secs: f64,
}

#[derive(Clone, Debug)]
struct MachineRecord {
    name: String,
    last_status_change: Option<DateTime<Utc>>,
    /// Start of the open session. The running flag is derived from this,
    /// so the two can never disagree.
    open_since: Option<DateTime<Utc>>,
    total_uses: u64,
    total_time_used_secs: f64,
    /// Closed sessions, oldest at the front.
    history: VecDeque<Session>,
}

impl MachineRecord {
    fn snapshot(&self, id: MachineId) -> MachineSnapshot {
        MachineSnapshot {
            id,
            name: self.name.clone(),
            running: self.open_since.is_some(),
            last_status_change: self.last_status_change,
            running_since: self.open_since,
            total_uses: self.total_uses,
            total_time_used_secs: self.total_time_used_secs,
        }
    }
}

/// Registry of machine state, open sessions and bounded session history.
///
/// All state sits behind one lock: writers serialize, and every read observes
/// either the full pre- or post-transition state.
pub struct SessionStore {
    machines: RwLock<BTreeMap<MachineId, MachineRecord>>,
    history_cap: usize,
}

impl SessionStore {
    pub fn new(machine_ids: impl IntoIterator<Item = MachineId>, history_cap: usize) -> Self {
        let machines = machine_ids
            .into_iter()
            .map(|id| {
                let record = MachineRecord {
                    name: MonitorConfig::machine_name(id),
                    last_status_change: None,
                    open_since: None,
                    total_uses: 0,
                    total_time_used_secs: 0.0,
                    history: VecDeque::new(),
                };
                (id, record)
            })
            .collect();

        SessionStore {
            machines: RwLock::new(machines),
            history_cap: history_cap.max(1),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.machine_ids(), config.history_cap)
    }

    fn read(&self) -> MonitorResult<RwLockReadGuard<'_, BTreeMap<MachineId, MachineRecord>>> {
        self.machines
            .read()
            .map_err(|_| MonitorError::Internal("Failed to acquire store read lock".to_string()))
    }

    fn write(&self) -> MonitorResult<RwLockWriteGuard<'_, BTreeMap<MachineId, MachineRecord>>> {
        self.machines
            .write()
            .map_err(|_| MonitorError::Internal("Failed to acquire store write lock".to_string()))
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    pub fn machine_count(&self) -> MonitorResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn contains(&self, machine_id: MachineId) -> MonitorResult<bool> {
        Ok(self.read()?.contains_key(&machine_id))
    }

    /// Commit a state transition for one machine.
    ///
    /// Entering RUNNING opens a session; leaving it closes the open session,
    /// updates the counters and appends to history. Unknown ids and repeated
    /// states are rejected without touching anything.
    pub fn apply_transition(
        &self,
        machine_id: MachineId,
        new_state: MachineState,
        timestamp: DateTime<Utc>,
    ) -> MonitorResult<Applied> {
        let mut machines = self.write()?;

        let Some(machine) = machines.get_mut(&machine_id) else {
            log::warn!("transition for unknown machine {machine_id} ignored");
            return Err(MonitorError::UnknownMachine(machine_id));
        };

        match (machine.open_since, new_state) {
            (None, MachineState::Running) => {
                machine.open_since = Some(timestamp);
                machine.last_status_change = Some(timestamp);
                log::info!("{} started at {}", machine.name, timestamp);
                Ok(Applied::Opened {
                    machine_id,
                    start_time: timestamp,
                })
            }
            (Some(start), MachineState::Idle) => {
                if timestamp < start {
                    log::warn!(
                        "{} stop at {} precedes start at {}; clamping duration to zero",
                        machine.name,
                        timestamp,
                        start
                    );
                }
                let session = Session::closed(machine_id, start, timestamp);

                machine.open_since = None;
                machine.last_status_change = Some(session.end_time);
                machine.total_uses += 1;
                machine.total_time_used_secs += session.duration_secs;
                if machine.history.len() == self.history_cap {
                    machine.history.pop_front();
                }
                machine.history.push_back(session.clone());

                log::info!(
                    "{} stopped at {} (duration: {:.0}s)",
                    machine.name,
                    session.end_time,
                    session.duration_secs
                );
                Ok(Applied::Closed(session))
            }
            (_, state) => {
                log::debug!("duplicate {state} transition for {} ignored", machine.name);
                Err(MonitorError::DuplicateTransition { machine_id, state })
            }
        }
    }

    /// Consistent copy of every machine's live state, ordered by id.
    pub fn snapshot(&self) -> MonitorResult<Vec<MachineSnapshot>> {
        let machines = self.read()?;
        Ok(machines
            .iter()
            .map(|(id, record)| record.snapshot(*id))
            .collect())
    }

    pub fn machine(&self, machine_id: MachineId) -> MonitorResult<MachineSnapshot> {
        let machines = self.read()?;
        machines
            .get(&machine_id)
            .map(|record| record.snapshot(machine_id))
            .ok_or(MonitorError::UnknownMachine(machine_id))
    }

    pub fn available(&self) -> MonitorResult<Vec<AvailableMachine>> {
        let machines = self.read()?;
        Ok(machines
            .iter()
            .filter(|(_, record)| record.open_since.is_none())
            .map(|(id, record)| AvailableMachine {
                id: *id,
                name: record.name.clone(),
            })
            .collect())
    }

    /// Closed sessions for one machine, newest first, at most `limit`.
    pub fn history(&self, machine_id: MachineId, limit: usize) -> MonitorResult<Vec<Session>> {
        let machines = self.read()?;
        let record = machines
            .get(&machine_id)
            .ok_or(MonitorError::UnknownMachine(machine_id))?;
        Ok(record.history.iter().rev().take(limit).cloned().collect())
    }

    /// Read-copy of every retained closed session, for aggregation outside the lock.
    pub fn closed_sessions(&self) -> MonitorResult<Vec<Session>> {
        let machines = self.read()?;
        Ok(machines
            .values()
            .flat_map(|record| record.history.iter().cloned())
            .collect())
    }

    pub fn stats(&self) -> MonitorResult<StoreStats> {
        let machines = self.read()?;

        let machines_running = machines.values().filter(|m| m.open_since.is_some()).count();
        let total_uses: u64 = machines.values().map(|m| m.total_uses).sum();
        let total_time_used_secs: f64 = machines.values().map(|m| m.total_time_used_secs).sum();
        let average_time_per_use_secs = if total_uses > 0 {
            total_time_used_secs / total_uses as f64
        } else {
            0.0
        };

        Ok(StoreStats {
            machines_running,
            machines_idle: machines.len() - machines_running,
            total_uses,
            total_time_used_secs,
            average_time_per_use_secs,
        })
    }
}
