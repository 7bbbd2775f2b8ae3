use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::types::MachineId;

/// Tracks when each machine's feed last delivered a sample.
///
/// Silence is reported to callers only; it never changes machine state.
#[derive(Debug)]
pub struct FeedHealth {
    last_seen: Mutex<BTreeMap<MachineId, Option<DateTime<Utc>>>>,
    silence_threshold: Duration,
}

impl FeedHealth {
    pub fn new(machine_ids: impl IntoIterator<Item = MachineId>, silence_threshold: Duration) -> Self {
        FeedHealth {
            last_seen: Mutex::new(machine_ids.into_iter().map(|id| (id, None)).collect()),
            silence_threshold,
        }
    }

    pub fn update(&self, machine_id: MachineId, at: DateTime<Utc>) {
        if let Ok(mut seen) = self.last_seen.lock() {
            if let Some(slot) = seen.get_mut(&machine_id) {
                *slot = Some(at);
            }
        }
    }

    pub fn last_seen(&self, machine_id: MachineId) -> Option<DateTime<Utc>> {
        self.last_seen
            .lock()
            .ok()
            .and_then(|seen| seen.get(&machine_id).copied().flatten())
    }

    /// Latest sample across all machines.
    pub fn last_sample_at(&self) -> Option<DateTime<Utc>> {
        self.last_seen
            .lock()
            .ok()
            .and_then(|seen| seen.values().flatten().max().copied())
    }

    /// Machines with no sample within the silence threshold of `now`,
    /// including machines never heard from.
    pub fn stale_machines(&self, now: DateTime<Utc>) -> Vec<MachineId> {
        self.last_seen
            .lock()
            .ok()
            .map(|seen| {
                seen.iter()
                    .filter(|(_, last)| match last {
                        Some(at) => now - *at > self.silence_threshold,
                        None => true,
                    })
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Format feed status for logging
    pub fn format_status(&self, now: DateTime<Utc>) -> String {
        let stale = self.stale_machines(now);
        if stale.is_empty() {
            return "Feeds: all ✓".to_string();
        }
        let parts: Vec<String> = stale
            .iter()
            .map(|id| match self.last_seen(*id) {
                Some(at) => format!("#{id} ⚠ (silent {:.1}s)", (now - at).num_milliseconds() as f64 / 1000.0),
                None => format!("#{id} ⚠ (no data)"),
            })
            .collect();
        format!("Feeds: {}", parts.join(" | "))
    }
}
