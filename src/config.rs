use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, MonitorResult};
use crate::types::MachineId;

/// How sessions are spread over hour buckets in the availability forecast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMode {
    /// Weight a session into every hour it overlaps, by overlap duration.
    #[default]
    Overlap,
    /// Count a session once, in the hour it started.
    StartHour,
}

/// Longest accepted default analytics window (about a century).
pub const MAX_ANALYTICS_WINDOW_DAYS: u32 = 36_500;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    // ── Machines ──
    pub machine_count: u32,

    // ── Signal interpretation ──
    pub vibration_threshold: f64,
    pub smoothing_window: usize,
    pub calibration_samples: usize,

    // ── Debounce ──
    pub start_confirm_samples: u32,
    pub quiet_delay: Duration,

    // ── Store ──
    pub history_cap: usize,

    // ── Analytics ──
    pub analytics_window_days: u32,
    pub forecast_mode: ForecastMode,

    // ── Ingestion ──
    pub feed_capacity: usize,
    pub stale_after: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            machine_count: 4,
            vibration_threshold: 1000.0,
            smoothing_window: 10,
            calibration_samples: 0,
            start_confirm_samples: 1,
            quiet_delay: Duration::seconds(30),
            history_cap: 100,
            analytics_window_days: 7,
            forecast_mode: ForecastMode::Overlap,
            feed_capacity: 1024,
            stale_after: Duration::seconds(30),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> MonitorResult<()> {
        let fail = |msg: &str| Err(MonitorError::InvalidConfig(msg.to_string()));

        if self.machine_count == 0 {
            return fail("machine_count must be at least 1");
        }
        if !self.vibration_threshold.is_finite() || self.vibration_threshold < 0.0 {
            return fail("vibration_threshold must be a finite, non-negative number");
        }
        if self.smoothing_window == 0 {
            return fail("smoothing_window must be at least 1");
        }
        if self.start_confirm_samples == 0 {
            return fail("start_confirm_samples must be at least 1");
        }
        if self.quiet_delay < Duration::zero() {
            return fail("quiet_delay must not be negative");
        }
        if self.history_cap == 0 {
            return fail("history_cap must be at least 1");
        }
        if self.analytics_window_days == 0 {
            return fail("analytics_window_days must be at least 1");
        }
        if self.analytics_window_days > MAX_ANALYTICS_WINDOW_DAYS {
            return fail("analytics_window_days is too large");
        }
        if self.feed_capacity == 0 {
            return fail("feed_capacity must be at least 1");
        }
        Ok(())
    }

    /// Machine ids are `1..=machine_count`.
    pub fn machine_ids(&self) -> impl Iterator<Item = MachineId> {
        1..=self.machine_count
    }

    pub fn machine_name(id: MachineId) -> String {
        format!("Machine {id}")
    }

    /// Whole seconds as a delay, rejecting values outside chrono's range.
    pub fn delay_from_secs(name: &str, secs: i64) -> MonitorResult<Duration> {
        Duration::try_seconds(secs)
            .ok_or_else(|| MonitorError::InvalidConfig(format!("{name} of {secs}s is out of range")))
    }
}
