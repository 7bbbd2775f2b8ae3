// pipeline.rs: sample → interpreter → detector → store
//
// Independent of the async runtime and of any transport. Feed it samples,
// it commits transitions to the store. The ingestion worker owns one of
// these; tests drive it directly.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::MonitorConfig;
use crate::detector::StateDetector;
use crate::error::{MonitorError, MonitorResult};
use crate::signal::{Reading, SignalInterpreter};
use crate::store::SessionStore;
use crate::types::{MachineId, MachineState, RawSample, Transition};

/// Per-machine interpretation state.
#[derive(Clone, Debug)]
struct MachineChannel {
    interpreter: SignalInterpreter,
    detector: StateDetector,
    last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SampleOutcome {
    pub reading: Reading,
    pub state: MachineState,
    pub transition: Option<Transition>,
}

pub struct IngestPipeline {
    channels: HashMap<MachineId, MachineChannel>,
    store: Arc<SessionStore>,
}

impl IngestPipeline {
    pub fn new(config: &MonitorConfig, store: Arc<SessionStore>) -> Self {
        let channels = config
            .machine_ids()
            .map(|id| {
                let interpreter = SignalInterpreter::new(
                    id,
                    config.vibration_threshold,
                    config.smoothing_window,
                )
                .with_calibration(config.calibration_samples);
                let detector =
                    StateDetector::new(id, config.start_confirm_samples, config.quiet_delay);
                let channel = MachineChannel {
                    interpreter,
                    detector,
                    last_timestamp: None,
                };
                (id, channel)
            })
            .collect();

        Self { channels, store }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn state(&self, machine_id: MachineId) -> Option<MachineState> {
        self.channels.get(&machine_id).map(|c| c.detector.state())
    }

    /// Process one sample. Rejected samples (malformed, out of order, unknown
    /// machine) return an error and leave every piece of state untouched.
    pub fn process(&mut self, sample: &RawSample) -> MonitorResult<SampleOutcome> {
        let channel = self
            .channels
            .get_mut(&sample.machine_id)
            .ok_or(MonitorError::UnknownMachine(sample.machine_id))?;

        if let Some(previous) = channel.last_timestamp {
            if sample.timestamp < previous {
                return Err(MonitorError::OutOfOrderSample {
                    machine_id: sample.machine_id,
                    previous,
                    received: sample.timestamp,
                });
            }
        }

        let reading = channel.interpreter.interpret(sample)?;
        channel.last_timestamp = Some(sample.timestamp);

        let transition = channel.detector.update(reading.raw_running, sample.timestamp);
        if let Some(t) = transition {
            match self.store.apply_transition(t.machine_id, t.state, t.timestamp) {
                Ok(_) => {}
                // Store already agrees; nothing to commit.
                Err(MonitorError::DuplicateTransition { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(SampleOutcome {
            reading,
            state: channel.detector.state(),
            transition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn pipeline(config: &MonitorConfig) -> IngestPipeline {
        let store = Arc::new(SessionStore::from_config(config));
        IngestPipeline::new(config, store)
    }

    fn unsmoothed() -> MonitorConfig {
        MonitorConfig {
            smoothing_window: 1,
            quiet_delay: Duration::seconds(5),
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_threshold_scenario_opens_exactly_one_session() {
        let config = MonitorConfig::default();
        let mut p = pipeline(&config);

        for i in 0..10 {
            let out = p.process(&RawSample::new(1, t(i), 0.0, 0.0, 0.0)).unwrap();
            assert!(!out.reading.raw_running);
            assert_eq!(out.state, MachineState::Idle);
        }
        assert!(p.store().history(1, 10).unwrap().is_empty());
        assert!(!p.store().machine(1).unwrap().running);

        let opened: usize = (10..20)
            .filter_map(|i| {
                p.process(&RawSample::new(1, t(i), 2000.0, 0.0, 0.0))
                    .unwrap()
                    .transition
            })
            .filter(|tr| tr.state == MachineState::Running)
            .count();

        assert_eq!(opened, 1);
        assert!(p.store().machine(1).unwrap().running);
    }

    #[test]
    fn test_pause_shorter_than_quiet_delay_is_one_session() {
        let config = unsmoothed();
        let mut p = pipeline(&config);
        let mut ts = 0;
        let mut push = |p: &mut IngestPipeline, mag: f64, n: usize| {
            for _ in 0..n {
                p.process(&RawSample::new(2, t(ts), mag, 0.0, 0.0)).unwrap();
                ts += 1;
            }
        };

        push(&mut p, 2000.0, 5);
        push(&mut p, 0.0, 2);
        push(&mut p, 2000.0, 5);
        push(&mut p, 0.0, 10);

        let stats = p.store().stats().unwrap();
        assert_eq!(stats.total_uses, 1);
        let history = p.store().history(2, 10).unwrap();
        assert_eq!(history.len(), 1);
        // Running t=0..=11, quiet from t=12.
        assert_eq!(history[0].duration_secs, 12.0);
    }

    #[test]
    fn test_total_uses_counts_committed_starts_not_crossings() {
        let config = MonitorConfig {
            start_confirm_samples: 2,
            ..unsmoothed()
        };
        let mut p = pipeline(&config);
        // Alternating single spikes never confirm a start.
        let mut starts = 0;
        for i in 0..40 {
            let mag = if i % 2 == 0 { 2000.0 } else { 0.0 };
            let out = p.process(&RawSample::new(1, t(i), mag, 0.0, 0.0)).unwrap();
            if matches!(out.transition, Some(tr) if tr.state == MachineState::Running) {
                starts += 1;
            }
        }
        assert_eq!(starts, 0);
        assert_eq!(p.store().stats().unwrap().total_uses, 0);

        // Two full cycles.
        let mut ts = 100;
        for _ in 0..2 {
            for mag in [2000.0, 2000.0, 2000.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0] {
                let out = p.process(&RawSample::new(1, t(ts), mag, 0.0, 0.0)).unwrap();
                if matches!(out.transition, Some(tr) if tr.state == MachineState::Running) {
                    starts += 1;
                }
                ts += 1;
            }
        }
        assert_eq!(starts, 2);
        assert_eq!(p.store().stats().unwrap().total_uses, 2);
    }

    #[test]
    fn test_malformed_sample_has_no_effect() {
        let config = unsmoothed();
        let mut p = pipeline(&config);
        p.process(&RawSample::new(1, t(0), 2000.0, 0.0, 0.0)).unwrap();

        let mut bad = RawSample::new(1, t(1), 0.0, 0.0, 0.0);
        bad.ay = Some(f64::NAN);
        let err = p.process(&bad).unwrap_err();
        assert!(matches!(err, MonitorError::MalformedSample { .. }));
        assert_eq!(p.state(1), Some(MachineState::Running));
    }

    #[test]
    fn test_out_of_order_sample_rejected() {
        let config = unsmoothed();
        let mut p = pipeline(&config);
        p.process(&RawSample::new(1, t(10), 0.0, 0.0, 0.0)).unwrap();
        let err = p.process(&RawSample::new(1, t(5), 2000.0, 0.0, 0.0)).unwrap_err();
        assert!(matches!(err, MonitorError::OutOfOrderSample { machine_id: 1, .. }));
        assert_eq!(p.state(1), Some(MachineState::Idle));

        // Other machines keep their own clocks.
        assert!(p.process(&RawSample::new(2, t(5), 0.0, 0.0, 0.0)).is_ok());
    }

    #[test]
    fn test_unknown_machine_rejected() {
        let config = unsmoothed();
        let mut p = pipeline(&config);
        let err = p.process(&RawSample::new(42, t(0), 0.0, 0.0, 0.0)).unwrap_err();
        assert_eq!(err, MonitorError::UnknownMachine(42));
    }
}
