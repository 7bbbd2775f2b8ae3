// signal.rs: raw accelerometer sample → smoothed vibration magnitude
//
// One interpreter per machine. Malformed input is rejected before the
// smoothing buffer is touched, so a bad sample never skews the average.

use nalgebra::Vector3;

use crate::error::{MonitorError, MonitorResult};
use crate::smoothing::VibrationSmoother;
use crate::types::{MachineId, RawSample};

/// Result of interpreting one valid sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    /// Instantaneous magnitude, baseline-relative once calibrated.
    pub magnitude: f64,
    /// Moving average used for the threshold comparison.
    pub smoothed: f64,
    pub raw_running: bool,
}

#[derive(Clone, Debug)]
pub struct SignalInterpreter {
    machine_id: MachineId,
    threshold: f64,
    smoother: VibrationSmoother,
    baseline: Option<f64>,
    calibration_target: usize,
    calibration_samples: Vec<f64>,
}

impl SignalInterpreter {
    pub fn new(machine_id: MachineId, threshold: f64, window_size: usize) -> Self {
        Self {
            machine_id,
            threshold,
            smoother: VibrationSmoother::new(window_size),
            baseline: None,
            calibration_target: 0,
            calibration_samples: Vec::new(),
        }
    }

    /// Collect the first `samples` valid magnitudes as the resting baseline.
    pub fn with_calibration(mut self, samples: usize) -> Self {
        self.calibration_target = samples;
        self.calibration_samples = Vec::with_capacity(samples);
        self
    }

    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = Some(baseline);
        self.calibration_target = 0;
        self
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn is_calibrating(&self) -> bool {
        self.baseline.is_none() && self.calibration_target > 0
    }

    /// Validate the axes of a raw sample into an acceleration vector.
    pub fn acceleration(sample: &RawSample) -> MonitorResult<Vector3<f64>> {
        let axis = |value: Option<f64>, name: &str| -> MonitorResult<f64> {
            match value {
                Some(v) if v.is_finite() => Ok(v),
                Some(v) => Err(MonitorError::MalformedSample {
                    machine_id: sample.machine_id,
                    reason: format!("axis {name} is not finite ({v})"),
                }),
                None => Err(MonitorError::MalformedSample {
                    machine_id: sample.machine_id,
                    reason: format!("axis {name} is missing"),
                }),
            }
        };

        Ok(Vector3::new(
            axis(sample.ax, "ax")?,
            axis(sample.ay, "ay")?,
            axis(sample.az, "az")?,
        ))
    }

    pub fn interpret(&mut self, sample: &RawSample) -> MonitorResult<Reading> {
        if sample.machine_id != self.machine_id {
            return Err(MonitorError::Internal(format!(
                "sample for machine {} routed to interpreter for machine {}",
                sample.machine_id, self.machine_id
            )));
        }

        let norm = Self::acceleration(sample)?.norm();
        if !norm.is_finite() {
            return Err(MonitorError::MalformedSample {
                machine_id: sample.machine_id,
                reason: "magnitude overflowed".to_string(),
            });
        }

        if self.is_calibrating() {
            self.calibration_samples.push(norm);
            if self.calibration_samples.len() >= self.calibration_target {
                let baseline = self.calibration_samples.iter().sum::<f64>()
                    / self.calibration_samples.len() as f64;
                log::info!(
                    "machine {} calibrated: baseline magnitude {:.3} ({} samples)",
                    self.machine_id,
                    baseline,
                    self.calibration_samples.len()
                );
                self.baseline = Some(baseline);
                self.calibration_samples.clear();
            }
            return Ok(Reading {
                magnitude: 0.0,
                smoothed: 0.0,
                raw_running: false,
            });
        }

        let magnitude = match self.baseline {
            Some(baseline) => (norm - baseline).abs(),
            None => norm,
        };
        let smoothed = self.smoother.apply(magnitude);

        Ok(Reading {
            magnitude,
            smoothed,
            raw_running: smoothed > self.threshold,
        })
    }
}
