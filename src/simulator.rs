use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ingest::SampleFeed;
use crate::types::{MachineId, RawSample};

#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    pub sample_interval: Duration,
    /// Samples between toggle decisions.
    pub ticks_per_cycle: u32,
    pub toggle_probability: f64,
    pub running_amplitude: f64,
    pub idle_amplitude: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(500),
            ticks_per_cycle: 10, // one decision every 5 seconds
            toggle_probability: 0.1,
            running_amplitude: 2000.0,
            idle_amplitude: 50.0,
        }
    }
}

/// Generates vibration samples for a set of machines that randomly switch
/// between running and idle.
pub struct VibrationSimulator {
    config: SimulatorConfig,
    machines: Vec<(MachineId, bool)>,
    rng: StdRng,
    tick: u64,
}

impl VibrationSimulator {
    pub fn new(machine_ids: impl IntoIterator<Item = MachineId>, config: SimulatorConfig) -> Self {
        Self::with_rng(machine_ids, config, StdRng::from_entropy())
    }

    pub fn seeded(machine_ids: impl IntoIterator<Item = MachineId>, config: SimulatorConfig, seed: u64) -> Self {
        Self::with_rng(machine_ids, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(machine_ids: impl IntoIterator<Item = MachineId>, config: SimulatorConfig, rng: StdRng) -> Self {
        Self {
            config,
            machines: machine_ids.into_iter().map(|id| (id, false)).collect(),
            rng,
            tick: 0,
        }
    }

    pub fn is_vibrating(&self, machine_id: MachineId) -> Option<bool> {
        self.machines
            .iter()
            .find(|(id, _)| *id == machine_id)
            .map(|(_, on)| *on)
    }

    /// One sample per machine at `now`.
    pub fn next_samples(&mut self, now: DateTime<Utc>) -> Vec<RawSample> {
        let decide = self.config.ticks_per_cycle > 0
            && self.tick % u64::from(self.config.ticks_per_cycle) == 0
            && self.tick > 0;
        self.tick += 1;

        let mut samples = Vec::with_capacity(self.machines.len());
        for i in 0..self.machines.len() {
            if decide && self.rng.gen_bool(self.config.toggle_probability.clamp(0.0, 1.0)) {
                let (id, on) = &mut self.machines[i];
                *on = !*on;
                log::debug!("simulated machine {id} -> {}", if *on { "IN_USE" } else { "FREE" });
            }

            let (id, on) = self.machines[i];
            let amplitude = if on {
                self.config.running_amplitude
            } else {
                self.config.idle_amplitude
            };
            samples.push(self.sample(id, now, amplitude));
        }
        samples
    }

    fn sample(&mut self, machine_id: MachineId, now: DateTime<Utc>, amplitude: f64) -> RawSample {
        // Random direction, magnitude within ±15% of the amplitude.
        let scale = amplitude * self.rng.gen_range(0.85..1.15);
        let (x, y, z): (f64, f64, f64) = (
            self.rng.gen_range(-1.0..1.0),
            self.rng.gen_range(-1.0..1.0),
            self.rng.gen_range(-1.0..1.0),
        );
        let norm = (x * x + y * y + z * z).sqrt().max(1e-9);
        RawSample::new(machine_id, now, x / norm * scale, y / norm * scale, z / norm * scale)
    }
}

pub async fn simulate_loop(
    mut simulator: VibrationSimulator,
    feed: SampleFeed,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval(simulator.config.sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sample_count = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for sample in simulator.next_samples(Utc::now()) {
                    if feed.publish(sample) {
                        sample_count += 1;
                    }
                }
                if sample_count > 0 && sample_count % 500 == 0 {
                    log::debug!("[sim] {} samples published", sample_count);
                }
            }
            _ = cancel_token.cancelled() => {
                log::info!("simulator stopped after {} samples", sample_count);
                break;
            }
        }
    }
}
