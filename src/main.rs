use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{interval, sleep, Duration};
use tokio_util::sync::CancellationToken;

use machine_monitor_rs::api;
use machine_monitor_rs::monitor::Monitor;
use machine_monitor_rs::replay;
use machine_monitor_rs::simulator::{self, SimulatorConfig, VibrationSimulator};
use machine_monitor_rs::{ForecastMode, MonitorConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Randomly toggling simulated machines
    Simulate,
    /// Samples read from a recorded .jsonl / .jsonl.gz file
    Replay,
}

#[derive(Parser, Debug)]
#[command(name = "machine_monitor")]
#[command(about = "Vibration-based machine usage monitor", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(long, value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Where samples come from
    #[arg(long, value_enum, default_value = "simulate")]
    source: Source,

    /// Recording to replay (required with --source replay)
    #[arg(long, env = "REPLAY_FILE")]
    replay_file: Option<PathBuf>,

    /// Pause between replayed samples in milliseconds
    #[arg(long, default_value = "0")]
    replay_pace_ms: u64,

    /// Simulator sample interval in milliseconds
    #[arg(long, default_value = "500")]
    sample_interval_ms: u64,

    /// HTTP port for the API
    #[arg(long, env = "PORT", default_value = "5000")]
    port: u16,

    /// Output directory
    #[arg(long, default_value = "machine_monitor_sessions")]
    output_dir: PathBuf,

    /// Number of monitored machines (ids 1..=N)
    #[arg(long, env = "NUM_MACHINES", default_value = "4")]
    machine_count: u32,

    /// Smoothed magnitude above which a machine counts as vibrating
    #[arg(long, env = "VIBRATION_THRESHOLD", default_value = "1000")]
    threshold: f64,

    /// Moving-average window in samples
    #[arg(long, env = "SMOOTHING_WINDOW", default_value = "10")]
    smoothing_window: usize,

    /// Samples used to learn each machine's resting baseline (0 = off)
    #[arg(long, env = "CALIBRATION_SAMPLES", default_value = "0")]
    calibration_samples: usize,

    /// Consecutive vibrating samples needed to commit a start
    #[arg(long, env = "START_CONFIRM_SAMPLES", default_value = "1")]
    start_confirm_samples: u32,

    /// Seconds of quiet before a stop is committed
    #[arg(long, env = "QUIET_DELAY_SECS", default_value = "30")]
    quiet_delay_secs: i64,

    /// Closed sessions retained per machine
    #[arg(long, env = "HISTORY_CAP", default_value = "100")]
    history_cap: usize,

    /// Default analytics window in days
    #[arg(long, env = "ANALYTICS_DAYS", default_value = "7")]
    analytics_days: u32,

    /// How sessions are attributed to hours in the availability forecast
    #[arg(long, value_enum, default_value = "overlap")]
    forecast_mode: ForecastMode,

    /// Sample feed capacity before the oldest samples are dropped
    #[arg(long, env = "FEED_CAPACITY", default_value = "1024")]
    feed_capacity: usize,

    /// Seconds without samples before a machine's feed is reported stale
    #[arg(long, env = "STALE_AFTER_SECS", default_value = "30")]
    stale_after_secs: i64,

    /// Seconds between status log lines
    #[arg(long, default_value = "5")]
    status_interval_secs: u64,
}

impl Args {
    fn monitor_config(&self) -> Result<MonitorConfig> {
        Ok(MonitorConfig {
            machine_count: self.machine_count,
            vibration_threshold: self.threshold,
            smoothing_window: self.smoothing_window,
            calibration_samples: self.calibration_samples,
            start_confirm_samples: self.start_confirm_samples,
            quiet_delay: MonitorConfig::delay_from_secs("quiet_delay", self.quiet_delay_secs)?,
            history_cap: self.history_cap,
            analytics_window_days: self.analytics_days,
            forecast_mode: self.forecast_mode,
            feed_capacity: self.feed_capacity,
            stale_after: MonitorConfig::delay_from_secs("stale_after", self.stale_after_secs)?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = args.monitor_config().context("invalid configuration")?;
    let monitor = Arc::new(Monitor::new(config.clone()).context("invalid configuration")?);

    log::info!("Machine Monitor starting");
    log::info!("  Duration: {} seconds (0=continuous)", args.duration);
    log::info!("  Source: {:?}", args.source);
    log::info!("  Machines: {}", config.machine_count);
    log::info!(
        "  Threshold: {} (window {}, quiet {}s)",
        config.vibration_threshold,
        config.smoothing_window,
        config.quiet_delay.num_seconds()
    );
    log::info!("  Output Dir: {}", args.output_dir.display());

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;

    let shutdown = CancellationToken::new();

    // Worker first, so the transport never publishes into an empty feed.
    monitor.start_ingestion().await?;

    let source_handle = match args.source {
        Source::Simulate => {
            let sim_config = SimulatorConfig {
                sample_interval: Duration::from_millis(args.sample_interval_ms.max(1)),
                ..SimulatorConfig::default()
            };
            let sim = VibrationSimulator::new(config.machine_ids(), sim_config);
            tokio::spawn(simulator::simulate_loop(sim, monitor.feed(), shutdown.clone()))
        }
        Source::Replay => {
            let Some(path) = args.replay_file.as_deref() else {
                bail!("--replay-file is required with --source replay");
            };
            let recording = replay::load_recording(path)?;
            log::info!(
                "Loaded {} samples from {} ({} undecodable lines)",
                recording.samples.len(),
                path.display(),
                recording.undecodable_lines
            );
            let pace = Duration::from_millis(args.replay_pace_ms);
            let feed = monitor.feed();
            let token = shutdown.clone();
            tokio::spawn(async move {
                replay::replay_loop(recording, feed, pace, token).await;
            })
        }
    };

    let status_handle = tokio::spawn(status_loop(
        Arc::clone(&monitor),
        Duration::from_secs(args.status_interval_secs.max(1)),
        shutdown.clone(),
    ));

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("API listening at http://{}", addr);

    let server = axum::serve(listener, api::router(Arc::clone(&monitor)))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let server_handle = tokio::spawn(async move { server.await });

    wait_for_shutdown(args.duration).await;
    shutdown.cancel();

    source_handle.await.context("sample source task failed")?;
    status_handle.await.context("status task failed")?;
    server_handle.await.context("server task failed")??;
    monitor.stop_ingestion().await?;

    let path = save_final(&monitor, &args.output_dir)?;
    let stats = monitor.get_stats()?;
    log::info!("Final save: {} sessions to {}", stats.total_uses, path.display());

    println!("\n=== Final Stats ===");
    println!("Total uses: {}", stats.total_uses);
    println!("Total time used: {:.0} s", stats.total_time_used_secs);
    println!("Average per use: {:.1} s", stats.average_time_per_use_secs);

    Ok(())
}

async fn wait_for_shutdown(duration_secs: u64) {
    let deadline = async {
        if duration_secs > 0 {
            sleep(Duration::from_secs(duration_secs)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = deadline => log::info!("Duration reached, stopping..."),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => log::info!("Ctrl-C received, stopping..."),
            Err(e) => log::error!("failed to listen for Ctrl-C: {e}"),
        },
    }
}

async fn status_loop(monitor: Arc<Monitor>, every: Duration, cancel_token: CancellationToken) {
    let mut ticker = interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = monitor.ingestion_status().await;
                let running = monitor
                    .get_stats()
                    .map(|s| s.machines_running)
                    .unwrap_or_default();
                log::info!(
                    "[{}] running={} samples={} malformed={} rejected={} dropped={} transitions={}",
                    ts_now(),
                    running,
                    status.samples_processed,
                    status.malformed_samples,
                    status.rejected_samples,
                    status.dropped_samples,
                    status.transitions
                );
                if !status.stale_machines.is_empty() {
                    log::warn!("{}", monitor.health().format_status(Utc::now()));
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

fn save_final(monitor: &Monitor, output_dir: &Path) -> Result<PathBuf> {
    let export = monitor.export()?;
    let path = output_dir.join(format!("sessions_{}_final.json", ts_now_clean()));
    let json = serde_json::to_string_pretty(&export)?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
