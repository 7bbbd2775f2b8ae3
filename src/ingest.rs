use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{MonitorError, MonitorResult};
use crate::health::FeedHealth;
use crate::pipeline::IngestPipeline;
use crate::types::{MachineId, RawSample};

/// Bounded sample feed shared by transports and the ingestion worker.
///
/// Backed by a broadcast ring: when the worker falls behind, the oldest
/// queued samples are overwritten and the worker is told how many it lost.
#[derive(Clone)]
pub struct SampleFeed {
    tx: broadcast::Sender<RawSample>,
}

impl SampleFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a sample. Returns false when no worker is listening.
    pub fn publish(&self, sample: RawSample) -> bool {
        self.tx.send(sample).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RawSample> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Default)]
pub struct IngestCounters {
    pub samples_processed: AtomicU64,
    pub malformed_samples: AtomicU64,
    pub rejected_samples: AtomicU64,
    pub dropped_samples: AtomicU64,
    pub transitions: AtomicU64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestionStatus {
    pub running: bool,
    pub samples_processed: u64,
    pub malformed_samples: u64,
    /// Out-of-order samples and samples for unknown machines.
    pub rejected_samples: u64,
    /// Samples overwritten in the feed before the worker could read them.
    pub dropped_samples: u64,
    pub transitions: u64,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub stale_machines: Vec<MachineId>,
}

/// Owns the ingestion worker and its stop signal.
pub struct IngestionController {
    feed: SampleFeed,
    pipeline: Option<IngestPipeline>,
    handle: Option<JoinHandle<IngestPipeline>>,
    cancel_token: Option<CancellationToken>,
    counters: Arc<IngestCounters>,
    health: Arc<FeedHealth>,
}

impl IngestionController {
    pub fn new(feed: SampleFeed, pipeline: IngestPipeline, health: Arc<FeedHealth>) -> Self {
        Self {
            feed,
            pipeline: Some(pipeline),
            handle: None,
            cancel_token: None,
            counters: Arc::new(IngestCounters::default()),
            health,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the worker. Returns false if it is already running.
    pub async fn start(&mut self) -> MonitorResult<bool> {
        if self.is_running() {
            return Ok(false);
        }
        // A worker that exited on its own still holds the pipeline.
        self.reclaim().await?;

        let pipeline = self
            .pipeline
            .take()
            .ok_or_else(|| MonitorError::Internal("ingestion pipeline unavailable".to_string()))?;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(ingest_loop(
            pipeline,
            self.feed.subscribe(),
            cancel_token.clone(),
            Arc::clone(&self.counters),
            Arc::clone(&self.health),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        log::info!("ingestion started");
        Ok(true)
    }

    /// Signal the worker to stop and wait for it. Safe to call repeatedly.
    pub async fn stop(&mut self) -> MonitorResult<bool> {
        let Some(token) = self.cancel_token.take() else {
            return Ok(false);
        };
        token.cancel();
        self.reclaim().await?;
        log::info!("ingestion stopped");
        Ok(true)
    }

    async fn reclaim(&mut self) -> MonitorResult<()> {
        if let Some(handle) = self.handle.take() {
            let pipeline = handle
                .await
                .map_err(|e| MonitorError::Internal(format!("ingestion worker failed to join: {e}")))?;
            self.pipeline = Some(pipeline);
        }
        Ok(())
    }

    pub fn status(&self) -> IngestionStatus {
        let c = &self.counters;
        IngestionStatus {
            running: self.is_running(),
            samples_processed: c.samples_processed.load(Ordering::Relaxed),
            malformed_samples: c.malformed_samples.load(Ordering::Relaxed),
            rejected_samples: c.rejected_samples.load(Ordering::Relaxed),
            dropped_samples: c.dropped_samples.load(Ordering::Relaxed),
            transitions: c.transitions.load(Ordering::Relaxed),
            last_sample_at: self.health.last_sample_at(),
            stale_machines: self.health.stale_machines(Utc::now()),
        }
    }
}

/// Worker loop: drain the feed into the pipeline until cancelled or the feed
/// closes. Hands the pipeline back so its state survives a restart.
pub async fn ingest_loop(
    mut pipeline: IngestPipeline,
    mut rx: broadcast::Receiver<RawSample>,
    cancel_token: CancellationToken,
    counters: Arc<IngestCounters>,
    health: Arc<FeedHealth>,
) -> IngestPipeline {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log::info!("ingestion loop shutting down");
                break;
            }
            received = rx.recv() => match received {
                Ok(sample) => handle_sample(&mut pipeline, &sample, &counters, &health),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    counters.dropped_samples.fetch_add(skipped, Ordering::Relaxed);
                    log::warn!("ingestion fell behind; dropped {skipped} oldest samples");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    log::info!("sample feed closed");
                    break;
                }
            }
        }
    }
    pipeline
}

fn handle_sample(
    pipeline: &mut IngestPipeline,
    sample: &RawSample,
    counters: &IngestCounters,
    health: &FeedHealth,
) {
    match pipeline.process(sample) {
        Ok(outcome) => {
            counters.samples_processed.fetch_add(1, Ordering::Relaxed);
            health.update(sample.machine_id, Utc::now());
            if let Some(t) = outcome.transition {
                counters.transitions.fetch_add(1, Ordering::Relaxed);
                log::debug!("machine {} committed {} at {}", t.machine_id, t.state, t.timestamp);
            }
        }
        Err(err @ MonitorError::MalformedSample { .. }) => {
            counters.malformed_samples.fetch_add(1, Ordering::Relaxed);
            log::warn!("{err}");
        }
        Err(err) if err.is_rejected_input() => {
            counters.rejected_samples.fetch_add(1, Ordering::Relaxed);
            log::warn!("{err}");
        }
        Err(err) => {
            log::error!("sample processing failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::store::SessionStore;
    use chrono::{Duration, TimeZone};
    use tokio::time::{sleep, timeout};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn controller(config: &MonitorConfig) -> (IngestionController, SampleFeed, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::from_config(config));
        let feed = SampleFeed::new(config.feed_capacity);
        let health = Arc::new(FeedHealth::new(config.machine_ids(), config.stale_after));
        let pipeline = IngestPipeline::new(config, Arc::clone(&store));
        (IngestionController::new(feed.clone(), pipeline, health), feed, store)
    }

    async fn wait_for_processed(ctl: &IngestionController, n: u64) {
        timeout(std::time::Duration::from_secs(5), async {
            while ctl.status().samples_processed + ctl.status().malformed_samples < n {
                sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker did not catch up");
    }

    #[tokio::test]
    async fn test_worker_commits_sessions() {
        let config = MonitorConfig {
            smoothing_window: 1,
            quiet_delay: Duration::seconds(2),
            ..MonitorConfig::default()
        };
        let (mut ctl, feed, store) = controller(&config);
        assert!(ctl.start().await.unwrap());
        assert!(ctl.status().running);

        for i in 0..5 {
            assert!(feed.publish(RawSample::new(1, t(i), 1500.0, 0.0, 0.0)));
        }
        for i in 5..10 {
            feed.publish(RawSample::new(1, t(i), 0.0, 0.0, 0.0));
        }
        let mut bad = RawSample::new(1, t(11), 0.0, 0.0, 0.0);
        bad.ax = None;
        feed.publish(bad);

        wait_for_processed(&ctl, 11).await;
        let status = ctl.status();
        assert_eq!(status.samples_processed, 10);
        assert_eq!(status.malformed_samples, 1);
        assert_eq!(status.transitions, 2);
        assert!(status.last_sample_at.is_some());
        assert!(status.stale_machines.contains(&2));
        assert_eq!(store.stats().unwrap().total_uses, 1);

        assert!(ctl.stop().await.unwrap());
        assert!(!ctl.status().running);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_restart_keeps_state() {
        let config = MonitorConfig {
            smoothing_window: 1,
            ..MonitorConfig::default()
        };
        let (mut ctl, feed, store) = controller(&config);

        assert!(!ctl.stop().await.unwrap());
        ctl.start().await.unwrap();
        assert!(!ctl.start().await.unwrap());

        feed.publish(RawSample::new(1, t(0), 1500.0, 0.0, 0.0));
        wait_for_processed(&ctl, 1).await;
        assert!(ctl.stop().await.unwrap());
        assert!(!ctl.stop().await.unwrap());

        // Not listening: publish reports no receiver.
        assert!(!feed.publish(RawSample::new(1, t(1), 0.0, 0.0, 0.0)));

        ctl.start().await.unwrap();
        // Pipeline kept its clock: an older sample is rejected.
        feed.publish(RawSample::new(1, t(-5), 0.0, 0.0, 0.0));
        timeout(std::time::Duration::from_secs(5), async {
            while ctl.status().rejected_samples < 1 {
                sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(store.machine(1).unwrap().running);
        ctl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_worker_drops_oldest() {
        let feed = SampleFeed::new(4);
        let mut rx = feed.subscribe();
        for i in 0..10 {
            feed.publish(RawSample::new(1, t(i), 0.0, 0.0, 0.0));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        // Newest four survive.
        assert_eq!(rx.recv().await.unwrap().timestamp, t(6));
    }
}
