use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::analytics::{self, BestTimes, HourAvailability, UsageStatistics};
use crate::config::MonitorConfig;
use crate::error::MonitorResult;
use crate::health::FeedHealth;
use crate::ingest::{IngestionController, IngestionStatus, SampleFeed};
use crate::pipeline::IngestPipeline;
use crate::store::{SessionStore, StoreStats};
use crate::types::{AvailableMachine, MachineId, MachineSnapshot, Session};

/// Everything written out on shutdown.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorExport {
    pub machines: Vec<MachineSnapshot>,
    pub stats: StoreStats,
    pub sessions: Vec<Session>,
}

/// Query and control surface shared by the API and the binary.
///
/// Owns the store, the sample feed and the ingestion controller. Analytics
/// run over a read-copy of sessions taken from the store, never under its lock.
pub struct Monitor {
    config: MonitorConfig,
    store: Arc<SessionStore>,
    feed: SampleFeed,
    health: Arc<FeedHealth>,
    ingestion: Mutex<IngestionController>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> MonitorResult<Self> {
        config.validate()?;

        let store = Arc::new(SessionStore::from_config(&config));
        let feed = SampleFeed::new(config.feed_capacity);
        let health = Arc::new(FeedHealth::new(config.machine_ids(), config.stale_after));
        let pipeline = IngestPipeline::new(&config, Arc::clone(&store));
        let ingestion = IngestionController::new(feed.clone(), pipeline, Arc::clone(&health));

        Ok(Self {
            config,
            store,
            feed,
            health,
            ingestion: Mutex::new(ingestion),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Handle for transports to publish samples on.
    pub fn feed(&self) -> SampleFeed {
        self.feed.clone()
    }

    pub fn health(&self) -> &Arc<FeedHealth> {
        &self.health
    }

    fn days_or_default(&self, days: Option<u32>) -> u32 {
        days.unwrap_or(self.config.analytics_window_days)
    }

    pub fn get_snapshot(&self) -> MonitorResult<Vec<MachineSnapshot>> {
        self.store.snapshot()
    }

    pub fn get_machine(&self, machine_id: MachineId) -> MonitorResult<MachineSnapshot> {
        self.store.machine(machine_id)
    }

    pub fn get_available(&self) -> MonitorResult<Vec<AvailableMachine>> {
        self.store.available()
    }

    pub fn get_history(&self, machine_id: MachineId, limit: usize) -> MonitorResult<Vec<Session>> {
        self.store.history(machine_id, limit)
    }

    /// Sessions of one machine within the last `days` days, newest first.
    pub fn get_history_window(&self, machine_id: MachineId, days: Option<u32>) -> MonitorResult<Vec<Session>> {
        // Not-found must still be distinct from an empty history.
        self.store.machine(machine_id)?;
        let sessions = self.store.closed_sessions()?;
        Ok(analytics::machine_history(
            &sessions,
            machine_id,
            Utc::now(),
            self.days_or_default(days),
        ))
    }

    pub fn get_stats(&self) -> MonitorResult<StoreStats> {
        self.store.stats()
    }

    pub fn get_usage_statistics(&self, days: Option<u32>) -> MonitorResult<UsageStatistics> {
        let sessions = self.store.closed_sessions()?;
        Ok(analytics::usage_statistics(&sessions, Utc::now(), self.days_or_default(days)))
    }

    pub fn get_best_times(&self, days: Option<u32>) -> MonitorResult<BestTimes> {
        let sessions = self.store.closed_sessions()?;
        Ok(analytics::best_times(&sessions, Utc::now(), self.days_or_default(days)))
    }

    pub fn get_availability(&self, days: Option<u32>) -> MonitorResult<Vec<HourAvailability>> {
        let sessions = self.store.closed_sessions()?;
        let total_machines = self.store.machine_count()?;
        Ok(analytics::availability_forecast(
            &sessions,
            Utc::now(),
            self.days_or_default(days),
            total_machines,
            self.config.forecast_mode,
        ))
    }

    pub async fn start_ingestion(&self) -> MonitorResult<bool> {
        self.ingestion.lock().await.start().await
    }

    pub async fn stop_ingestion(&self) -> MonitorResult<bool> {
        self.ingestion.lock().await.stop().await
    }

    pub async fn ingestion_status(&self) -> IngestionStatus {
        self.ingestion.lock().await.status()
    }

    pub fn export(&self) -> MonitorResult<MonitorExport> {
        Ok(MonitorExport {
            machines: self.store.snapshot()?,
            stats: self.store.stats()?,
            sessions: self.store.closed_sessions()?,
        })
    }
}
