//! Database growth monitoring.
//!
//! The persistence worker calls [`StorageGrowthMonitor::check_size`] after
//! every job. Most calls return immediately; once the check interval has
//! passed the monitor probes the store size and logs the growth since start.
//! Probe failures are logged and count as a zero size for that sample.

use crate::storage::MarketStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One logged size sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthReport {
    pub size_mb: f64,
    pub growth_mb: f64,
    pub elapsed_hours: f64,
    pub growth_rate_mb_per_hour: f64,
}

/// Periodic size sampler for the backing store.
pub struct StorageGrowthMonitor {
    store: Arc<dyn MarketStore>,
    interval: Duration,
    started_at: Instant,
    last_check: Instant,
    initial_size_mb: f64,
}

impl StorageGrowthMonitor {
    /// Sample the initial size and start the clock.
    pub async fn start(store: Arc<dyn MarketStore>, interval: Duration) -> Self {
        let now = Instant::now();
        let initial_size_mb = probe_mb(store.as_ref()).await;
        info!("Initial database size: {:.2} MB", initial_size_mb);

        Self {
            store,
            interval,
            started_at: now,
            last_check: now,
            initial_size_mb,
        }
    }

    pub fn initial_size_mb(&self) -> f64 {
        self.initial_size_mb
    }

    /// Probe and log if the interval has elapsed since the last sample.
    pub async fn check_size(&mut self) -> Option<GrowthReport> {
        let now = Instant::now();
        if now.duration_since(self.last_check) < self.interval {
            return None;
        }

        let size_mb = probe_mb(self.store.as_ref()).await;
        let growth_mb = size_mb - self.initial_size_mb;
        let elapsed_hours = now.duration_since(self.started_at).as_secs_f64() / 3600.0;
        let growth_rate_mb_per_hour = if elapsed_hours > 0.0 {
            growth_mb / elapsed_hours
        } else {
            0.0
        };

        info!(
            "Database size: {:.2} MB | Growth since start: {:.2} MB | Elapsed time: {:.2} hours | Growth rate: {:.2} MB/hour",
            size_mb, growth_mb, elapsed_hours, growth_rate_mb_per_hour
        );
        self.last_check = now;

        Some(GrowthReport {
            size_mb,
            growth_mb,
            elapsed_hours,
            growth_rate_mb_per_hour,
        })
    }

    pub fn stop(&self) {
        info!("Database size checker stopped");
    }
}

async fn probe_mb(store: &dyn MarketStore) -> f64 {
    match store.size_bytes().await {
        Ok(bytes) => bytes as f64 / BYTES_PER_MB,
        Err(e) => {
            warn!("Error getting {} database size: {}", store.backend(), e);
            0.0
        }
    }
}
