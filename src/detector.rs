//! Abuse detection
//!
//! Every screened request bumps a per-origin counter. A sweep every five
//! seconds swaps the counter map for an empty one and blacklists each origin
//! whose count exceeded the configured threshold.
//!
//! The swap is the only way counts leave the map, and it happens under the
//! same lock as increments: an increment lands either in the map the sweep
//! took or in the fresh one, never in both and never in neither.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::lock_utils::lock_or_recover;
use crate::log_file::OperationalLogs;
use crate::store::{BlacklistStore, ConfigStore};

/// Interval of the abuse sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Request counts per origin since the last sweep
#[derive(Debug, Default)]
pub struct OriginCounter {
    counts: Mutex<HashMap<String, u64>>,
}

impl OriginCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, origin: &str) {
        let mut counts = lock_or_recover(&self.counts, "origin counter");
        match counts.get_mut(origin) {
            Some(count) => *count += 1,
            None => {
                counts.insert(origin.to_string(), 1);
            }
        }
    }

    /// Swap in an empty map and return the previous contents
    pub fn take_and_reset(&self) -> HashMap<String, u64> {
        std::mem::take(&mut *lock_or_recover(&self.counts, "origin counter"))
    }

    pub fn count(&self, origin: &str) -> u64 {
        lock_or_recover(&self.counts, "origin counter")
            .get(origin)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        lock_or_recover(&self.counts, "origin counter").is_empty()
    }
}

/// Threshold sweep over the origin counter
pub struct AnomalyDetector {
    counter: Arc<OriginCounter>,
    blacklist: Arc<BlacklistStore>,
    system: Arc<ConfigStore>,
    logs: Arc<OperationalLogs>,
}

impl AnomalyDetector {
    pub fn new(
        counter: Arc<OriginCounter>,
        blacklist: Arc<BlacklistStore>,
        system: Arc<ConfigStore>,
        logs: Arc<OperationalLogs>,
    ) -> Self {
        Self {
            counter,
            blacklist,
            system,
            logs,
        }
    }

    pub fn counter(&self) -> &Arc<OriginCounter> {
        &self.counter
    }

    /// Run one sweep. Returns the origins newly added to the blacklist.
    pub async fn sweep(&self) -> Vec<String> {
        let counts = self.counter.take_and_reset();
        if counts.is_empty() {
            return Vec::new();
        }

        let threshold = self.system.get().dos_detect_threshold;
        debug!(
            "Abuse sweep: {} origins, threshold {}",
            counts.len(),
            threshold
        );

        let mut offenders: Vec<(String, u64)> = counts
            .into_iter()
            .filter(|(_, count)| *count > threshold)
            .collect();
        offenders.sort();

        let mut added = Vec::new();
        for (origin, count) in offenders {
            match self.blacklist.append(&origin).await {
                Ok(true) => {
                    self.logs
                        .security(&format!(
                            "Add {} to the blacklist. <dos_detection> ({} requests > {})",
                            origin, count, threshold
                        ))
                        .await;
                    added.push(origin);
                }
                Ok(false) => {
                    debug!("{} already blacklisted ({} requests)", origin, count);
                }
                Err(e) => {
                    self.logs
                        .critical(&format!("Failed to blacklist {}: {:#}", origin, e))
                        .await;
                }
            }
        }

        added
    }

    /// Start the periodic sweep
    pub fn spawn_sweep_task(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        info!("Starting abuse sweep task (interval: {:?})", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let added = detector.sweep().await;
                if !added.is_empty() {
                    info!(
                        target: "security",
                        "Abuse sweep blacklisted {} origin(s): {:?}",
                        added.len(),
                        added
                    );
                }
            }
        })
    }
}
