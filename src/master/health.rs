use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::chunk::ChunkserverAddress;
use crate::master::replication::{ReReplicationReport, ReplicationManager};
use crate::master::MasterState;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Chunkservers that became Failed during this sweep.
    pub newly_failed: Vec<ChunkserverAddress>,
    pub re_replication: Vec<ReReplicationReport>,
    /// Set when another sweep was already in progress and this one did nothing.
    pub skipped: bool,
}

/// Periodically declares silent chunkservers failed and re-replicates their chunks.
pub struct HealthMonitor {
    state: Arc<RwLock<MasterState>>,
    replication: Arc<ReplicationManager>,
    sweeping: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(state: Arc<RwLock<MasterState>>, replication: Arc<ReplicationManager>) -> HealthMonitor {
        HealthMonitor {
            state,
            replication,
            sweeping: Mutex::new(()),
        }
    }

    /// Run one sweep. A sweep requested while another is running is skipped.
    pub async fn sweep(&self) -> SweepReport {
        let Ok(_guard) = self.sweeping.try_lock() else {
            debug!("Health sweep already running; skipping");
            return SweepReport {
                skipped: true,
                ..Default::default()
            };
        };

        let newly_failed = self.state.write().await.registry.mark_failed(Instant::now());

        let mut report = SweepReport {
            newly_failed: newly_failed.clone(),
            ..Default::default()
        };
        for address in newly_failed {
            warn!("Chunkserver {address} missed heartbeats past the failure threshold; marking failed");
            let result = self.replication.handle_failure(&self.state, &address).await;
            info!(
                "Recovery for {address}: {} affected, {} re-replicated, {} orphaned",
                result.affected.len(),
                result.added.len(),
                result.orphaned.len()
            );
            report.re_replication.push(result);
        }
        report
    }

    /// Spawn the sweep loop. It stops once `shutdown` is set to true or its
    /// sender is dropped.
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Health monitor started, sweeping every {interval:?}");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Health monitor stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}
