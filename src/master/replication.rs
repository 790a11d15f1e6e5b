use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};

use crate::chunk::{ChunkHandle, ChunkserverAddress};
use crate::common::ChunkserverClient;
use crate::error::{GfsError, Result};
use crate::master::MasterState;

/// Outcome of re-replicating the chunks of one failed chunkserver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReReplicationReport {
    pub failed_address: ChunkserverAddress,
    /// Chunks whose replica set contained the failed address.
    pub affected: Vec<ChunkHandle>,
    /// Chunks left with no replica at all.
    pub orphaned: Vec<ChunkHandle>,
    /// Replicas added back, as (handle, address).
    pub added: Vec<(ChunkHandle, ChunkserverAddress)>,
}

/// Placement, fan-out writes, failover reads and recovery.
///
/// Every chunkserver call is bounded by a timeout; a timeout, a transport
/// error and a negative acknowledgment all count as "this target did not
/// succeed". Nothing is retried here.
pub struct ReplicationManager {
    client: Arc<dyn ChunkserverClient>,
    replication_factor: usize,
    control_timeout: Duration,
    data_timeout: Duration,
}

impl ReplicationManager {
    pub fn new(
        client: Arc<dyn ChunkserverClient>,
        replication_factor: usize,
        control_timeout: Duration,
        data_timeout: Duration,
    ) -> ReplicationManager {
        ReplicationManager {
            client,
            replication_factor,
            control_timeout,
            data_timeout,
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    async fn store_on(&self, address: &str, handle: &str, data: &[u8]) -> bool {
        match timeout(self.data_timeout, self.client.store(address, handle, data)).await {
            Ok(Ok(resp)) if resp.success => true,
            Ok(Ok(resp)) => {
                warn!("Chunkserver {address} refused chunk {handle}: {}", resp.message);
                false
            }
            Ok(Err(e)) => {
                warn!("Failed to store chunk {handle} on {address}: {e}");
                false
            }
            Err(_) => {
                warn!("Timed out storing chunk {handle} on {address}");
                false
            }
        }
    }

    async fn retrieve_from(&self, address: &str, handle: &str) -> Option<Vec<u8>> {
        match timeout(self.data_timeout, self.client.retrieve(address, handle)).await {
            Ok(Ok(resp)) if resp.success => Some(resp.data),
            Ok(Ok(resp)) => {
                warn!("Chunkserver {address} returned error for chunk {handle}: {}", resp.message);
                None
            }
            Ok(Err(e)) => {
                warn!("Failed to retrieve chunk {handle} from {address}: {e}");
                None
            }
            Err(_) => {
                warn!("Timed out retrieving chunk {handle} from {address}");
                None
            }
        }
    }

    async fn delete_on(&self, address: &str, handle: &str) -> bool {
        match timeout(self.control_timeout, self.client.delete(address, handle)).await {
            Ok(Ok(resp)) if resp.success => true,
            Ok(Ok(resp)) => {
                warn!("Chunkserver {address} could not delete chunk {handle}: {}", resp.message);
                false
            }
            Ok(Err(e)) => {
                warn!("Failed to delete chunk {handle} from {address}: {e}");
                false
            }
            Err(_) => {
                warn!("Timed out deleting chunk {handle} from {address}");
                false
            }
        }
    }

    /// Place a new chunk on up to `R` of the `available` chunkservers, in
    /// order. Returns the addresses that acknowledged the store.
    pub async fn place(
        &self,
        handle: &str,
        data: &[u8],
        available: &[ChunkserverAddress],
    ) -> Result<Vec<ChunkserverAddress>> {
        if available.is_empty() {
            return Err(GfsError::NoChunkservers);
        }

        let targets = &available[..self.replication_factor.min(available.len())];
        let mut stored = Vec::with_capacity(targets.len());
        for address in targets {
            if self.store_on(address, handle, data).await {
                debug!("Stored chunk {handle} on {address}");
                stored.push(address.clone());
            }
        }

        if stored.is_empty() {
            return Err(GfsError::StoreFailed(handle.to_string()));
        }
        if stored.len() < targets.len() {
            warn!(
                "Chunk {handle} stored on {} of {} targets",
                stored.len(),
                targets.len()
            );
        }
        Ok(stored)
    }

    /// Read a chunk from the first replica that answers.
    pub async fn read(&self, handle: &str, replicas: &[ChunkserverAddress]) -> Result<(Vec<u8>, ChunkserverAddress)> {
        for address in replicas {
            if let Some(data) = self.retrieve_from(address, handle).await {
                return Ok((data, address.clone()));
            }
        }
        Err(GfsError::Unavailable(handle.to_string()))
    }

    /// Best-effort delete of `handle` on every address. Returns how many succeeded.
    pub async fn delete_replicas(&self, handle: &str, replicas: &[ChunkserverAddress]) -> usize {
        let mut deleted = 0;
        for address in replicas {
            if self.delete_on(address, handle).await {
                deleted += 1;
            }
        }
        deleted
    }

    /// React to `failed_address` being declared failed: drop it from every
    /// replica set that holds it, then copy each affected chunk from a
    /// survivor to every Active chunkserver not already holding it.
    ///
    /// The fetch from the survivor runs without the state lock; the stores
    /// and the metadata update run under the write lock and only if the
    /// chunk's replica set has not been replaced since the fetch. The
    /// replica set is never trimmed back down to `R`.
    pub async fn handle_failure(&self, state: &RwLock<MasterState>, failed_address: &str) -> ReReplicationReport {
        let mut report = ReReplicationReport {
            failed_address: failed_address.to_string(),
            ..Default::default()
        };

        let mut pending = Vec::new();
        {
            let mut state = state.write().await;
            for handle in state.metadata.chunks_on(failed_address) {
                state.metadata.remove_replica(&handle, failed_address);
                if state.metadata.replicas(&handle).is_empty() {
                    error!("Chunk {handle} lost its last replica on {failed_address}; data is unrecoverable");
                    report.orphaned.push(handle.clone());
                } else {
                    pending.push(handle.clone());
                }
                report.affected.push(handle);
            }
        }

        if report.affected.is_empty() {
            debug!("Failed chunkserver {failed_address} held no chunks");
            return report;
        }
        info!(
            "Re-replicating {} chunk(s) from failed chunkserver {failed_address}",
            pending.len()
        );

        for handle in pending {
            let (survivors, epoch, targets) = {
                let state = state.read().await;
                let Some((survivors, epoch)) = state.metadata.replicas_with_epoch(&handle) else {
                    continue;
                };
                let targets: Vec<ChunkserverAddress> = state
                    .registry
                    .available_for_placement(Instant::now())
                    .into_iter()
                    .filter(|a| !survivors.contains(a))
                    .collect();
                (survivors, epoch, targets)
            };

            if targets.is_empty() {
                warn!("No Active chunkserver can take a new replica of {handle}");
                continue;
            }

            let data = match self.read(&handle, &survivors).await {
                Ok((data, source)) => {
                    debug!("Fetched {handle} from {source} for re-replication");
                    data
                }
                Err(e) => {
                    warn!("Cannot re-replicate {handle}: {e}");
                    continue;
                }
            };

            // The replica set must be unchanged since the fetch.
            let mut state = state.write().await;
            match state.metadata.replicas_with_epoch(&handle) {
                Some((_, current)) if current == epoch => {}
                _ => {
                    warn!("Replica set of {handle} changed during re-replication; skipping");
                    continue;
                }
            }

            let mut stored = Vec::new();
            for address in &targets {
                if self.store_on(address, &handle, &data).await {
                    stored.push(address.clone());
                }
            }

            for address in state.metadata.add_replicas(&handle, epoch, &stored) {
                info!("Re-replicated {handle} to {address}");
                report.added.push((handle.clone(), address));
            }
        }

        report
    }
}
