//! The master: file metadata, chunk locations, chunkserver liveness, and
//! the operations clients call.
//!
//! All master state sits behind one reader/writer lock. Uploads and deletes
//! hold the write lock for their whole duration, chunkserver calls included,
//! so they are serialized against each other and against every reader.
//! Downloads only take the read lock to look up the chunk and then talk to
//! chunkservers unlocked.

pub mod file;
pub mod health;
pub mod registry;
pub mod replication;

use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::chunk::{chunk_handle, ChunkHandle, ChunkLocation, ChunkserverAddress, FIRST_CHUNK_INDEX};
use crate::common::ChunkserverClient;
use crate::config::MasterConfig;
use crate::error::{GfsError, Result};

use self::file::MetadataStore;
use self::health::{HealthMonitor, SweepReport};
use self::registry::{ChunkserverRegistry, ChunkserverStatus, Liveness};
use self::replication::ReplicationManager;

/// Everything guarded by the master's lock.
pub struct MasterState {
    pub metadata: MetadataStore,
    pub registry: ChunkserverRegistry,
}

/// Cluster overview returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub file_count: usize,
    pub replication_factor: usize,
    pub chunkservers: Vec<ChunkserverStatus>,
}

pub struct MasterServer {
    state: Arc<RwLock<MasterState>>,
    replication: Arc<ReplicationManager>,
    health: Arc<HealthMonitor>,
    config: MasterConfig,
}

impl MasterServer {
    pub fn new(config: MasterConfig, client: Arc<dyn ChunkserverClient>) -> MasterServer {
        let state = Arc::new(RwLock::new(MasterState {
            metadata: MetadataStore::new(),
            registry: ChunkserverRegistry::new(config.liveness_window(), config.failure_threshold()),
        }));
        let replication = Arc::new(ReplicationManager::new(
            client,
            config.replication_factor,
            config.control_timeout(),
            config.data_timeout(),
        ));
        let health = Arc::new(HealthMonitor::new(state.clone(), replication.clone()));
        MasterServer {
            state,
            replication,
            health,
            config,
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Store `data` as `filename`, replacing any previous file of that name.
    /// Returns the chunkservers that hold the new chunk.
    pub async fn upload(&self, filename: &str, data: &[u8]) -> Result<Vec<ChunkserverAddress>> {
        if filename.is_empty() {
            return Err(GfsError::InvalidArgument("filename must not be empty".to_string()));
        }
        if data.len() > self.config.max_chunk_bytes {
            return Err(GfsError::ChunkTooLarge {
                size: data.len(),
                limit: self.config.max_chunk_bytes,
            });
        }
        let handle = chunk_handle(filename, FIRST_CHUNK_INDEX);

        let mut state = self.state.write().await;
        let available = state.registry.available_for_placement(Instant::now());
        let stored = self.replication.place(&handle, data, &available).await?;

        // Replicas of the previous version that the new placement did not overwrite.
        let mut stale: Vec<(ChunkHandle, Vec<ChunkserverAddress>)> = Vec::new();
        let previous = state
            .metadata
            .get(filename)
            .map(|entry| entry.chunk_handles.clone())
            .unwrap_or_default();
        for old in previous {
            if old == handle {
                let leftover: Vec<ChunkserverAddress> = state
                    .metadata
                    .replicas(&old)
                    .into_iter()
                    .filter(|a| !stored.contains(a))
                    .collect();
                stale.push((old, leftover));
            } else {
                let leftover = state.metadata.drop_replicas(&old);
                stale.push((old, leftover));
            }
        }

        state.metadata.put(filename, vec![handle.clone()], data.len() as u64);
        state.metadata.set_replicas(&handle, stored.clone());

        for (old, addresses) in stale {
            if !addresses.is_empty() {
                debug!("Removing superseded replicas of {old} from {addresses:?}");
                self.replication.delete_replicas(&old, &addresses).await;
            }
        }

        info!(
            "Uploaded file {filename} ({} bytes) as chunk {handle} with {} replicas",
            data.len(),
            stored.len()
        );
        Ok(stored)
    }

    /// Fetch the contents of `filename` from the first replica that answers.
    pub async fn download(&self, filename: &str) -> Result<Vec<u8>> {
        let (handle, replicas) = {
            let state = self.state.read().await;
            let entry = state
                .metadata
                .get(filename)
                .ok_or_else(|| GfsError::FileNotFound(filename.to_string()))?;
            let handle = match entry.chunk_handles.as_slice() {
                [handle] => handle.clone(),
                _ => return Err(GfsError::MultiChunkUnsupported(filename.to_string())),
            };
            let replicas = state.metadata.replicas(&handle);
            (handle, replicas)
        };

        let (data, source) = self.replication.read(&handle, &replicas).await?;
        info!("Downloaded file {filename} ({} bytes) from {source}", data.len());
        Ok(data)
    }

    /// Filenames starting with `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Vec<String> {
        self.state.read().await.metadata.list(prefix)
    }

    /// Remove `filename` and, best effort, every replica of its chunks.
    pub async fn delete(&self, filename: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .metadata
            .remove(filename)
            .ok_or_else(|| GfsError::FileNotFound(filename.to_string()))?;

        for handle in &entry.chunk_handles {
            let replicas = state.metadata.replicas(handle);
            let deleted = self.replication.delete_replicas(handle, &replicas).await;
            if deleted < replicas.len() {
                info!(
                    "Deleted chunk {handle} from {deleted} of {} replicas",
                    replicas.len()
                );
            }
            state.metadata.drop_replicas(handle);
        }

        info!("Deleted file {filename}");
        Ok(())
    }

    /// Handle and replica addresses of chunk `index` of `filename`, or `None`
    /// if the file is unknown or the index is out of range.
    pub async fn locate_chunk(&self, filename: &str, index: usize) -> Option<ChunkLocation> {
        let state = self.state.read().await;
        let handle = state.metadata.get(filename)?.chunk_handles.get(index)?.clone();
        let addresses = state.metadata.replicas(&handle);
        Some(ChunkLocation { handle, addresses })
    }

    /// Record a heartbeat. The identifier is the chunkserver's own address,
    /// which the master also dials for storage calls.
    pub async fn heartbeat(&self, chunkserver_id: &str) {
        let previous = self
            .state
            .write()
            .await
            .registry
            .heartbeat(chunkserver_id, Instant::now());
        match previous {
            None => info!("Registered chunkserver {chunkserver_id}"),
            Some(Liveness::Failed) => info!("Chunkserver {chunkserver_id} recovered"),
            Some(_) => debug!("Received heartbeat from {chunkserver_id}"),
        }
    }

    pub async fn status(&self) -> ClusterStatus {
        let state = self.state.read().await;
        ClusterStatus {
            file_count: state.metadata.file_count(),
            replication_factor: self.replication.replication_factor(),
            chunkservers: state.registry.snapshot(Instant::now()),
        }
    }

    /// Run one health sweep now.
    pub async fn run_health_sweep(&self) -> SweepReport {
        self.health.sweep().await
    }

    /// Start the periodic health sweep in the background.
    pub fn spawn_health_monitor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.health
            .clone()
            .spawn(self.config.health_check_interval(), shutdown)
    }
}
