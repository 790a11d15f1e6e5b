//! Master and chunkserver configuration.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields fall back to the defaults below.

use crate::error::{GfsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest file (a single chunk) accepted by default (64 MiB).
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MasterConfig {
    /// Address the master listens on.
    pub listen_addr: String,
    /// Target number of replicas for a new chunk.
    pub replication_factor: usize,
    /// A chunkserver silent for this long is no longer a placement target.
    pub liveness_window_secs: u64,
    /// A chunkserver silent for this long is declared failed by the sweep.
    pub failure_threshold_secs: u64,
    /// Interval between health sweeps.
    pub health_check_interval_secs: u64,
    /// Timeout for control calls (delete).
    pub control_timeout_secs: u64,
    /// Timeout for data calls (store, retrieve).
    pub data_timeout_secs: u64,
    /// Largest file accepted by `upload`. RPC message limits are derived from it.
    pub max_chunk_bytes: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            replication_factor: 3,
            liveness_window_secs: 30,
            failure_threshold_secs: 60,
            health_check_interval_secs: 30,
            control_timeout_secs: 5,
            data_timeout_secs: 30,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: MasterConfig = serde_json::from_str(&raw)
            .map_err(|e| GfsError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(GfsError::Config("replication_factor must be at least 1".into()));
        }
        if self.failure_threshold_secs < self.liveness_window_secs {
            return Err(GfsError::Config(format!(
                "failure_threshold_secs ({}) must not be shorter than liveness_window_secs ({})",
                self.failure_threshold_secs, self.liveness_window_secs
            )));
        }
        if self.health_check_interval_secs == 0 {
            return Err(GfsError::Config("health_check_interval_secs must be positive".into()));
        }
        if self.control_timeout_secs == 0 {
            return Err(GfsError::Config("control_timeout_secs must be positive".into()));
        }
        if self.data_timeout_secs == 0 {
            return Err(GfsError::Config("data_timeout_secs must be positive".into()));
        }
        if self.max_chunk_bytes == 0 {
            return Err(GfsError::Config("max_chunk_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn failure_threshold(&self) -> Duration {
        Duration::from_secs(self.failure_threshold_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }

    /// Longest an upload can keep the master busy: one store per target
    /// plus one delete per superseded replica.
    pub fn client_timeout(&self) -> Duration {
        let per_replica = self.data_timeout_secs + self.control_timeout_secs;
        Duration::from_secs(per_replica * self.replication_factor as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkserverConfig {
    pub listen_addr: String,
    /// Address reported to the master in heartbeats. The master also dials it.
    pub advertise_addr: String,
    pub master_addr: String,
    pub data_dir: PathBuf,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Number of recently read chunks kept in memory.
    pub cache_capacity: usize,
    /// Must match the master's `max_chunk_bytes`.
    pub max_chunk_bytes: usize,
}

impl Default for ChunkserverConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9001".to_string(),
            advertise_addr: "localhost:9001".to_string(),
            master_addr: "localhost:9000".to_string(),
            data_dir: PathBuf::from("./chunkserver_data"),
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 5,
            cache_capacity: 20,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }
}

impl ChunkserverConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ChunkserverConfig = serde_json::from_str(&raw)
            .map_err(|e| GfsError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(GfsError::Config("heartbeat_interval_secs must be positive".into()));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(GfsError::Config("heartbeat_timeout_secs must be positive".into()));
        }
        if self.max_chunk_bytes == 0 {
            return Err(GfsError::Config("max_chunk_bytes must be positive".into()));
        }
        if self.advertise_addr.is_empty() {
            return Err(GfsError::Config("advertise_addr must not be empty".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}
