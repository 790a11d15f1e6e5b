//! Chunkserver registry.
//!
//! Records are created on first heartbeat and never evicted, so the table
//! only grows. Callers outside the master see placement lists and status
//! snapshots, never the records themselves.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::chunk::ChunkserverAddress;

/// Liveness of a known chunkserver at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    /// Heard from within the liveness window. Eligible for placement.
    Active,
    /// Silent past the liveness window but not yet declared failed.
    /// Still trusted for existing replicas.
    Stale,
    /// Declared failed by a health sweep.
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChunkserverRecord {
    pub address: ChunkserverAddress,
    pub last_seen: Instant,
    pub healthy: bool,
}

/// Status line for one chunkserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkserverStatus {
    pub address: ChunkserverAddress,
    pub liveness: Liveness,
    pub seconds_since_heartbeat: u64,
}

pub struct ChunkserverRegistry {
    records: BTreeMap<ChunkserverAddress, ChunkserverRecord>,
    liveness_window: Duration,
    failure_threshold: Duration,
}

impl ChunkserverRegistry {
    pub fn new(liveness_window: Duration, failure_threshold: Duration) -> ChunkserverRegistry {
        ChunkserverRegistry {
            records: BTreeMap::new(),
            liveness_window,
            failure_threshold,
        }
    }

    /// Record a heartbeat. Returns the liveness the chunkserver had before it,
    /// or `None` if it was unknown.
    pub fn heartbeat(&mut self, address: &str, now: Instant) -> Option<Liveness> {
        let previous = self.liveness(address, now);
        self.records.insert(
            address.to_string(),
            ChunkserverRecord {
                address: address.to_string(),
                last_seen: now,
                healthy: true,
            },
        );
        previous
    }

    pub fn record(&self, address: &str) -> Option<&ChunkserverRecord> {
        self.records.get(address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn classify(&self, record: &ChunkserverRecord, now: Instant) -> Liveness {
        if !record.healthy {
            return Liveness::Failed;
        }
        if now.saturating_duration_since(record.last_seen) < self.liveness_window {
            Liveness::Active
        } else {
            // Past the failure threshold but not yet swept: still Stale.
            Liveness::Stale
        }
    }

    pub fn liveness(&self, address: &str, now: Instant) -> Option<Liveness> {
        self.records.get(address).map(|r| self.classify(r, now))
    }

    /// Addresses of every Active chunkserver, in registry order.
    pub fn available_for_placement(&self, now: Instant) -> Vec<ChunkserverAddress> {
        self.records
            .values()
            .filter(|r| self.classify(r, now) == Liveness::Active)
            .map(|r| r.address.clone())
            .collect()
    }

    /// Flip every healthy record silent for at least the failure threshold to
    /// unhealthy. Returns only the addresses that flipped on this call.
    pub fn mark_failed(&mut self, now: Instant) -> Vec<ChunkserverAddress> {
        let threshold = self.failure_threshold;
        let mut failed = Vec::new();
        for record in self.records.values_mut() {
            if record.healthy && now.saturating_duration_since(record.last_seen) >= threshold {
                record.healthy = false;
                failed.push(record.address.clone());
            }
        }
        failed
    }

    pub fn snapshot(&self, now: Instant) -> Vec<ChunkserverStatus> {
        self.records
            .values()
            .map(|r| ChunkserverStatus {
                address: r.address.clone(),
                liveness: self.classify(r, now),
                seconds_since_heartbeat: now.saturating_duration_since(r.last_seen).as_secs(),
            })
            .collect()
    }
}
