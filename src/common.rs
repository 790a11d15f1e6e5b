use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::chunkserver::Chunkserver;
use crate::error::{GfsError, Result};

pub use crate::proto::{DeleteChunkResponse, RetrieveChunkResponse, StoreChunkResponse};

/// The master's view of a chunkserver: three storage calls addressed to a
/// network endpoint.
///
/// `Err` means the endpoint could not be reached or the call broke in
/// transit. A chunkserver that answers but refuses the operation returns
/// `Ok` with `success == false`.
#[async_trait]
pub trait ChunkserverClient: Send + Sync {
    async fn store(&self, address: &str, handle: &str, data: &[u8]) -> Result<StoreChunkResponse>;

    async fn retrieve(&self, address: &str, handle: &str) -> Result<RetrieveChunkResponse>;

    async fn delete(&self, address: &str, handle: &str) -> Result<DeleteChunkResponse>;
}

/// In-process network of chunkservers keyed by address.
///
/// Nodes can be partitioned off to simulate a crashed or unreachable
/// chunkserver; calls to them fail like a refused connection.
#[derive(Default)]
pub struct NetworkShim {
    nodes: Mutex<HashMap<String, Arc<Chunkserver>>>,
    partitioned: Mutex<HashSet<String>>,
}

impl NetworkShim {
    pub fn new() -> NetworkShim {
        NetworkShim::default()
    }

    pub fn add_node(&self, address: &str, chunkserver: Arc<Chunkserver>) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string(), chunkserver);
    }

    pub fn get_node(&self, address: &str) -> Option<Arc<Chunkserver>> {
        if self
            .partitioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(address)
        {
            return None;
        }
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    /// Make `address` unreachable until `heal` is called.
    pub fn partition(&self, address: &str) {
        self.partitioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.partitioned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    fn reach(&self, address: &str) -> Result<Arc<Chunkserver>> {
        self.get_node(address)
            .ok_or_else(|| GfsError::Transport(format!("connection refused: {address}")))
    }
}

#[async_trait]
impl ChunkserverClient for NetworkShim {
    async fn store(&self, address: &str, handle: &str, data: &[u8]) -> Result<StoreChunkResponse> {
        Ok(self.reach(address)?.store_chunk(handle, data))
    }

    async fn retrieve(&self, address: &str, handle: &str) -> Result<RetrieveChunkResponse> {
        Ok(self.reach(address)?.retrieve_chunk(handle))
    }

    async fn delete(&self, address: &str, handle: &str) -> Result<DeleteChunkResponse> {
        Ok(self.reach(address)?.delete_chunk(handle))
    }
}
