use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, info, warn};
use lru::LruCache;
use tokio::sync::watch;

use crate::chunk::{checksum, is_storable_handle};
use crate::client::Client;
use crate::common::{DeleteChunkResponse, RetrieveChunkResponse, StoreChunkResponse};
use crate::config::ChunkserverConfig;
use crate::error::{GfsError, Result};

/// Local blob store: one file per chunk handle under `storage_dir`.
pub struct ChunkserverStorage {
    // The path to the chunkserver storage directory.
    storage_dir: PathBuf,

    // Checksum of every chunk on disk, keyed by handle.
    chunks: HashMap<String, u32>,
}

impl ChunkserverStorage {
    /// Open (creating if needed) the storage directory and index the chunks
    /// already in it.
    pub fn open(storage_dir: impl Into<PathBuf>) -> Result<ChunkserverStorage> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir)?;

        let mut chunks = HashMap::new();
        for entry in std::fs::read_dir(&storage_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(handle) = entry.file_name().to_str().map(str::to_string) else {
                warn!("Skipping non UTF-8 file in {}", storage_dir.display());
                continue;
            };
            let data = std::fs::read(entry.path())?;
            let sum = checksum(&data);
            debug!("Indexed chunk {handle} ({} bytes, crc {sum:08x})", data.len());
            chunks.insert(handle, sum);
        }

        info!("Opened chunk storage at {} with {} chunks", storage_dir.display(), chunks.len());
        Ok(ChunkserverStorage { storage_dir, chunks })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.chunks.contains_key(handle)
    }

    fn chunk_path(&self, handle: &str) -> Result<PathBuf> {
        if !is_storable_handle(handle) {
            return Err(GfsError::InvalidChunkHandle(handle.to_string()));
        }
        Ok(self.storage_dir.join(handle))
    }

    /// Write (or overwrite) a chunk.
    pub fn write_chunk(&mut self, handle: &str, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(handle)?;
        std::fs::write(path, data)?;
        self.chunks.insert(handle.to_string(), checksum(data));
        Ok(())
    }

    /// Read a chunk back, verifying it against the checksum taken when it was written.
    pub fn read_chunk(&self, handle: &str) -> Result<Vec<u8>> {
        let path = self.chunk_path(handle)?;
        let Some(&expected) = self.chunks.get(handle) else {
            return Err(GfsError::ChunkNotFound(handle.to_string()));
        };
        let data = std::fs::read(path)?;
        let actual = checksum(&data);
        if actual != expected {
            return Err(GfsError::ChecksumMismatch {
                handle: handle.to_string(),
                expected,
                actual,
            });
        }
        Ok(data)
    }

    pub fn delete_chunk(&mut self, handle: &str) -> Result<()> {
        let path = self.chunk_path(handle)?;
        if self.chunks.remove(handle).is_none() {
            return Err(GfsError::ChunkNotFound(handle.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }
}

struct Inner {
    storage: ChunkserverStorage,

    /// Recently read chunks.
    lru_cache: LruCache<String, Vec<u8>>,
}

/// A chunkserver: the storage adapter the master drives over RPC.
pub struct Chunkserver {
    pub id: String,
    inner: Mutex<Inner>,
}

impl Chunkserver {
    pub fn new(id: impl Into<String>, storage: ChunkserverStorage, cache_capacity: usize) -> Chunkserver {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Chunkserver {
            id: id.into(),
            inner: Mutex::new(Inner {
                storage,
                lru_cache: LruCache::new(capacity),
            }),
        }
    }

    /// Open a chunkserver over a data directory, as the chunkserver process does.
    pub fn open(config: &ChunkserverConfig) -> Result<Chunkserver> {
        let storage = ChunkserverStorage::open(&config.data_dir)?;
        Ok(Chunkserver::new(config.advertise_addr.clone(), storage, config.cache_capacity))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().storage.len()
    }

    pub fn has_chunk(&self, handle: &str) -> bool {
        self.lock().storage.contains(handle)
    }

    pub fn store_chunk(&self, handle: &str, data: &[u8]) -> StoreChunkResponse {
        let mut inner = self.lock();
        inner.lru_cache.pop(handle);
        match inner.storage.write_chunk(handle, data) {
            Ok(()) => {
                info!("[{}] Stored chunk {handle} ({} bytes)", self.id, data.len());
                StoreChunkResponse {
                    success: true,
                    message: "Chunk stored successfully".to_string(),
                }
            }
            Err(e) => {
                warn!("[{}] Failed to store chunk {handle}: {e}", self.id);
                StoreChunkResponse {
                    success: false,
                    message: format!("Failed to store chunk: {e}"),
                }
            }
        }
    }

    pub fn retrieve_chunk(&self, handle: &str) -> RetrieveChunkResponse {
        let mut inner = self.lock();
        if let Some(data) = inner.lru_cache.get(handle) {
            debug!("[{}] Served chunk {handle} from cache", self.id);
            return RetrieveChunkResponse {
                success: true,
                data: data.clone(),
                message: "Chunk retrieved successfully".to_string(),
            };
        }

        match inner.storage.read_chunk(handle) {
            Ok(data) => {
                info!("[{}] Retrieved chunk {handle} ({} bytes)", self.id, data.len());
                inner.lru_cache.put(handle.to_string(), data.clone());
                RetrieveChunkResponse {
                    success: true,
                    data,
                    message: "Chunk retrieved successfully".to_string(),
                }
            }
            Err(e) => {
                warn!("[{}] Failed to retrieve chunk {handle}: {e}", self.id);
                RetrieveChunkResponse {
                    success: false,
                    data: Vec::new(),
                    message: format!("Failed to retrieve chunk: {e}"),
                }
            }
        }
    }

    pub fn delete_chunk(&self, handle: &str) -> DeleteChunkResponse {
        let mut inner = self.lock();
        inner.lru_cache.pop(handle);
        match inner.storage.delete_chunk(handle) {
            Ok(()) => {
                info!("[{}] Deleted chunk {handle}", self.id);
                DeleteChunkResponse {
                    success: true,
                    message: "Chunk deleted successfully".to_string(),
                }
            }
            Err(e) => {
                warn!("[{}] Failed to delete chunk {handle}: {e}", self.id);
                DeleteChunkResponse {
                    success: false,
                    message: format!("Failed to delete chunk: {e}"),
                }
            }
        }
    }
}

/// Send a heartbeat to the master every `heartbeat_interval` until `shutdown`
/// flips to true. Failures are logged and the loop carries on.
pub async fn run_heartbeats(config: ChunkserverConfig, mut shutdown: watch::Receiver<bool>) {
    let client = Client::new(config.master_addr.clone())
        .with_timeout(config.heartbeat_timeout())
        .with_max_chunk_bytes(config.max_chunk_bytes);

    let mut ticker = tokio::time::interval(config.heartbeat_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match client.heartbeat(&config.advertise_addr).await {
                    Ok(()) => debug!("Sent heartbeat to master {}", config.master_addr),
                    Err(e) => warn!("Failed to send heartbeat to master {}: {e}", config.master_addr),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Heartbeat sender stopping");
                    return;
                }
            }
        }
    }
}
