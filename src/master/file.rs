use std::collections::{BTreeMap, HashMap};

use crate::chunk::{ChunkHandle, ChunkserverAddress};

/// Metadata for one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// The chunks that make up the file, in order.
    pub chunk_handles: Vec<ChunkHandle>,
    /// The length of the file in bytes.
    pub size: u64,
}

#[derive(Debug, Default)]
struct ReplicaSet {
    addresses: Vec<ChunkserverAddress>,
    /// Bumped whenever the set is replaced or dropped.
    epoch: u64,
}

/// File table plus chunk locations.
#[derive(Debug, Default)]
pub struct MetadataStore {
    files: BTreeMap<String, FileEntry>,
    replicas: HashMap<ChunkHandle, ReplicaSet>,
    next_epoch: u64,
}

impl MetadataStore {
    pub fn new() -> MetadataStore {
        MetadataStore::default()
    }

    /// Insert or replace the entry for `filename`.
    pub fn put(&mut self, filename: &str, chunk_handles: Vec<ChunkHandle>, size: u64) {
        for handle in &chunk_handles {
            if !self.replicas.contains_key(handle) {
                let epoch = self.bump_epoch();
                self.replicas.insert(handle.clone(), ReplicaSet { addresses: Vec::new(), epoch });
            }
        }
        self.files.insert(filename.to_string(), FileEntry { chunk_handles, size });
    }

    pub fn get(&self, filename: &str) -> Option<&FileEntry> {
        self.files.get(filename)
    }

    pub fn remove(&mut self, filename: &str) -> Option<FileEntry> {
        self.files.remove(filename)
    }

    /// Filenames starting with `prefix`, in lexicographic order.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        self.files
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// Replace the replica set of `handle`, dropping duplicate addresses.
    pub fn set_replicas(&mut self, handle: &str, addresses: Vec<ChunkserverAddress>) {
        let mut deduped: Vec<ChunkserverAddress> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !deduped.contains(&address) {
                deduped.push(address);
            }
        }
        let epoch = self.bump_epoch();
        self.replicas.insert(handle.to_string(), ReplicaSet { addresses: deduped, epoch });
    }

    /// Current replica addresses of `handle`; empty if the handle is unknown.
    pub fn replicas(&self, handle: &str) -> Vec<ChunkserverAddress> {
        self.replicas
            .get(handle)
            .map(|set| set.addresses.clone())
            .unwrap_or_default()
    }

    pub fn replicas_with_epoch(&self, handle: &str) -> Option<(Vec<ChunkserverAddress>, u64)> {
        self.replicas
            .get(handle)
            .map(|set| (set.addresses.clone(), set.epoch))
    }

    /// Remove `address` from the replica set of `handle`. Returns whether it was present.
    pub fn remove_replica(&mut self, handle: &str, address: &str) -> bool {
        match self.replicas.get_mut(handle) {
            Some(set) => {
                let before = set.addresses.len();
                set.addresses.retain(|a| a != address);
                set.addresses.len() != before
            }
            None => false,
        }
    }

    /// Append `addresses` to the replica set of `handle`, unless the set was
    /// replaced or dropped since `epoch` was read. Returns the addresses
    /// actually added.
    pub fn add_replicas(
        &mut self,
        handle: &str,
        epoch: u64,
        addresses: &[ChunkserverAddress],
    ) -> Vec<ChunkserverAddress> {
        let Some(set) = self.replicas.get_mut(handle) else {
            return Vec::new();
        };
        if set.epoch != epoch {
            return Vec::new();
        }
        let mut added = Vec::new();
        for address in addresses {
            if !set.addresses.contains(address) {
                set.addresses.push(address.clone());
                added.push(address.clone());
            }
        }
        added
    }

    pub fn drop_replicas(&mut self, handle: &str) -> Vec<ChunkserverAddress> {
        self.replicas
            .remove(handle)
            .map(|set| set.addresses)
            .unwrap_or_default()
    }

    /// Handles whose replica set includes `address`, sorted.
    pub fn chunks_on(&self, address: &str) -> Vec<ChunkHandle> {
        let mut handles: Vec<ChunkHandle> = self
            .replicas
            .iter()
            .filter(|(_, set)| set.addresses.iter().any(|a| a == address))
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort();
        handles
    }
}
