use serde::{Deserialize, Serialize};

/// Opaque chunk identifier, `"<filename>-<index>"`.
pub type ChunkHandle = String;

/// Address of a chunkserver. Doubles as its identity in the registry.
pub type ChunkserverAddress = String;

/// Every file currently maps to exactly one chunk, at this index.
pub const FIRST_CHUNK_INDEX: usize = 0;

/// Derive the handle for chunk `index` of `filename`.
pub fn chunk_handle(filename: &str, index: usize) -> ChunkHandle {
    format!("{filename}-{index}")
}

/// A handle is used verbatim as a file name on the chunkserver, so it must
/// not be able to escape the data directory.
pub fn is_storable_handle(handle: &str) -> bool {
    !handle.is_empty()
        && handle != "."
        && handle != ".."
        && !handle.contains('/')
        && !handle.contains('\\')
        && !handle.contains('\0')
}

/// Checksum stored alongside each chunk on disk.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Where a chunk lives, as returned by `locate_chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub handle: ChunkHandle,
    pub addresses: Vec<ChunkserverAddress>,
}
