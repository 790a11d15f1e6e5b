//! Error handling for the file system.

use std::io;
use thiserror::Error;

/// Result type for file system operations.
pub type Result<T> = std::result::Result<T, GfsError>;

#[derive(Error, Debug)]
pub enum GfsError {
    /// The filename is not present in the metadata store.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The file maps to more than one chunk.
    #[error("multi-chunk files not supported: {0}")]
    MultiChunkUnsupported(String),

    /// No replica of the chunk could be read.
    #[error("failed to retrieve chunk {0} from any chunkserver")]
    Unavailable(String),

    /// No Active chunkserver exists to place a new chunk on.
    #[error("no chunkservers available")]
    NoChunkservers,

    /// Every placement target refused or failed the store call.
    #[error("failed to store chunk {0} on any chunkserver")]
    StoreFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The file does not fit in a single chunk.
    #[error("file of {size} bytes exceeds the maximum chunk size of {limit} bytes")]
    ChunkTooLarge { size: usize, limit: usize },

    /// The chunk handle cannot be used as a local storage key.
    #[error("invalid chunk handle: {0:?}")]
    InvalidChunkHandle(String),

    /// The chunkserver holds no data for the handle.
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("checksum mismatch for chunk {handle}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        handle: String,
        expected: u32,
        actual: u32,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    /// Connectivity failures talking to a remote process.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected wire messages.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for GfsError {
    fn from(err: serde_json::Error) -> Self {
        GfsError::Protocol(err.to_string())
    }
}

impl From<tonic::Status> for GfsError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::DeadlineExceeded => GfsError::Timeout(status.message().to_string()),
            // Message size limits and undecodable payloads.
            tonic::Code::OutOfRange | tonic::Code::ResourceExhausted | tonic::Code::Internal => {
                GfsError::Protocol(status.message().to_string())
            }
            _ => GfsError::Transport(format!("{}: {}", status.code(), status.message())),
        }
    }
}

impl From<tonic::transport::Error> for GfsError {
    fn from(err: tonic::transport::Error) -> Self {
        GfsError::Transport(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GfsError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GfsError::Timeout(err.to_string())
    }
}

impl GfsError {
    /// Whether the error came from the network rather than from a business outcome.
    pub fn is_transport(&self) -> bool {
        matches!(self, GfsError::Transport(_) | GfsError::Timeout(_) | GfsError::Io(_))
    }
}
