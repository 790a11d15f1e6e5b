//! A small Google-File-System-style store.
//!
//! One master keeps every file's metadata and chunk locations in memory and
//! tracks chunkserver liveness through heartbeats. Chunkservers keep chunk
//! bytes on local disk. Each file is a single chunk, replicated on up to
//! `R` chunkservers; a write succeeds if at least one replica acknowledges it.
//!
//! Chunkserver liveness:
//! - Active: heartbeat within the liveness window. Gets new chunks.
//! - Stale: silent past the liveness window. Keeps serving reads of chunks it holds.
//! - Failed: declared by the health sweep after the failure threshold. Its
//!   chunks are copied from a surviving replica onto Active chunkservers.
//!
//! The next heartbeat from any chunkserver makes it Active again.

pub mod chunk;
pub mod chunkserver;
pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod master;
pub mod rpc;

/// Messages and service stubs generated from `proto/gfs.proto`.
pub mod proto {
    tonic::include_proto!("gfs");
}

pub use crate::chunk::{ChunkHandle, ChunkLocation, ChunkserverAddress};
pub use crate::chunkserver::{Chunkserver, ChunkserverStorage};
pub use crate::client::Client;
pub use crate::common::{ChunkserverClient, NetworkShim};
pub use crate::config::{ChunkserverConfig, MasterConfig};
pub use crate::error::{GfsError, Result};
pub use crate::master::MasterServer;
