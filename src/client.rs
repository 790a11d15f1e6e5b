use std::time::Duration;

use tonic::transport::Channel;

use crate::config::{MasterConfig, DEFAULT_MAX_CHUNK_BYTES};
use crate::error::{GfsError, Result};
use crate::proto::master_service_client::MasterServiceClient;
use crate::proto::{
    DeleteFileRequest, DeleteFileResponse, DownloadFileRequest, DownloadFileResponse, GetChunkLocationsRequest,
    GetChunkLocationsResponse, HeartbeatRequest, ListFilesRequest, ListFilesResponse, StatusRequest, StatusResponse,
    UploadFileRequest, UploadFileResponse,
};
use crate::rpc::{endpoint, message_limit};

/// Thin client for the master's operations.
///
/// Each call returns the master's response as-is, success flag and message
/// included. `Err` is reserved for connectivity problems and timeouts.
///
/// The default timeout covers the slowest upload a default master can
/// perform (see `MasterConfig::client_timeout`). A shorter timeout can
/// report a failure for an upload the master goes on to commit.
#[derive(Debug, Clone)]
pub struct Client {
    master_addr: String,
    timeout: Duration,
    max_chunk_bytes: usize,
}

impl Client {
    pub fn new(master_addr: impl Into<String>) -> Client {
        Client {
            master_addr: master_addr.into(),
            timeout: MasterConfig::default().client_timeout(),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Client {
        self.timeout = timeout;
        self
    }

    /// Must match the master's `max_chunk_bytes`.
    pub fn with_max_chunk_bytes(mut self, max_chunk_bytes: usize) -> Client {
        self.max_chunk_bytes = max_chunk_bytes;
        self
    }

    pub fn master_addr(&self) -> &str {
        &self.master_addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn connect(&self) -> Result<MasterServiceClient<Channel>> {
        let channel = endpoint(&self.master_addr, self.timeout)?
            .timeout(self.timeout)
            .connect()
            .await
            .map_err(|e| GfsError::Transport(format!("failed to connect to master {}: {e}", self.master_addr)))?;
        let limit = message_limit(self.max_chunk_bytes);
        Ok(MasterServiceClient::new(channel)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit))
    }

    /// Data larger than one chunk is refused here with the master's own
    /// message instead of being sent.
    pub async fn upload(&self, filename: &str, data: &[u8]) -> Result<UploadFileResponse> {
        if data.len() > self.max_chunk_bytes {
            let err = GfsError::ChunkTooLarge {
                size: data.len(),
                limit: self.max_chunk_bytes,
            };
            return Ok(UploadFileResponse {
                success: false,
                message: err.to_string(),
                replicas: Vec::new(),
            });
        }
        let request = UploadFileRequest {
            filename: filename.to_string(),
            data: data.to_vec(),
        };
        Ok(self.connect().await?.upload_file(request).await?.into_inner())
    }

    pub async fn download(&self, filename: &str) -> Result<DownloadFileResponse> {
        let request = DownloadFileRequest {
            filename: filename.to_string(),
        };
        Ok(self.connect().await?.download_file(request).await?.into_inner())
    }

    pub async fn list(&self, prefix: &str) -> Result<ListFilesResponse> {
        let request = ListFilesRequest {
            prefix: prefix.to_string(),
        };
        Ok(self.connect().await?.list_files(request).await?.into_inner())
    }

    pub async fn delete(&self, filename: &str) -> Result<DeleteFileResponse> {
        let request = DeleteFileRequest {
            filename: filename.to_string(),
        };
        Ok(self.connect().await?.delete_file(request).await?.into_inner())
    }

    pub async fn locate_chunk(&self, filename: &str, index: usize) -> Result<GetChunkLocationsResponse> {
        let request = GetChunkLocationsRequest {
            filename: filename.to_string(),
            chunk_index: index as u64,
        };
        Ok(self.connect().await?.get_chunk_locations(request).await?.into_inner())
    }

    /// Announce `chunkserver_id` to the master.
    pub async fn heartbeat(&self, chunkserver_id: &str) -> Result<()> {
        let request = HeartbeatRequest {
            chunkserver_id: chunkserver_id.to_string(),
        };
        self.connect().await?.heartbeat(request).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        Ok(self.connect().await?.status(StatusRequest {}).await?.into_inner())
    }
}
