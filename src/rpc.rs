//! gRPC services and clients between the CLI, the master and chunkservers.
//!
//! Messages and service stubs are generated from `proto/gfs.proto`.
//! Business failures travel inside responses (`success: false` plus a
//! message); only connectivity problems surface as errors on the caller's
//! side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};

use crate::chunk;
use crate::chunkserver::Chunkserver;
use crate::common::{ChunkserverClient, DeleteChunkResponse, RetrieveChunkResponse, StoreChunkResponse};
use crate::config::DEFAULT_MAX_CHUNK_BYTES;
use crate::error::Result;
use crate::master::registry::{self, Liveness};
use crate::master::MasterServer;
use crate::proto::chunkserver_service_client::ChunkserverServiceClient;
use crate::proto::chunkserver_service_server::{ChunkserverService, ChunkserverServiceServer};
use crate::proto::master_service_server::{MasterService, MasterServiceServer};
use crate::proto::{
    self, DeleteChunkRequest, DeleteFileRequest, DeleteFileResponse, DownloadFileRequest, DownloadFileResponse,
    GetChunkLocationsRequest, GetChunkLocationsResponse, HeartbeatRequest, HeartbeatResponse, ListFilesRequest,
    ListFilesResponse, RetrieveChunkRequest, StatusRequest, StatusResponse, StoreChunkRequest, UploadFileRequest,
    UploadFileResponse,
};

/// Room in every message for everything besides the chunk bytes.
pub const MESSAGE_HEADROOM: usize = 64 * 1024;

/// Largest encoded message sent or accepted when chunks are at most
/// `max_chunk_bytes` long. Requests and responses share the same bound.
pub fn message_limit(max_chunk_bytes: usize) -> usize {
    max_chunk_bytes.saturating_add(MESSAGE_HEADROOM)
}

/// An endpoint for `address` (`host:port`, or a full `http://` URI).
pub fn endpoint(address: &str, connect_timeout: Duration) -> Result<Endpoint> {
    let uri = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    Ok(Endpoint::from_shared(uri)?
        .connect_timeout(connect_timeout)
        .tcp_nodelay(true))
}

impl From<Liveness> for proto::Liveness {
    fn from(liveness: Liveness) -> Self {
        match liveness {
            Liveness::Active => proto::Liveness::Active,
            Liveness::Stale => proto::Liveness::Stale,
            Liveness::Failed => proto::Liveness::Failed,
        }
    }
}

impl From<registry::ChunkserverStatus> for proto::ChunkserverStatus {
    fn from(status: registry::ChunkserverStatus) -> Self {
        proto::ChunkserverStatus {
            address: status.address,
            liveness: proto::Liveness::from(status.liveness) as i32,
            seconds_since_heartbeat: status.seconds_since_heartbeat,
        }
    }
}

impl From<chunk::ChunkLocation> for proto::ChunkLocation {
    fn from(location: chunk::ChunkLocation) -> Self {
        proto::ChunkLocation {
            handle: location.handle,
            addresses: location.addresses,
        }
    }
}

/// Storage calls to chunkservers over gRPC.
///
/// One lazily connected channel is kept per address; a channel whose
/// chunkserver went away reconnects on the next call.
pub struct RpcChunkserverClient {
    connect_timeout: Duration,
    max_message_bytes: usize,
    channels: Mutex<HashMap<String, Channel>>,
}

impl RpcChunkserverClient {
    pub fn new(connect_timeout: Duration, max_chunk_bytes: usize) -> RpcChunkserverClient {
        RpcChunkserverClient {
            connect_timeout,
            max_message_bytes: message_limit(max_chunk_bytes),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, address: &str) -> Result<ChunkserverServiceClient<Channel>> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = match channels.get(address) {
            Some(channel) => channel.clone(),
            None => {
                debug!("Opening channel to chunkserver {address}");
                let channel = endpoint(address, self.connect_timeout)?.connect_lazy();
                channels.insert(address.to_string(), channel.clone());
                channel
            }
        };
        Ok(ChunkserverServiceClient::new(channel)
            .max_decoding_message_size(self.max_message_bytes)
            .max_encoding_message_size(self.max_message_bytes))
    }
}

impl Default for RpcChunkserverClient {
    fn default() -> Self {
        RpcChunkserverClient::new(Duration::from_secs(5), DEFAULT_MAX_CHUNK_BYTES)
    }
}

#[async_trait]
impl ChunkserverClient for RpcChunkserverClient {
    async fn store(&self, address: &str, handle: &str, data: &[u8]) -> Result<StoreChunkResponse> {
        let request = StoreChunkRequest {
            chunk_handle: handle.to_string(),
            data: data.to_vec(),
        };
        Ok(self.client(address)?.store_chunk(request).await?.into_inner())
    }

    async fn retrieve(&self, address: &str, handle: &str) -> Result<RetrieveChunkResponse> {
        let request = RetrieveChunkRequest {
            chunk_handle: handle.to_string(),
        };
        Ok(self.client(address)?.retrieve_chunk(request).await?.into_inner())
    }

    async fn delete(&self, address: &str, handle: &str) -> Result<DeleteChunkResponse> {
        let request = DeleteChunkRequest {
            chunk_handle: handle.to_string(),
        };
        Ok(self.client(address)?.delete_chunk(request).await?.into_inner())
    }
}

/// The master's operations exposed as `MasterService`.
pub struct MasterRpc {
    master: Arc<MasterServer>,
}

impl MasterRpc {
    pub fn new(master: Arc<MasterServer>) -> MasterRpc {
        MasterRpc { master }
    }
}

#[tonic::async_trait]
impl MasterService for MasterRpc {
    async fn upload_file(&self, request: Request<UploadFileRequest>) -> std::result::Result<Response<UploadFileResponse>, Status> {
        let UploadFileRequest { filename, data } = request.into_inner();
        let response = match self.master.upload(&filename, &data).await {
            Ok(replicas) => UploadFileResponse {
                success: true,
                message: format!("File uploaded successfully with {} replicas", replicas.len()),
                replicas,
            },
            Err(e) => UploadFileResponse {
                success: false,
                message: e.to_string(),
                replicas: Vec::new(),
            },
        };
        Ok(Response::new(response))
    }

    async fn download_file(&self, request: Request<DownloadFileRequest>) -> std::result::Result<Response<DownloadFileResponse>, Status> {
        let filename = request.into_inner().filename;
        let response = match self.master.download(&filename).await {
            Ok(data) => DownloadFileResponse {
                success: true,
                data,
                message: "File downloaded successfully".to_string(),
            },
            Err(e) => DownloadFileResponse {
                success: false,
                data: Vec::new(),
                message: e.to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn list_files(&self, request: Request<ListFilesRequest>) -> std::result::Result<Response<ListFilesResponse>, Status> {
        let files = self.master.list(&request.into_inner().prefix).await;
        Ok(Response::new(ListFilesResponse {
            success: true,
            message: format!("Found {} files", files.len()),
            files,
        }))
    }

    async fn delete_file(&self, request: Request<DeleteFileRequest>) -> std::result::Result<Response<DeleteFileResponse>, Status> {
        let filename = request.into_inner().filename;
        let response = match self.master.delete(&filename).await {
            Ok(()) => DeleteFileResponse {
                success: true,
                message: "File deleted successfully".to_string(),
            },
            Err(e) => DeleteFileResponse {
                success: false,
                message: e.to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn get_chunk_locations(
        &self,
        request: Request<GetChunkLocationsRequest>,
    ) -> std::result::Result<Response<GetChunkLocationsResponse>, Status> {
        let GetChunkLocationsRequest { filename, chunk_index } = request.into_inner();
        let location = match usize::try_from(chunk_index) {
            Ok(index) => self.master.locate_chunk(&filename, index).await,
            Err(_) => None,
        };
        Ok(Response::new(GetChunkLocationsResponse {
            success: true,
            found: location.is_some(),
            message: match &location {
                Some(loc) => format!("Chunk {} has {} replicas", loc.handle, loc.addresses.len()),
                None => format!("No chunk {chunk_index} for {filename}"),
            },
            location: location.map(proto::ChunkLocation::from),
        }))
    }

    async fn heartbeat(&self, request: Request<HeartbeatRequest>) -> std::result::Result<Response<HeartbeatResponse>, Status> {
        self.master.heartbeat(&request.into_inner().chunkserver_id).await;
        Ok(Response::new(HeartbeatResponse {
            success: true,
            message: "Heartbeat received".to_string(),
        }))
    }

    async fn status(&self, _request: Request<StatusRequest>) -> std::result::Result<Response<StatusResponse>, Status> {
        let status = self.master.status().await;
        Ok(Response::new(StatusResponse {
            success: true,
            message: format!(
                "{} files, {} chunkservers known",
                status.file_count,
                status.chunkservers.len()
            ),
            file_count: status.file_count as u64,
            replication_factor: u32::try_from(status.replication_factor).unwrap_or(u32::MAX),
            chunkservers: status.chunkservers.into_iter().map(Into::into).collect(),
        }))
    }
}

/// A chunkserver's storage exposed as `ChunkserverService`. Disk work runs
/// on the blocking pool.
pub struct ChunkserverRpc {
    chunkserver: Arc<Chunkserver>,
}

impl ChunkserverRpc {
    pub fn new(chunkserver: Arc<Chunkserver>) -> ChunkserverRpc {
        ChunkserverRpc { chunkserver }
    }

    async fn blocking<T, F>(&self, f: F) -> std::result::Result<Response<T>, Status>
    where
        T: Send + 'static,
        F: FnOnce(&Chunkserver) -> T + Send + 'static,
    {
        let chunkserver = self.chunkserver.clone();
        tokio::task::spawn_blocking(move || f(&chunkserver))
            .await
            .map(Response::new)
            .map_err(|e| Status::internal(format!("storage task failed: {e}")))
    }
}

#[tonic::async_trait]
impl ChunkserverService for ChunkserverRpc {
    async fn store_chunk(&self, request: Request<StoreChunkRequest>) -> std::result::Result<Response<StoreChunkResponse>, Status> {
        let StoreChunkRequest { chunk_handle, data } = request.into_inner();
        self.blocking(move |cs| cs.store_chunk(&chunk_handle, &data)).await
    }

    async fn retrieve_chunk(&self, request: Request<RetrieveChunkRequest>) -> std::result::Result<Response<RetrieveChunkResponse>, Status> {
        let chunk_handle = request.into_inner().chunk_handle;
        self.blocking(move |cs| cs.retrieve_chunk(&chunk_handle)).await
    }

    async fn delete_chunk(&self, request: Request<DeleteChunkRequest>) -> std::result::Result<Response<DeleteChunkResponse>, Status> {
        let chunk_handle = request.into_inner().chunk_handle;
        self.blocking(move |cs| cs.delete_chunk(&chunk_handle)).await
    }
}

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender also means shut down.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Serve `MasterService` on `listener` until `shutdown` is set.
pub async fn serve_master(
    listener: TcpListener,
    master: Arc<MasterServer>,
    max_chunk_bytes: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("Master server listening on {}", listener.local_addr()?);
    let limit = message_limit(max_chunk_bytes);
    let service = MasterServiceServer::new(MasterRpc::new(master))
        .max_decoding_message_size(limit)
        .max_encoding_message_size(limit);
    Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown_signal(shutdown))
        .await?;
    info!("Master server shut down");
    Ok(())
}

/// Serve `ChunkserverService` on `listener` until `shutdown` is set.
pub async fn serve_chunkserver(
    listener: TcpListener,
    chunkserver: Arc<Chunkserver>,
    max_chunk_bytes: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("Chunkserver {} listening on {}", chunkserver.id, listener.local_addr()?);
    let limit = message_limit(max_chunk_bytes);
    let service = ChunkserverServiceServer::new(ChunkserverRpc::new(chunkserver))
        .max_decoding_message_size(limit)
        .max_encoding_message_size(limit);
    Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown_signal(shutdown))
        .await?;
    info!("Chunkserver shut down");
    Ok(())
}
