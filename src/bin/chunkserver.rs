//! The chunkserver process: stores chunks under a data directory, serves
//! them to the master and heartbeats to it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;
use tokio::net::TcpListener;
use tokio::sync::watch;

use gfs::chunkserver::{run_heartbeats, Chunkserver};
use gfs::config::ChunkserverConfig;
use gfs::rpc::serve_chunkserver;

#[derive(Parser, Debug)]
#[command(name = "gfs-chunkserver", about = "Chunk storage server for the file system")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (all interfaces)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address announced to the master; defaults to localhost:<port>
    #[arg(long)]
    advertise: Option<String>,

    /// Directory chunks are stored in
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Master address
    #[arg(short, long)]
    master: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&args.log_level)).init();

    let mut config = match &args.config {
        Some(path) => ChunkserverConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ChunkserverConfig::default(),
    };
    if let Some(port) = args.port {
        config.listen_addr = format!("0.0.0.0:{port}");
        config.advertise_addr = format!("localhost:{port}");
    }
    if let Some(advertise) = args.advertise {
        config.advertise_addr = advertise;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(master) = args.master {
        config.master_addr = master;
    }
    config.validate()?;

    let chunkserver = Chunkserver::open(&config)
        .with_context(|| format!("failed to open data directory {}", config.data_dir.display()))?;
    let chunkserver = Arc::new(chunkserver);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
    info!(
        "Chunkserver {} serving {} chunks from {}",
        config.advertise_addr,
        chunkserver.chunk_count(),
        config.data_dir.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeats = tokio::spawn(run_heartbeats(config.clone(), shutdown_rx.clone()));
    let server = tokio::spawn(serve_chunkserver(
        listener,
        chunkserver,
        config.max_chunk_bytes,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    shutdown_tx.send(true).ok();

    server.await.context("chunkserver task panicked")??;
    heartbeats.await.context("heartbeat task panicked")?;
    Ok(())
}
