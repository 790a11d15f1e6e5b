//! The master process: serves client and chunkserver requests and runs the
//! health monitor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;
use tokio::net::TcpListener;
use tokio::sync::watch;

use gfs::config::MasterConfig;
use gfs::master::MasterServer;
use gfs::rpc::{serve_master, RpcChunkserverClient};

#[derive(Parser, Debug)]
#[command(name = "gfs-master", about = "Master server for the file system")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<String>,

    /// Replicas per new chunk
    #[arg(short = 'r', long)]
    replication_factor: Option<usize>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&args.log_level)).init();

    let mut config = match &args.config {
        Some(path) => MasterConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MasterConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(r) = args.replication_factor {
        config.replication_factor = r;
    }
    config.validate()?;

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;

    let client = Arc::new(RpcChunkserverClient::new(
        config.control_timeout(),
        config.max_chunk_bytes,
    ));
    let master = Arc::new(MasterServer::new(config.clone(), client));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = master.spawn_health_monitor(shutdown_rx.clone());

    let server = tokio::spawn(serve_master(
        listener,
        master.clone(),
        config.max_chunk_bytes,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");
    shutdown_tx.send(true).ok();

    server.await.context("master server task panicked")??;
    monitor.await.context("health monitor task panicked")?;
    Ok(())
}
