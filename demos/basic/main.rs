use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use byte_unit::Byte;
use gfs::chunkserver::{Chunkserver, ChunkserverStorage};
use gfs::common::NetworkShim;
use gfs::config::MasterConfig;
use gfs::master::MasterServer;

#[tokio::main]
async fn main() -> gfs::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let network = Arc::new(NetworkShim::new());

    // Setup master. Short windows so the failover below happens quickly.
    println!("Creating master.\n");
    let config = MasterConfig {
        liveness_window_secs: 1,
        failure_threshold_secs: 2,
        ..MasterConfig::default()
    };
    let master = MasterServer::new(config, network.clone());

    // Setup chunkserver 1-N.
    let n_chunkservers = 4;
    let mut addresses = vec![];
    for i in 0..n_chunkservers {
        println!("Creating chunkserver {}.", i);
        // data path is relative ./data/chunkserver-{i}
        let storage_dir = PathBuf::from(format!("./data/chunkserver-{i}"));
        let storage = ChunkserverStorage::open(storage_dir)?;
        let address = format!("chunkserver-{i}");
        network.add_node(&address, Arc::new(Chunkserver::new(address.clone(), storage, 20)));
        master.heartbeat(&address).await;
        addresses.push(address);
    }

    let data = "hello world".as_bytes();
    let replicas = master.upload("test.txt", data).await?;
    println!("\nUploaded test.txt ({:#}) to {:?}", Byte::from_u64(data.len() as u64), replicas);

    println!("ls");
    master.list("").await.iter().for_each(|x| println!("  {}", x));

    // Take down the first replica and keep the rest alive past the failure threshold.
    let lost = replicas[0].clone();
    println!("\nPartitioning {lost}.");
    network.partition(&lost);

    // Reads fail over to the next replica straight away.
    let read = master.download("test.txt").await?;
    println!("Read back: {}", String::from_utf8_lossy(&read));

    tokio::time::sleep(Duration::from_millis(2100)).await;
    for address in addresses.iter().filter(|a| **a != lost) {
        master.heartbeat(address).await;
    }

    let report = master.run_health_sweep().await;
    println!("\nSweep declared failed: {:?}", report.newly_failed);
    for r in &report.re_replication {
        println!("  re-replicated: {:?}", r.added);
    }

    if let Some(location) = master.locate_chunk("test.txt", 0).await {
        println!("Chunk {} now on {:?}", location.handle, location.addresses);
    }

    master.delete("test.txt").await?;
    println!("\nDeleted test.txt; ls -> {:?}", master.list("").await);
    Ok(())
}
