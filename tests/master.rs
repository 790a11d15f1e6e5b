use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gfs::chunkserver::{Chunkserver, ChunkserverStorage};
use gfs::common::{ChunkserverClient, DeleteChunkResponse, NetworkShim, RetrieveChunkResponse, StoreChunkResponse};
use gfs::config::MasterConfig;
use gfs::master::registry::Liveness;
use gfs::master::MasterServer;
use gfs::GfsError;
use tempfile::TempDir;
use tokio::sync::watch;

struct Cluster {
    master: MasterServer,
    network: Arc<NetworkShim>,
    nodes: HashMap<String, Arc<Chunkserver>>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    async fn new(n: usize) -> Cluster {
        let _ = env_logger::builder().is_test(true).try_init();
        let network = Arc::new(NetworkShim::new());
        let master = MasterServer::new(MasterConfig::default(), network.clone());
        let mut nodes = HashMap::new();
        let mut dirs = Vec::new();
        for i in 0..n {
            let dir = tempfile::tempdir().unwrap();
            let address = format!("cs-{i}");
            let cs = Arc::new(Chunkserver::new(
                address.clone(),
                ChunkserverStorage::open(dir.path()).unwrap(),
                4,
            ));
            network.add_node(&address, cs.clone());
            master.heartbeat(&address).await;
            nodes.insert(address, cs);
            dirs.push(dir);
        }
        Cluster {
            master,
            network,
            nodes,
            _dirs: dirs,
        }
    }

    fn node(&self, address: &str) -> &Chunkserver {
        &self.nodes[address]
    }

    async fn heartbeat(&self, addresses: &[&str]) {
        for address in addresses {
            self.master.heartbeat(address).await;
        }
    }

    async fn replicas(&self, filename: &str) -> Vec<String> {
        self.master.locate_chunk(filename, 0).await.unwrap().addresses
    }

    async fn liveness(&self, address: &str) -> Option<Liveness> {
        self.master
            .status()
            .await
            .chunkservers
            .into_iter()
            .find(|cs| cs.address == address)
            .map(|cs| cs.liveness)
    }
}

#[tokio::test(start_paused = true)]
async fn round_trip_preserves_bytes() {
    let cluster = Cluster::new(3).await;
    let large: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    for (name, data) in [("empty", Vec::new()), ("one", vec![42u8]), ("large", large)] {
        cluster.master.upload(name, &data).await.unwrap();
        assert_eq!(cluster.master.download(name).await.unwrap(), data, "{name}");
    }
}

#[tokio::test(start_paused = true)]
async fn upload_places_r_replicas_in_registry_order() {
    let cluster = Cluster::new(4).await;
    let replicas = cluster.master.upload("f.txt", b"hello").await.unwrap();
    assert_eq!(replicas, vec!["cs-0", "cs-1", "cs-2"]);

    let location = cluster.master.locate_chunk("f.txt", 0).await.unwrap();
    assert_eq!(location.handle, "f.txt-0");
    assert_eq!(location.addresses, replicas);
    assert!(cluster.node("cs-1").has_chunk("f.txt-0"));
    assert!(!cluster.node("cs-3").has_chunk("f.txt-0"));
}

#[tokio::test(start_paused = true)]
async fn upload_succeeds_with_a_single_acknowledgment() {
    let cluster = Cluster::new(3).await;
    cluster.network.partition("cs-0");
    cluster.network.partition("cs-1");

    let replicas = cluster.master.upload("a.txt", b"data").await.unwrap();
    assert_eq!(replicas, vec!["cs-2"]);
    assert_eq!(cluster.replicas("a.txt").await, vec!["cs-2"]);
}

#[tokio::test(start_paused = true)]
async fn upload_without_chunkservers_fails() {
    let cluster = Cluster::new(0).await;
    let err = cluster.master.upload("a.txt", b"data").await.unwrap_err();
    assert!(matches!(err, GfsError::NoChunkservers));
    assert_eq!(err.to_string(), "no chunkservers available");
    assert!(cluster.master.list("").await.is_empty());
    assert!(cluster.master.locate_chunk("a.txt", 0).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn upload_fails_when_every_store_fails() {
    let cluster = Cluster::new(2).await;
    cluster.network.partition("cs-0");
    cluster.network.partition("cs-1");

    let err = cluster.master.upload("a.txt", b"data").await.unwrap_err();
    assert!(matches!(err, GfsError::StoreFailed(_)));
    assert!(cluster.master.list("").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_reupload_keeps_previous_version() {
    let cluster = Cluster::new(2).await;
    cluster.master.upload("a.txt", b"v1").await.unwrap();
    cluster.network.partition("cs-0");
    cluster.network.partition("cs-1");
    assert!(cluster.master.upload("a.txt", b"v2").await.is_err());

    cluster.network.heal("cs-0");
    assert_eq!(cluster.master.download("a.txt").await.unwrap(), b"v1");
}

#[tokio::test(start_paused = true)]
async fn list_filters_by_prefix() {
    let cluster = Cluster::new(1).await;
    for name in ["logs-b", "logs-a", "data"] {
        cluster.master.upload(name, b"x").await.unwrap();
    }
    assert_eq!(cluster.master.list("logs").await, vec!["logs-a", "logs-b"]);
    assert_eq!(cluster.master.list("").await, vec!["data", "logs-a", "logs-b"]);
    assert!(cluster.master.list("nothing").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_removes_metadata_and_replicas() {
    let cluster = Cluster::new(3).await;
    cluster.master.upload("f.txt", b"bye").await.unwrap();
    cluster.master.delete("f.txt").await.unwrap();

    assert!(!cluster.master.list("").await.contains(&"f.txt".to_string()));
    assert!(cluster.master.locate_chunk("f.txt", 0).await.is_none());
    for node in cluster.nodes.values() {
        assert!(!node.has_chunk("f.txt-0"));
    }
    assert!(matches!(
        cluster.master.download("f.txt").await,
        Err(GfsError::FileNotFound(_))
    ));
    assert!(matches!(
        cluster.master.delete("f.txt").await,
        Err(GfsError::FileNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn delete_tolerates_unreachable_replicas() {
    let cluster = Cluster::new(3).await;
    cluster.master.upload("f.txt", b"bye").await.unwrap();
    cluster.network.partition("cs-1");

    cluster.master.delete("f.txt").await.unwrap();
    assert!(cluster.master.locate_chunk("f.txt", 0).await.is_none());
    assert!(!cluster.node("cs-0").has_chunk("f.txt-0"));
    // Unreachable during delete, so its copy is left behind.
    assert!(cluster.node("cs-1").has_chunk("f.txt-0"));
}

#[tokio::test(start_paused = true)]
async fn locate_out_of_range_is_not_found() {
    let cluster = Cluster::new(1).await;
    cluster.master.upload("f.txt", b"x").await.unwrap();
    assert!(cluster.master.locate_chunk("f.txt", 1).await.is_none());
    assert!(cluster.master.locate_chunk("missing", 0).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn download_fails_over_to_next_replica() {
    let cluster = Cluster::new(2).await;
    cluster.master.upload("f.txt", b"payload").await.unwrap();
    assert_eq!(cluster.replicas("f.txt").await, vec!["cs-0", "cs-1"]);

    cluster.network.partition("cs-0");
    assert_eq!(cluster.master.download("f.txt").await.unwrap(), b"payload");
}

#[tokio::test(start_paused = true)]
async fn download_skips_negative_acknowledgments() {
    let cluster = Cluster::new(2).await;
    cluster.master.upload("f.txt", b"payload").await.unwrap();
    // cs-0 answers but no longer has the chunk.
    assert!(cluster.node("cs-0").delete_chunk("f.txt-0").success);
    assert_eq!(cluster.master.download("f.txt").await.unwrap(), b"payload");
}

#[tokio::test(start_paused = true)]
async fn download_unavailable_when_every_replica_fails() {
    let cluster = Cluster::new(2).await;
    cluster.master.upload("f.txt", b"payload").await.unwrap();
    cluster.network.partition("cs-0");
    cluster.network.partition("cs-1");
    assert!(matches!(
        cluster.master.download("f.txt").await,
        Err(GfsError::Unavailable(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn repeated_heartbeats_keep_one_healthy_record() {
    let cluster = Cluster::new(0).await;
    for _ in 0..10 {
        cluster.master.heartbeat("cs-9").await;
    }
    let status = cluster.master.status().await;
    assert_eq!(status.chunkservers.len(), 1);
    assert_eq!(status.chunkservers[0].liveness, Liveness::Active);
}

#[tokio::test(start_paused = true)]
async fn stale_chunkserver_keeps_serving_reads_but_gets_no_new_chunks() {
    let cluster = Cluster::new(4).await;
    cluster.master.upload("old.txt", b"old").await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    cluster.heartbeat(&["cs-3"]).await;
    assert_eq!(cluster.liveness("cs-0").await, Some(Liveness::Stale));

    let replicas = cluster.master.upload("new.txt", b"new").await.unwrap();
    assert_eq!(replicas, vec!["cs-3"]);

    assert_eq!(cluster.replicas("old.txt").await, vec!["cs-0", "cs-1", "cs-2"]);
    assert_eq!(cluster.master.download("old.txt").await.unwrap(), b"old");
}

#[tokio::test(start_paused = true)]
async fn failure_triggers_exactly_one_re_replication() {
    let cluster = Cluster::new(4).await;
    cluster.master.upload("f.txt", b"precious").await.unwrap();
    cluster.master.upload("g.txt", b"other").await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    cluster.heartbeat(&["cs-1", "cs-2", "cs-3"]).await;

    let report = cluster.master.run_health_sweep().await;
    assert_eq!(report.newly_failed, vec!["cs-0"]);
    assert_eq!(report.re_replication.len(), 1);
    let recovery = &report.re_replication[0];
    assert_eq!(recovery.affected, vec!["f.txt-0", "g.txt-0"]);
    assert!(recovery.orphaned.is_empty());
    assert_eq!(
        recovery.added,
        vec![
            ("f.txt-0".to_string(), "cs-3".to_string()),
            ("g.txt-0".to_string(), "cs-3".to_string()),
        ]
    );

    assert_eq!(cluster.replicas("f.txt").await, vec!["cs-1", "cs-2", "cs-3"]);
    assert_eq!(cluster.liveness("cs-0").await, Some(Liveness::Failed));
    let copy = cluster.node("cs-3").retrieve_chunk("f.txt-0");
    assert_eq!(copy.data, b"precious");

    // Later sweeps see cs-0 already failed and do nothing.
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(30)).await;
        cluster.heartbeat(&["cs-1", "cs-2", "cs-3"]).await;
        let again = cluster.master.run_health_sweep().await;
        assert!(again.newly_failed.is_empty());
        assert!(again.re_replication.is_empty());
    }
    assert_eq!(cluster.replicas("f.txt").await, vec!["cs-1", "cs-2", "cs-3"]);
}

#[tokio::test(start_paused = true)]
async fn re_replication_reads_from_a_surviving_replica() {
    let cluster = Cluster::new(3).await;
    // Replicas on cs-0 and cs-1 only.
    cluster.network.partition("cs-2");
    cluster.master.upload("f.txt", b"data").await.unwrap();
    cluster.network.heal("cs-2");
    assert_eq!(cluster.replicas("f.txt").await, vec!["cs-0", "cs-1"]);

    tokio::time::advance(Duration::from_secs(60)).await;
    cluster.heartbeat(&["cs-1", "cs-2"]).await;

    let report = cluster.master.run_health_sweep().await;
    assert_eq!(report.newly_failed, vec!["cs-0"]);
    assert_eq!(cluster.replicas("f.txt").await, vec!["cs-1", "cs-2"]);
    assert_eq!(cluster.node("cs-2").retrieve_chunk("f.txt-0").data, b"data");
}

#[tokio::test(start_paused = true)]
async fn losing_the_last_replica_orphans_the_chunk() {
    let cluster = Cluster::new(1).await;
    cluster.master.upload("f.txt", b"only copy").await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    let report = cluster.master.run_health_sweep().await;
    assert_eq!(report.newly_failed, vec!["cs-0"]);
    assert_eq!(report.re_replication[0].orphaned, vec!["f.txt-0"]);

    assert!(cluster.replicas("f.txt").await.is_empty());
    assert_eq!(cluster.master.list("").await, vec!["f.txt"]);
    assert!(matches!(
        cluster.master.download("f.txt").await,
        Err(GfsError::Unavailable(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_chunkserver_recovers_on_next_heartbeat() {
    let cluster = Cluster::new(1).await;
    tokio::time::advance(Duration::from_secs(90)).await;
    cluster.master.run_health_sweep().await;
    assert_eq!(cluster.liveness("cs-0").await, Some(Liveness::Failed));
    assert!(matches!(
        cluster.master.upload("f.txt", b"x").await,
        Err(GfsError::NoChunkservers)
    ));

    cluster.heartbeat(&["cs-0"]).await;
    assert_eq!(cluster.liveness("cs-0").await, Some(Liveness::Active));
    assert_eq!(cluster.master.upload("f.txt", b"x").await.unwrap(), vec!["cs-0"]);
}

#[tokio::test(start_paused = true)]
async fn reupload_replaces_replicas_and_cleans_old_copies() {
    let cluster = Cluster::new(4).await;
    cluster.master.upload("f.txt", b"v1").await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    cluster.heartbeat(&["cs-3"]).await;
    let replicas = cluster.master.upload("f.txt", b"version two").await.unwrap();
    assert_eq!(replicas, vec!["cs-3"]);
    assert_eq!(cluster.replicas("f.txt").await, vec!["cs-3"]);
    assert_eq!(cluster.master.download("f.txt").await.unwrap(), b"version two");
    assert_eq!(cluster.master.list("").await, vec!["f.txt"]);
    for old in ["cs-0", "cs-1", "cs-2"] {
        assert!(!cluster.node(old).has_chunk("f.txt-0"), "{old}");
    }
}

#[tokio::test(start_paused = true)]
async fn background_monitor_sweeps_on_its_own() {
    let cluster = Cluster::new(2).await;
    cluster.master.upload("f.txt", b"data").await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = cluster.master.spawn_health_monitor(shutdown_rx);

    tokio::time::advance(Duration::from_secs(59)).await;
    cluster.heartbeat(&["cs-1"]).await;

    for _ in 0..40 {
        if cluster.liveness("cs-0").await == Some(Liveness::Failed) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(cluster.liveness("cs-0").await, Some(Liveness::Failed));
    assert_eq!(cluster.replicas("f.txt").await, vec!["cs-1"]);

    shutdown_tx.send(true).unwrap();
    monitor.await.unwrap();
}

/// Chunkserver client that takes a while to answer and records how many
/// calls were in flight at once.
#[derive(Default)]
struct SlowClient {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stored: Mutex<HashMap<(String, String), Vec<u8>>>,
    /// Addresses that never answer.
    black_holes: Vec<String>,
}

impl SlowClient {
    async fn work(&self, address: &str) {
        if self.black_holes.iter().any(|a| a == address) {
            std::future::pending::<()>().await;
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChunkserverClient for SlowClient {
    async fn store(&self, address: &str, handle: &str, data: &[u8]) -> gfs::Result<StoreChunkResponse> {
        self.work(address).await;
        self.stored
            .lock()
            .unwrap()
            .insert((address.to_string(), handle.to_string()), data.to_vec());
        Ok(StoreChunkResponse {
            success: true,
            message: "ok".into(),
        })
    }

    async fn retrieve(&self, address: &str, handle: &str) -> gfs::Result<RetrieveChunkResponse> {
        self.work(address).await;
        let data = self
            .stored
            .lock()
            .unwrap()
            .get(&(address.to_string(), handle.to_string()))
            .cloned();
        Ok(RetrieveChunkResponse {
            success: data.is_some(),
            data: data.unwrap_or_default(),
            message: String::new(),
        })
    }

    async fn delete(&self, address: &str, handle: &str) -> gfs::Result<DeleteChunkResponse> {
        self.work(address).await;
        self.stored
            .lock()
            .unwrap()
            .remove(&(address.to_string(), handle.to_string()));
        Ok(DeleteChunkResponse {
            success: true,
            message: "ok".into(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn uploads_are_serialized_but_downloads_overlap() {
    let client = Arc::new(SlowClient::default());
    let config = MasterConfig {
        replication_factor: 1,
        ..MasterConfig::default()
    };
    let master = Arc::new(MasterServer::new(config, client.clone()));
    master.heartbeat("slow-0").await;

    let (a, b) = tokio::join!(master.upload("a", b"1"), master.upload("b", b"2"));
    a.unwrap();
    b.unwrap();
    assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);

    client.max_in_flight.store(0, Ordering::SeqCst);
    let (a, b) = tokio::join!(master.download("a"), master.download("b"));
    assert_eq!(a.unwrap(), b"1");
    assert_eq!(b.unwrap(), b"2");
    assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn timed_out_store_counts_as_failure() {
    let client = Arc::new(SlowClient {
        black_holes: vec!["hole".to_string()],
        ..SlowClient::default()
    });
    let master = MasterServer::new(MasterConfig::default(), client.clone());
    master.heartbeat("hole").await;
    master.heartbeat("ok").await;

    let replicas = master.upload("f", b"data").await.unwrap();
    assert_eq!(replicas, vec!["ok"]);
    assert_eq!(master.download("f").await.unwrap(), b"data");
}

/// Master over a `SlowClient` with chunk f-0 on n0 and n1, where n0 has just
/// gone past the failure threshold and n2 is a fresh placement target.
async fn slow_cluster_with_failing_node() -> (Arc<MasterServer>, Arc<SlowClient>) {
    let client = Arc::new(SlowClient::default());
    let config = MasterConfig {
        replication_factor: 2,
        ..MasterConfig::default()
    };
    let master = Arc::new(MasterServer::new(config, client.clone()));
    master.heartbeat("n0").await;
    master.heartbeat("n1").await;
    assert_eq!(master.upload("f", b"v1").await.unwrap(), vec!["n0", "n1"]);

    tokio::time::advance(Duration::from_secs(61)).await;
    master.heartbeat("n1").await;
    master.heartbeat("n2").await;
    (master, client)
}

#[tokio::test(start_paused = true)]
async fn re_replication_yields_to_a_reupload_during_the_copy() {
    let (master, client) = slow_cluster_with_failing_node().await;

    let sweep = tokio::spawn({
        let master = master.clone();
        async move { master.run_health_sweep().await }
    });
    // The sweep is now fetching f-0 from n1, which takes a second.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(master.upload("f", b"v2").await.unwrap(), vec!["n1", "n2"]);

    let report = sweep.await.unwrap();
    assert_eq!(report.newly_failed, vec!["n0"]);
    assert_eq!(report.re_replication[0].affected, vec!["f-0"]);
    assert!(report.re_replication[0].added.is_empty());

    let location = master.locate_chunk("f", 0).await.unwrap();
    assert_eq!(location.addresses, vec!["n1", "n2"]);
    let n2_copy = client
        .stored
        .lock()
        .unwrap()
        .get(&("n2".to_string(), "f-0".to_string()))
        .cloned();
    assert_eq!(n2_copy.as_deref(), Some(&b"v2"[..]));
    assert_eq!(master.download("f").await.unwrap(), b"v2");
}

#[tokio::test(start_paused = true)]
async fn re_replication_yields_to_a_delete_during_the_copy() {
    let (master, client) = slow_cluster_with_failing_node().await;

    let sweep = tokio::spawn({
        let master = master.clone();
        async move { master.run_health_sweep().await }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    master.delete("f").await.unwrap();

    let report = sweep.await.unwrap();
    assert!(report.re_replication[0].added.is_empty());
    assert!(master.locate_chunk("f", 0).await.is_none());
    assert!(master.list("").await.is_empty());
    let stored = client.stored.lock().unwrap();
    assert!(!stored.contains_key(&("n2".to_string(), "f-0".to_string())));
}

#[tokio::test(start_paused = true)]
async fn overlapping_sweeps_run_once() {
    let (master, _client) = slow_cluster_with_failing_node().await;

    let (first, second) = tokio::join!(master.run_health_sweep(), master.run_health_sweep());
    let (ran, skipped) = match (first.skipped, second.skipped) {
        (false, true) => (first, second),
        (true, false) => (second, first),
        other => panic!("expected exactly one skipped sweep, got {other:?}"),
    };
    assert_eq!(ran.newly_failed, vec!["n0"]);
    assert_eq!(ran.re_replication[0].added, vec![("f-0".to_string(), "n2".to_string())]);
    assert!(skipped.newly_failed.is_empty());
    assert!(skipped.re_replication.is_empty());

    // Nothing is in progress any more, so the next sweep runs.
    assert!(!master.run_health_sweep().await.skipped);
}
