//! Full shared-mode mTLS round trip between helmd and edged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast;

use edged::apply::{Applier, MemorySink};
use edged::cache::LocalCache;
use edged::client::Client;
use edged::config::Config as DpConfig;
use fleetsync_core::{config_hash, SyncStatus};
use helmd::config::Config as CpConfig;
use helmd::server::Server;

fn write_cluster_cert(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["kong_clustering".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();

    let cert_path = dir.join("cluster.pem");
    let key_path = dir.join("cluster.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key.serialize_pem()).unwrap();
    (cert_path, key_path)
}

#[tokio::test]
async fn test_shared_mode_push_and_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let (cert_path, key_path) = write_cluster_cert(dir.path());

    let export_tree = json!({
        "services": [{"name": "s1", "host": "upstream.internal"}],
        "plugins": [{"name": "key-auth", "service": "s1"}],
    });
    let export_path = dir.path().join("export.json");
    std::fs::write(&export_path, serde_json::to_vec(&export_tree).unwrap()).unwrap();

    let data_dir = dir.path().join("helmd");
    let cp_config = CpConfig::parse_from([
        "helmd",
        "--export",
        export_path.to_str().unwrap(),
        "--cluster-cert",
        cert_path.to_str().unwrap(),
        "--cluster-cert-key",
        key_path.to_str().unwrap(),
        "--data-dir",
        data_dir.to_str().unwrap(),
        "--node-version",
        "3.0.0",
        "--plugin",
        "key-auth@3.0.0",
    ]);
    let server = Arc::new(Server::new(cp_config).unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_task = tokio::spawn(server.clone().run_on(listener));

    let addr_arg = addr.to_string();
    let prefix = dir.path().join("edged");
    let dp_config = DpConfig::parse_from([
        "edged",
        "--cluster-control-plane",
        addr_arg.as_str(),
        "--cluster-cert",
        cert_path.to_str().unwrap(),
        "--cluster-cert-key",
        key_path.to_str().unwrap(),
        "--prefix",
        prefix.to_str().unwrap(),
        "--node-id",
        "dp-e2e",
        "--node-version",
        "3.0.0",
        "--plugin",
        "key-auth@3.0.0",
    ]);
    let sink = Arc::new(MemorySink::new());
    let applier = Arc::new(Applier::new(
        sink.clone(),
        LocalCache::open(&dp_config.prefix).unwrap(),
    ));
    let client = Client::new(&dp_config, applier.clone()).unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let client_task = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move { client.run(shutdown).await })
    };

    // Wait for the data plane to apply the snapshot and report it.
    let status = server.status();
    let expected = config_hash(&export_tree);
    let deadline = Instant::now() + Duration::from_secs(15);
    let record = loop {
        if let Some(record) = status.get("dp-e2e").unwrap() {
            if record.config_hash.as_deref() == Some(expected.as_str()) {
                break record;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for the applied fingerprint"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    assert_eq!(record.sync_status, SyncStatus::Normal);
    assert_eq!(record.version, "3.0.0");
    assert_eq!(sink.applied().unwrap().0, export_tree);
    assert_eq!(server.registry().len(), 1);

    // The applied snapshot also landed in the local cache for cold starts.
    let cached = LocalCache::open(&dp_config.prefix)
        .unwrap()
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(cached, export_tree);

    shutdown_tx.send(()).unwrap();
    server.shutdown();
    client_task.await.unwrap();
    server_task.await.unwrap().unwrap();
}
