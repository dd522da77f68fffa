//! Durability tests: state surviving relay and replica restarts.

use deltasync::protocol::{Delta, Envelope};
use deltasync::relay::{RelayConfig, RelayServer};
use deltasync::replica::{ReplicaAgent, ReplicaConfig};
use deltasync::store::{RelaySnapshot, SnapshotStore};
use futures_util::SinkExt;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tokio::time::{sleep, Duration};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_relay(mut config: RelayConfig) -> (Arc<RelayServer>, u16) {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let relay = Arc::new(RelayServer::new(config));
    let runner = relay.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    (relay, port)
}

async fn wait_until<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if cond().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_relay_restart_recovers_log_and_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("data.json");

    // First incarnation accepts two deltas
    {
        let config = RelayConfig {
            storage_path: Some(path.clone()),
            ..RelayConfig::default()
        };
        let (relay, port) = start_relay(config).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        for (id, amount) in [("e1", 10), ("e2", 4)] {
            let frame = Envelope::Delta(vec![Delta::lww(
                "expense",
                json!({ "id": id, "amount": amount }),
            )])
            .encode()
            .unwrap();
            ws.send(Message::Text(frame.into())).await.unwrap();
        }
        assert!(wait_until(|| async { relay.log_end().await == 2 }).await);
        relay.shutdown();
    }

    // A fresh relay pointed at the same file restores everything
    let relay = RelayServer::with_storage("127.0.0.1:0", &path);
    let restored = relay.recover().await.unwrap();
    assert_eq!(restored, 2);
    assert_eq!(relay.log_end().await, 2);
    let materialized = relay.materialized().await;
    assert_eq!(materialized["expense"]["e1"]["amount"], 10);
    assert_eq!(materialized["expense"]["e2"]["amount"], 4);
}

#[tokio::test]
async fn test_relay_persists_retention_horizon() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.json");

    {
        let config = RelayConfig {
            storage_path: Some(path.clone()),
            retention: Some(2),
            ..RelayConfig::default()
        };
        let (relay, port) = start_relay(config).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        for i in 0..5 {
            let frame = Envelope::Delta(vec![Delta::lww(
                "expense",
                json!({ "id": format!("e{i}") }),
            )])
            .encode()
            .unwrap();
            ws.send(Message::Text(frame.into())).await.unwrap();
        }
        assert!(wait_until(|| async { relay.log_end().await == 5 }).await);
        relay.shutdown();
    }

    // The persisted snapshot carries the trimmed log and its offset
    let store: SnapshotStore<RelaySnapshot> = SnapshotStore::new(&path);
    let snapshot = store.load().await.unwrap();
    assert_eq!(snapshot.deltas.len(), 2);
    assert_eq!(snapshot.first_delta_id, 3);
    // Materialized state still covers the whole history
    assert_eq!(snapshot.entities["expense"].len(), 5);
}

#[tokio::test]
async fn test_replica_restart_preserves_queue_then_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let (relay, port) = start_relay(RelayConfig::default()).await;
    let config = ReplicaConfig {
        relay_url: format!("ws://127.0.0.1:{port}"),
        storage_path: Some(state_path.clone()),
        ..ReplicaConfig::default()
    };

    // Offline session: submissions survive only through the state file
    {
        let agent = ReplicaAgent::open(config.clone()).await.unwrap();
        agent
            .submit(Delta::lww("expense", json!({ "id": "e1", "amount": 10 })))
            .await;
        agent
            .submit(Delta::lww("expense", json!({ "id": "e2", "amount": 7 })))
            .await;
        assert_eq!(agent.queue_len().await, 2);
    }

    // Restarted agent still holds the queue and delivers it on connect
    let agent = ReplicaAgent::open(config).await.unwrap();
    assert_eq!(agent.queue_len().await, 2);
    assert_eq!(agent.mirror().await["expense"]["e1"]["amount"], 10);

    agent.connect().await.unwrap();
    assert!(wait_until(|| async { relay.log_end().await == 2 }).await);
    assert_eq!(agent.queue_len().await, 0);
    assert_eq!(relay.materialized().await["expense"]["e2"]["amount"], 7);
}

#[tokio::test]
async fn test_replica_position_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let (relay, port) = start_relay(RelayConfig::default()).await;

    // Seed the relay with one delta from another client
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let frame = Envelope::Delta(vec![Delta::lww(
        "expense",
        json!({ "id": "e1", "amount": 10 }),
    )])
    .encode()
    .unwrap();
    ws.send(Message::Text(frame.into())).await.unwrap();
    assert!(wait_until(|| async { relay.log_end().await == 1 }).await);

    let config = ReplicaConfig {
        relay_url: format!("ws://127.0.0.1:{port}"),
        storage_path: Some(state_path.clone()),
        ..ReplicaConfig::default()
    };

    // First session catches up to position 1
    {
        let agent = ReplicaAgent::open(config.clone()).await.unwrap();
        agent.connect().await.unwrap();
        assert!(wait_until(|| async { agent.last_delta_id().await == 1 }).await);
    }

    // The restarted agent resumes from where it left off
    let agent = ReplicaAgent::open(config).await.unwrap();
    assert_eq!(agent.last_delta_id().await, 1);
    assert_eq!(agent.mirror().await["expense"]["e1"]["amount"], 10);
}

#[tokio::test]
async fn test_first_run_initializes_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let config = ReplicaConfig {
        storage_path: Some(state_path.clone()),
        ..ReplicaConfig::default()
    };
    let _agent = ReplicaAgent::open(config).await.unwrap();

    // The empty snapshot is persisted immediately on first load
    assert!(state_path.exists());
    let text = tokio::fs::read_to_string(&state_path).await.unwrap();
    assert!(text.contains("lastDeltaId"));
}
