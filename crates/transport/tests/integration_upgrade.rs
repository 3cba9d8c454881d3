//! Full WebRTC upgrade over the mock relay
//!
//! Signaling travels the mock relay streams; ICE runs on loopback host
//! candidates (no STUN servers configured), so the handshake completes
//! machine-locally. These are the slowest tests in the suite.

use std::sync::Arc;
use std::time::Duration;

use peervault_mock::{MemorySecretStore, MockNetwork};
use peervault_transport::{
    HybridConnection, HybridTransport, TransportConfig, UpgradeState,
};
use tokio::time::{sleep, timeout};

fn transport_on(network: &MockNetwork, enable_webrtc: bool) -> Arc<HybridTransport> {
    let mut config = TransportConfig::new(Arc::new(MemorySecretStore::new()));
    config.enable_webrtc = enable_webrtc;
    HybridTransport::new(config, network.provider())
}

async fn linked_pair(
    a: &Arc<HybridTransport>,
    b: &Arc<HybridTransport>,
) -> (Arc<HybridConnection>, Arc<HybridConnection>) {
    let conn_a = a.connect_with_ticket(&b.generate_ticket().unwrap()).await.unwrap();
    let conn_b = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(conn) = b.get_connection(&a.node_id().unwrap()) {
                return conn;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("accept side never appeared");
    (conn_a, conn_b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upgrade_reaches_webrtc_and_routes_streams() {
    let network = MockNetwork::new();
    let a = transport_on(&network, true);
    let b = transport_on(&network, true);
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();
    let (conn_a, conn_b) = linked_pair(&a, &b).await;

    // Kick an attempt; if the opportunistic initiator got there first this
    // returns false and the in-flight handshake finishes the job.
    let _ = timeout(Duration::from_secs(20), conn_a.attempt_upgrade())
        .await
        .expect("upgrade attempt hung");

    timeout(Duration::from_secs(20), async {
        while conn_a.upgrade_state() != UpgradeState::Upgraded
            || conn_b.upgrade_state() != UpgradeState::Upgraded
        {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("upgrade never completed on loopback");

    assert!(conn_a.connection_type().starts_with("WebRTC"));

    // Streams opened after the upgrade travel the direct path, and the
    // framing preserves message boundaries end to end.
    let stream_a = conn_a.open_stream().await.unwrap();
    stream_a.send(b"over the direct path").await.unwrap();
    stream_a.send(&[]).await.unwrap();

    let stream_b = timeout(Duration::from_secs(5), conn_b.accept_stream())
        .await
        .expect("no stream on acceptor")
        .unwrap();
    assert_eq!(stream_b.receive().await.unwrap(), b"over the direct path");
    assert_eq!(stream_b.receive().await.unwrap(), Vec::<u8>::new());

    stream_b.send(b"and back").await.unwrap();
    assert_eq!(stream_a.receive().await.unwrap(), b"and back");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reentrant_upgrade_attempts_return_false() {
    let network = MockNetwork::new();
    let a = transport_on(&network, true);
    let b = transport_on(&network, true);
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();
    let (conn_a, _conn_b) = linked_pair(&a, &b).await;

    let racing = {
        let conn = conn_a.clone();
        tokio::spawn(async move { conn.attempt_upgrade().await })
    };
    // While the first attempt is in flight (or already done), a second
    // call must not start another handshake.
    sleep(Duration::from_millis(20)).await;
    let second = conn_a.attempt_upgrade().await.unwrap();
    assert!(!second);

    let _ = timeout(Duration::from_secs(20), racing).await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_loss_disconnects_the_hybrid() {
    let network = MockNetwork::new();
    let a = transport_on(&network, true);
    let b = transport_on(&network, true);
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();
    let (conn_a, conn_b) = linked_pair(&a, &b).await;

    let _ = timeout(Duration::from_secs(20), conn_a.attempt_upgrade())
        .await
        .expect("upgrade attempt hung");
    timeout(Duration::from_secs(20), async {
        while conn_a.upgrade_state() != UpgradeState::Upgraded {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("upgrade never completed");

    // Sever the relay underneath both sides. The relay is authoritative:
    // the hybrid goes down even though WebRTC was healthy.
    network.simulate_disconnect(a.node_id().unwrap(), b.node_id().unwrap());

    timeout(Duration::from_secs(5), async {
        while conn_a.state().is_live() || conn_b.state().is_live() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("relay loss did not disconnect the hybrids");

    assert_ne!(conn_a.upgrade_state(), UpgradeState::Upgraded);
    assert!(a.get_connection(&conn_a.peer_id()).is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opportunistic_upgrade_fires_for_one_side_only() {
    let network = MockNetwork::new();
    let a = transport_on(&network, true);
    let b = transport_on(&network, true);
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    let (conn_a, conn_b) = linked_pair(&a, &b).await;

    // One deterministic initiator (greater node id) upgrades the pair;
    // both sides converge on Upgraded without rejecting each other.
    let result = timeout(Duration::from_secs(25), async {
        loop {
            if conn_a.upgrade_state() == UpgradeState::Upgraded
                && conn_b.upgrade_state() == UpgradeState::Upgraded
            {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "opportunistic upgrade never converged");
    assert!(conn_a.reject_reason().is_none());
    assert!(conn_b.reject_reason().is_none());

    a.shutdown().await;
    b.shutdown().await;
}
