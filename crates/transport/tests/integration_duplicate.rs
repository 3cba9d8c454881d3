//! Duplicate connection suppression
//!
//! Exactly one live connection per (local, remote) pair: incoming
//! duplicates are closed and freed, and dialing a peer that is already
//! connected returns the existing connection.

use std::sync::Arc;
use std::time::Duration;

use peervault_mock::{MemorySecretStore, MockNetwork};
use peervault_transport::{HybridTransport, TransportConfig};
use tokio::time::sleep;

fn transport_on(network: &MockNetwork) -> Arc<HybridTransport> {
    let config = TransportConfig::new(Arc::new(MemorySecretStore::new()));
    HybridTransport::new(config, network.provider())
}

#[tokio::test]
async fn cross_dial_leaves_one_connection_per_side() {
    let network = MockNetwork::new();
    let a = transport_on(&network);
    let b = transport_on(&network);
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    let a_conn = a.connect_with_ticket(&b.generate_ticket().unwrap()).await.unwrap();
    // Let B's accept loop register the incoming connection.
    sleep(Duration::from_millis(50)).await;

    // B dials back: the dial is suppressed in favor of the live incoming
    // connection, so both sides agree on the surviving pair.
    let b_conn = b.connect_with_ticket(&a.generate_ticket().unwrap()).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(a.connections().len(), 1);
    assert_eq!(b.connections().len(), 1);
    assert!(a_conn.state().is_live());
    assert!(b_conn.state().is_live());
    assert_eq!(a_conn.peer_id(), b.node_id().unwrap());
    assert_eq!(b_conn.peer_id(), a.node_id().unwrap());

    // The surviving handles still pass traffic.
    let stream = a_conn.open_stream().await.unwrap();
    stream.send(b"still alive").await.unwrap();
    let accepted = tokio::time::timeout(Duration::from_secs(2), b_conn.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.receive().await.unwrap(), b"still alive");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn dialing_twice_returns_the_same_connection() {
    let network = MockNetwork::new();
    let a = transport_on(&network);
    let b = transport_on(&network);
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    let ticket = b.generate_ticket().unwrap();
    let first = a.connect_with_ticket(&ticket).await.unwrap();
    let second = a.connect_with_ticket(&ticket).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(a.connections().len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn duplicate_incoming_is_rejected_while_live() {
    let network = MockNetwork::new();
    let a = transport_on(&network);
    let b = transport_on(&network);
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    let _conn = a.connect_with_ticket(&b.generate_ticket().unwrap()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(b.connections().len(), 1);

    // A second dial pair lands on B while the first is still live; B keeps
    // exactly one live connection to A.
    network
        .simulate_reconnect(a.node_id().unwrap(), b.node_id().unwrap())
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(b.connections().len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}
