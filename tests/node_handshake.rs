//! Integration tests for node connection setup.
//!
//! Two nodes on loopback learn each other's certificates, run the
//! handshake and exchange AHMP frames over the resulting peers.

use std::time::Duration;

use abyss_core::{AhmpMessage, AuPing, DialError, Node, Peer, RegistryStatus, RootKey};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn node() -> Node {
    Node::bind("127.0.0.1:0", &RootKey::generate())
        .await
        .expect("bind failed")
}

/// Teach `a` about `b`.
fn introduce(a: &Node, b: &Node) {
    let root = b.root_secret().root_cert_pem();
    let handshake = b.root_secret().handshake_cert_pem();
    assert!(a.append_known_peer(&root, &handshake).expect("valid certificates"));
}

/// Next established peer, skipping handshakes that lost a race.
async fn next_established(node: &Node) -> Peer {
    timeout(TEST_TIMEOUT, async {
        loop {
            match node.accept().await.expect("node closed") {
                Ok(peer) => return peer,
                Err(_) => continue,
            }
        }
    })
    .await
    .expect("accept timed out")
}

async fn next_peer(node: &Node) -> Peer {
    timeout(TEST_TIMEOUT, node.accept())
        .await
        .expect("accept timed out")
        .expect("node closed")
        .expect("handshake failed")
}

#[tokio::test]
async fn nodes_connect_both_ways() {
    let a = node().await;
    let b = node().await;
    introduce(&a, &b);
    introduce(&b, &a);

    a.dial(b.id()).expect("dial failed");
    let peer_at_a = next_peer(&a).await;
    let peer_at_b = next_peer(&b).await;

    assert_eq!(peer_at_a.id(), b.id());
    assert_eq!(peer_at_b.id(), a.id());
    assert!(peer_at_a.is_dialing());
    assert!(!peer_at_b.is_dialing());
    assert_eq!(a.connection_count(), 1);
    assert_eq!(b.connection_count(), 1);
}

#[tokio::test]
async fn redundant_and_unknown_dials_are_refused() {
    let a = node().await;
    let b = node().await;
    let stranger = RootKey::generate().peer_id();
    assert_eq!(
        a.dial(&stranger),
        Err(DialError::Registry(RegistryStatus::UnknownPeer))
    );

    introduce(&a, &b);
    introduce(&b, &a);
    a.dial(b.id()).expect("dial failed");
    let _peer = next_peer(&a).await;
    next_peer(&b).await;

    assert_eq!(
        a.dial(b.id()),
        Err(DialError::Registry(RegistryStatus::Redundant))
    );
}

#[tokio::test]
async fn responder_waits_for_late_introduction() {
    let a = node().await;
    let b = node().await;
    introduce(&a, &b);

    a.dial(b.id()).expect("dial failed");
    tokio::time::sleep(Duration::from_millis(300)).await;
    introduce(&b, &a);

    let peer_at_a = next_peer(&a).await;
    let peer_at_b = next_peer(&b).await;
    assert_eq!(peer_at_a.id(), b.id());
    assert_eq!(peer_at_b.id(), a.id());
}

#[tokio::test]
async fn frames_flow_and_peers_reconnect() {
    let a = node().await;
    let b = node().await;
    introduce(&a, &b);
    introduce(&b, &a);

    for round in 0..5u64 {
        a.dial(b.id()).expect("dial failed");
        let peer_at_a = next_peer(&a).await;
        let peer_at_b = next_peer(&b).await;

        peer_at_a
            .send(AhmpMessage::AuPingTx(AuPing { nonce: round }))
            .expect("send failed");
        let received = timeout(TEST_TIMEOUT, peer_at_b.recv())
            .await
            .expect("recv timed out")
            .expect("recv failed");
        assert_eq!(received, AhmpMessage::AuPingTx(AuPing { nonce: round }));

        assert_eq!(
            a.peer_id_from_tls_cert(&[0u8; 4]),
            None,
            "arbitrary bytes never map to a peer"
        );

        peer_at_a.close();
        timeout(TEST_TIMEOUT, peer_at_b.closed())
            .await
            .expect("remote close not observed");
        peer_at_b.close();
        assert_eq!(a.connection_count(), 0);
        assert_eq!(b.connection_count(), 0);
    }
}

#[tokio::test]
async fn simultaneous_dials_settle_on_one_connection() {
    let a = node().await;
    let b = node().await;
    introduce(&a, &b);
    introduce(&b, &a);

    a.dial(b.id()).expect("dial failed");
    match b.dial(a.id()) {
        Ok(()) | Err(DialError::Registry(RegistryStatus::Redundant)) => {}
        Err(e) => panic!("dial failed: {}", e),
    }
    let peer_at_a = next_established(&a).await;
    let peer_at_b = next_established(&b).await;

    // let the losing handshake finish tearing down
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.connection_count(), 1);
    assert_eq!(b.connection_count(), 1);
    assert_ne!(
        peer_at_a.is_dialing(),
        peer_at_b.is_dialing(),
        "both ends hold the same connection"
    );

    peer_at_a
        .send(AhmpMessage::AuPingTx(AuPing { nonce: 42 }))
        .expect("send failed");
    let received = timeout(TEST_TIMEOUT, peer_at_b.recv())
        .await
        .expect("recv timed out")
        .expect("recv failed");
    assert_eq!(received, AhmpMessage::AuPingTx(AuPing { nonce: 42 }));
}

#[tokio::test]
async fn erasing_a_peer_closes_its_connection() {
    let a = node().await;
    let b = node().await;
    introduce(&a, &b);
    introduce(&b, &a);

    a.dial(b.id()).expect("dial failed");
    let _peer_at_a = next_peer(&a).await;
    let peer_at_b = next_peer(&b).await;

    assert!(a.erase_known_peer(b.id()));
    assert!(!a.erase_known_peer(b.id()));
    assert_eq!(a.connection_count(), 0);
    timeout(TEST_TIMEOUT, peer_at_b.closed())
        .await
        .expect("remote close not observed");
    assert_eq!(
        a.dial(b.id()),
        Err(DialError::Registry(RegistryStatus::UnknownPeer))
    );
}

#[tokio::test]
async fn closed_node_stops_accepting() {
    let a = node().await;
    a.close();
    a.close();
    let outcome = timeout(TEST_TIMEOUT, a.accept()).await.expect("accept hung");
    assert!(outcome.is_none());
}
