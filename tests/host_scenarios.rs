//! End-to-end world scenarios across hosts on loopback.
//!
//! Every host gets a helper task that accepts all session requests and
//! forwards events to the test, which then waits for specific events.

use std::sync::Arc;
use std::time::Duration;

use abyss_core::{EntryState, Host, HostEvent, JoinCode, ObjectInfo, PeerSession, RootKey};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

const WORLD_URL: &str = "https://world.example/lobby";

async fn host() -> Arc<Host> {
    Arc::new(
        Host::bind("127.0.0.1:0", &RootKey::generate())
            .await
            .expect("bind failed"),
    )
}

fn introduce(a: &Host, b: &Host) {
    a.append_known_peer(&b.root_cert_pem(), &b.handshake_cert_pem())
        .expect("valid certificates");
}

fn introduce_both(a: &Host, b: &Host) {
    introduce(a, b);
    introduce(b, a);
}

struct EventLog {
    rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl EventLog {
    /// Accept every session request on `host` and record all events.
    fn auto_accept(host: &Arc<Host>) -> Self {
        let host = Arc::clone(host);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = host.next_event().await {
                if let HostEvent::SessionRequest { world, session } = &event {
                    host.accept_session(*world, session).await;
                }
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Self { rx }
    }

    async fn wait_for(&mut self, what: &str, pred: impl Fn(&HostEvent) -> bool) -> HostEvent {
        timeout(TEST_TIMEOUT, async {
            loop {
                let event = self.rx.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
    }

    async fn session_ready(&mut self, world: Uuid, peer_id: &str) -> PeerSession {
        let event = self
            .wait_for("session ready", |e| {
                matches!(e, HostEvent::SessionReady { world: w, session } if *w == world && session.peer_id == peer_id)
            })
            .await;
        match event {
            HostEvent::SessionReady { session, .. } => session,
            _ => unreachable!(),
        }
    }
}

/// `joiner` joins the lobby world opened on `owner` at `/home`.
async fn join_home(joiner: &Host, owner: &Host) -> Uuid {
    joiner
        .join_world(&owner.aurl("/home"), &CancellationToken::new())
        .await
        .expect("join_world failed")
}

async fn open_home(owner: &Host) -> Uuid {
    let world = owner.open_world(WORLD_URL).await;
    owner.expose_world(world, "/home").await.expect("expose failed");
    world
}

#[tokio::test]
async fn peers_report_connection() {
    let a = host().await;
    let b = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let mut log_b = EventLog::auto_accept(&b);
    introduce_both(&a, &b);

    a.dial(b.id()).expect("dial failed");
    let b_id = b.id().to_string();
    let a_id = a.id().to_string();
    log_a
        .wait_for("peer connected", |e| matches!(e, HostEvent::PeerConnected { peer } if peer.id() == b_id))
        .await;
    log_b
        .wait_for("peer connected", |e| matches!(e, HostEvent::PeerConnected { peer } if peer.id() == a_id))
        .await;
    assert_eq!(a.connected_peers().await, vec![b_id]);
}

#[tokio::test]
async fn join_reaches_membership_on_both_sides() {
    let a = host().await;
    let b = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let mut log_b = EventLog::auto_accept(&b);
    introduce_both(&a, &b);

    let world_b = open_home(&b).await;
    log_b
        .wait_for("world enter", |e| matches!(e, HostEvent::WorldEnter { world, .. } if *world == world_b))
        .await;

    let world_a = join_home(&a, &b).await;
    let entered = log_a
        .wait_for("world enter", |e| matches!(e, HostEvent::WorldEnter { world, .. } if *world == world_a))
        .await;
    match entered {
        HostEvent::WorldEnter { url, .. } => assert_eq!(url, WORLD_URL),
        _ => unreachable!(),
    }

    log_a.session_ready(world_a, b.id()).await;
    log_b.session_ready(world_b, a.id()).await;

    let members = a.world_members(world_a).await.expect("world exists");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].peer_id, b.id());
    assert_eq!(members[0].state, EntryState::Mem);
}

#[tokio::test]
async fn third_joiner_meets_existing_member() {
    let a = host().await;
    let b = host().await;
    let c = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let mut log_b = EventLog::auto_accept(&b);
    let mut log_c = EventLog::auto_accept(&c);
    introduce_both(&a, &b);
    introduce_both(&c, &b);

    let world_b = open_home(&b).await;
    let world_a = join_home(&a, &b).await;
    log_a.session_ready(world_a, b.id()).await;
    log_b.session_ready(world_b, a.id()).await;

    let world_c = join_home(&c, &b).await;
    log_c.session_ready(world_c, b.id()).await;

    // A and C never exchanged certificates; B introduces them
    log_a.session_ready(world_a, c.id()).await;
    log_c.session_ready(world_c, a.id()).await;

    for (host, world) in [(&a, world_a), (&b, world_b), (&c, world_c)] {
        let members = host.world_members(world).await.expect("world exists");
        let settled = members.iter().filter(|m| m.state == EntryState::Mem).count();
        assert_eq!(settled, 2, "{} should see two members", host.id());
    }
}

#[tokio::test]
async fn overlapping_joins_converge() {
    let a = host().await;
    let b = host().await;
    let c = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let mut log_b = EventLog::auto_accept(&b);
    let mut log_c = EventLog::auto_accept(&c);
    introduce_both(&a, &b);
    introduce_both(&c, &b);

    let world_b = open_home(&b).await;
    let world_a = join_home(&a, &b).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let world_c = join_home(&c, &b).await;

    log_a.session_ready(world_a, c.id()).await;
    log_c.session_ready(world_c, a.id()).await;
    log_b.session_ready(world_b, a.id()).await;
    log_b.session_ready(world_b, c.id()).await;

    for (host, world) in [(&a, world_a), (&c, world_c)] {
        let members = host.world_members(world).await.expect("world exists");
        let settled = members.iter().filter(|m| m.state == EntryState::Mem).count();
        assert_eq!(settled, 2, "{} should see two members", host.id());
    }
}

#[tokio::test]
async fn members_meet_across_a_join_chain() {
    let a = host().await;
    let b = host().await;
    let c = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let mut log_b = EventLog::auto_accept(&b);
    let mut log_c = EventLog::auto_accept(&c);
    introduce_both(&a, &b);
    introduce_both(&c, &b);

    // B joins A's world and exposes its own session of it; C joins through B
    let world_a = open_home(&a).await;
    let world_b = join_home(&b, &a).await;
    log_b.session_ready(world_b, a.id()).await;
    b.expose_world(world_b, "/relay").await.expect("expose failed");

    let world_c = c
        .join_world(&b.aurl("/relay"), &CancellationToken::new())
        .await
        .expect("join_world failed");
    log_c.session_ready(world_c, b.id()).await;
    log_c.session_ready(world_c, a.id()).await;
    log_a.session_ready(world_a, c.id()).await;

    let members = a.world_members(world_a).await.expect("world exists");
    let settled = members.iter().filter(|m| m.state == EntryState::Mem).count();
    assert_eq!(settled, 2);
}

#[tokio::test]
async fn objects_reach_member_sessions() {
    let a = host().await;
    let b = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let mut log_b = EventLog::auto_accept(&b);
    introduce_both(&a, &b);

    let world_b = open_home(&b).await;
    let world_a = join_home(&a, &b).await;
    let session_b = log_a.session_ready(world_a, b.id()).await;
    let session_a = log_b.session_ready(world_b, a.id()).await;

    let object = ObjectInfo {
        id: Uuid::new_v4(),
        addr: "https://world.example/carrot.aml".into(),
        transform: [1.0, 2.0, 3.0, 1.0, 0.0, 0.0, 0.0],
    };
    assert!(a.object_append(world_a, &session_b, vec![object.clone()]).await);
    let appended = log_b
        .wait_for("object append", |e| matches!(e, HostEvent::ObjectAppend { world, .. } if *world == world_b))
        .await;
    match appended {
        HostEvent::ObjectAppend { session, objects, .. } => {
            assert_eq!(session, session_a);
            assert_eq!(objects, vec![object.clone()]);
        }
        _ => unreachable!(),
    }

    assert!(a.object_delete(world_a, &session_b, vec![object.id]).await);
    let deleted = log_b
        .wait_for("object delete", |e| matches!(e, HostEvent::ObjectDelete { world, .. } if *world == world_b))
        .await;
    match deleted {
        HostEvent::ObjectDelete { object_ids, .. } => assert_eq!(object_ids, vec![object.id]),
        _ => unreachable!(),
    }

    let stranger = PeerSession { peer_id: b.id().to_string(), session_id: Uuid::new_v4() };
    assert!(!a.object_append(world_a, &stranger, vec![object]).await);
}

#[tokio::test]
async fn join_on_unexposed_path_fails() {
    let a = host().await;
    let b = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let _log_b = EventLog::auto_accept(&b);
    introduce_both(&a, &b);
    open_home(&b).await;

    let world_a = a
        .join_world(&b.aurl("/nowhere"), &CancellationToken::new())
        .await
        .expect("join_world failed");
    let failed = log_a
        .wait_for("join fail", |e| matches!(e, HostEvent::JoinFail { world, .. } if *world == world_a))
        .await;
    match failed {
        HostEvent::JoinFail { code, .. } => assert_eq!(code, JoinCode::NotFound.code()),
        _ => unreachable!(),
    }
    log_a
        .wait_for("world leave", |e| matches!(e, HostEvent::WorldLeave { world, .. } if *world == world_a))
        .await;
    assert!(a.world_members(world_a).await.is_none());
}

#[tokio::test]
async fn leaving_closes_remote_session() {
    let a = host().await;
    let b = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let mut log_b = EventLog::auto_accept(&b);
    introduce_both(&a, &b);

    let world_b = open_home(&b).await;
    let world_a = join_home(&a, &b).await;
    log_a.session_ready(world_a, b.id()).await;
    let session_a = log_b.session_ready(world_b, a.id()).await;

    a.leave_world(world_a).await;
    let left = log_a
        .wait_for("world leave", |e| matches!(e, HostEvent::WorldLeave { world, .. } if *world == world_a))
        .await;
    match left {
        HostEvent::WorldLeave { code, .. } => assert_eq!(code, JoinCode::Closed.code()),
        _ => unreachable!(),
    }
    a.leave_world(world_a).await;
    assert!(!a.world_ids().await.contains(&world_a));

    let closed = log_b
        .wait_for("session close", |e| matches!(e, HostEvent::SessionClose { world, .. } if *world == world_b))
        .await;
    match closed {
        HostEvent::SessionClose { session, .. } => assert_eq!(session, session_a),
        _ => unreachable!(),
    }
    assert_eq!(b.world_members(world_b).await.expect("world exists").len(), 0);
}

#[tokio::test]
async fn host_shutdown_is_seen_by_members() {
    let a = host().await;
    let b = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    let mut log_b = EventLog::auto_accept(&b);
    introduce_both(&a, &b);

    let world_b = open_home(&b).await;
    let world_a = join_home(&a, &b).await;
    log_a.session_ready(world_a, b.id()).await;
    log_b.session_ready(world_b, a.id()).await;

    a.close();
    let a_id = a.id().to_string();
    log_b
        .wait_for("session close", |e| matches!(e, HostEvent::SessionClose { world, .. } if *world == world_b))
        .await;
    log_b
        .wait_for("peer disconnected", |e| matches!(e, HostEvent::PeerDisconnected { peer_id } if *peer_id == a_id))
        .await;
}

#[tokio::test]
async fn cancelled_join_leaves_world() {
    let a = host().await;
    let b = host().await;
    let mut log_a = EventLog::auto_accept(&a);
    introduce_both(&a, &b);
    let world_b = open_home(&b).await;

    // nobody accepts on B, so A stays joining until cancelled
    let cancel = CancellationToken::new();
    let world_a = a
        .join_world(&b.aurl("/home"), &cancel)
        .await
        .expect("join_world failed");
    cancel.cancel();

    let failed = log_a
        .wait_for("join fail", |e| matches!(e, HostEvent::JoinFail { world, .. } if *world == world_a))
        .await;
    match failed {
        HostEvent::JoinFail { code, .. } => assert_eq!(code, JoinCode::Canceled.code()),
        _ => unreachable!(),
    }
    assert!(b.world_ids().await.contains(&world_b));
}
