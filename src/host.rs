//! # Host
//!
//! The [`Host`] sits between the network [`Node`] and the AND [`World`]s. It
//! routes inbound AHMP messages to worlds, carries out the side effects
//! worlds request, and hands everything else to the application as
//! [`HostEvent`]s.
//!
//! ## Tasks
//!
//! | Task | Loop |
//! |------|------|
//! | accept | `node.accept()` → register peer, spawn its receive task |
//! | receive (per peer) | `peer.recv()` → route to world |
//! | timer | `timers.wait()` → `world.timer_expire()` |
//!
//! All world calls happen under one host lock, so events produced by one
//! message are delivered before the next message from the same peer is
//! looked at.
//!
//! ## Routing
//!
//! - `JN` goes to the world exposed at the requested path, or is answered
//!   with `JDN(NotFound)`.
//! - Every other message goes to the world named by its receiver session id.
//!   Unknown receivers get a direct `RST`, except `JDN` and `RST` which are
//!   dropped.
//! - The first message a world sees from a peer is preceded by
//!   `peer_connected`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aurl::{Aurl, Scheme};
use crate::events::{AndEvent, AndEventQueue, HostEvent, JoinCode, PeerSession};
use crate::handshake::DialError;
use crate::identity::RootKey;
use crate::messages::{AhmpMessage, Jdn, ObjectInfo, Rst};
use crate::node::Node;
use crate::peer::Peer;
use crate::registry::RegistryStatus;
use crate::timer::TimerQueue;
use crate::world::{Lifecycle, MemberSnapshot, PeerRef, World};

/// Capacity of the application event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// How long `join_world` waits for the target peer to connect.
pub const JOIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between dial attempts while `join_world` waits.
const JOIN_REDIAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct HostState {
    worlds: HashMap<Uuid, World>,
    /// path → world accepting JN there
    exposed: HashMap<String, Uuid>,
    world_paths: HashMap<Uuid, String>,
    /// peer id → worlds that have seen this peer
    participating: HashMap<String, HashSet<Uuid>>,
    /// peer id → worlds waiting for this peer to connect
    requested: HashMap<String, HashSet<Uuid>>,
    peers: HashMap<String, Peer>,
    /// joining world → fired once the join settles
    pending_joins: HashMap<Uuid, CancellationToken>,
}

impl HostState {
    fn is_current(&self, peer: &Peer) -> bool {
        self.peers
            .get(peer.id())
            .is_some_and(|p| p.internal_id() == peer.internal_id())
    }

    fn settle_join(&mut self, lsid: Uuid) {
        if let Some(settled) = self.pending_joins.remove(&lsid) {
            settled.cancel();
        }
    }

    fn forget_world(&mut self, lsid: Uuid) {
        self.settle_join(lsid);
        self.worlds.remove(&lsid);
        if let Some(path) = self.world_paths.remove(&lsid) {
            self.exposed.remove(&path);
        }
        for map in [&mut self.participating, &mut self.requested] {
            map.values_mut().for_each(|worlds| {
                worlds.remove(&lsid);
            });
            map.retain(|_, worlds| !worlds.is_empty());
        }
    }
}

struct HostInner {
    node: Node,
    state: Mutex<HostState>,
    timers: TimerQueue,
    events_tx: mpsc::Sender<HostEvent>,
    events_rx: Mutex<mpsc::Receiver<HostEvent>>,
    peer_notify: Notify,
    cancel: CancellationToken,
}

pub struct Host {
    inner: Arc<HostInner>,
}

fn check_world(world: &World) {
    debug_assert!(world.check_sanity().is_ok(), "{:?}: {:?}", world, world.check_sanity());
}

impl HostInner {
    async fn emit(&self, event: HostEvent) {
        // the receiver lives in `self`
        let _ = self.events_tx.send(event).await;
    }

    /// Carry out the side effects queued by world calls.
    async fn dispatch(&self, state: &mut HostState, mut events: AndEventQueue) {
        while let Some((lsid, event)) = events.pop() {
            match event {
                AndEvent::PeerRequest { peer_id, root_cert_der, handshake_cert_der, .. } => {
                    self.request_peer(state, &mut events, lsid, peer_id, &root_cert_der, &handshake_cert_der);
                }
                AndEvent::PeerDiscard { peer_id } => {
                    let removed = state
                        .participating
                        .get_mut(&peer_id)
                        .is_some_and(|worlds| worlds.remove(&lsid));
                    if !removed {
                        warn!(world = %lsid, peer = %peer_id, "discard of a peer the world never saw");
                        debug_assert!(removed, "peer discard from non-participating world");
                    }
                    state.participating.retain(|_, worlds| !worlds.is_empty());
                }
                AndEvent::TimerRequest { duration } => self.timers.push(lsid, duration),
                AndEvent::WorldEnter { url } => {
                    state.settle_join(lsid);
                    self.emit(HostEvent::WorldEnter { world: lsid, url }).await;
                }
                AndEvent::WorldLeave { code, message } => {
                    info!(world = %lsid, code, "left world");
                    state.forget_world(lsid);
                    self.emit(HostEvent::WorldLeave { world: lsid, code, message }).await;
                }
                other => {
                    if let Some(event) = HostEvent::from_and(lsid, other) {
                        self.emit(event).await;
                    }
                }
            }
        }
    }

    fn request_peer(
        &self,
        state: &mut HostState,
        events: &mut AndEventQueue,
        lsid: Uuid,
        peer_id: String,
        root_cert_der: &[u8],
        handshake_cert_der: &[u8],
    ) {
        if !state.worlds.contains_key(&lsid) {
            return;
        }

        if let Some(peer) = state.peers.get(&peer_id).cloned() {
            state.participating.entry(peer_id).or_default().insert(lsid);
            if let Some(world) = state.worlds.get_mut(&lsid) {
                world.peer_connected(events, Arc::new(peer));
            }
            return;
        }

        state.requested.entry(peer_id.clone()).or_default().insert(lsid);
        if let Err(e) = self.node.append_known_peer_der(root_cert_der, handshake_cert_der) {
            warn!(peer = %peer_id, error = %e, "introduced peer has invalid certificates");
            return;
        }
        match self.node.dial(&peer_id) {
            Ok(()) | Err(DialError::Registry(RegistryStatus::Redundant)) => {}
            Err(e) => debug!(peer = %peer_id, error = %e, "cannot dial introduced peer"),
        }
    }

    /// Drop a peer from every world it took part in.
    fn detach_peer(&self, state: &mut HostState, events: &mut AndEventQueue, peer_id: &str) {
        for lsid in state.participating.remove(peer_id).unwrap_or_default() {
            if let Some(world) = state.worlds.get_mut(&lsid) {
                world.peer_disconnected(events, peer_id);
                check_world(world);
            }
        }
    }

    async fn on_peer_connected(self: &Arc<Self>, peer: Peer) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut events = AndEventQueue::new();
        let id = peer.id().to_string();

        if let Some(old) = state.peers.remove(&id) {
            debug!(peer = %id, "replacing connection");
            self.detach_peer(state, &mut events, &id);
            old.close();
            self.emit(HostEvent::PeerDisconnected { peer_id: id.clone() }).await;
        }
        info!(peer = %id, addr = %peer.remote_addr(), "peer connected");
        state.peers.insert(id.clone(), peer.clone());
        self.emit(HostEvent::PeerConnected { peer: peer.clone() }).await;

        let peer_ref: PeerRef = Arc::new(peer.clone());
        for lsid in state.requested.remove(&id).unwrap_or_default() {
            if let Some(world) = state.worlds.get_mut(&lsid) {
                state.participating.entry(id.clone()).or_default().insert(lsid);
                world.peer_connected(&mut events, Arc::clone(&peer_ref));
                check_world(world);
            }
        }
        self.dispatch(state, events).await;
        drop(guard);

        self.peer_notify.notify_waiters();
        tokio::spawn(Arc::clone(self).serve_peer(peer));
    }

    async fn on_peer_gone(&self, peer: &Peer) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.is_current(peer) {
            return;
        }
        info!(peer = %peer.id(), "peer disconnected");
        state.peers.remove(peer.id());
        let mut events = AndEventQueue::new();
        self.detach_peer(state, &mut events, peer.id());
        self.dispatch(state, events).await;
        self.emit(HostEvent::PeerDisconnected { peer_id: peer.id().to_string() }).await;
    }

    async fn serve_peer(self: Arc<Self>, peer: Peer) {
        loop {
            let message = tokio::select! {
                message = peer.recv() => message,
                _ = self.cancel.cancelled() => break,
            };
            match message {
                Ok(message) => {
                    if !self.route(&peer, message).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer.id(), error = %e, "peer stream ended");
                    break;
                }
            }
        }
        peer.close();
        self.on_peer_gone(&peer).await;
    }

    /// Deliver one message. Returns false if the peer must be dropped.
    async fn route(&self, peer: &Peer, message: AhmpMessage) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.is_current(peer) {
            return false;
        }

        let target = match &message {
            AhmpMessage::AuPingTx(_) | AhmpMessage::AuPingRx(_) => {
                warn!(peer = %peer.id(), msg_type = ?message.msg_type(), "unsupported message");
                return false;
            }
            AhmpMessage::Jn(jn) => match state.exposed.get(&jn.path) {
                Some(lsid) => *lsid,
                None => {
                    debug!(peer = %peer.id(), path = %jn.path, "join for unexposed path");
                    let code = JoinCode::NotFound;
                    let _ = peer.send(AhmpMessage::Jdn(Jdn {
                        sender_session_id: Uuid::nil(),
                        recver_session_id: jn.sender_session_id,
                        code: code.code(),
                        message: code.message().to_string(),
                    }));
                    return true;
                }
            },
            other => {
                let recver = other.recver_session_id().unwrap_or_default();
                if state.worlds.contains_key(&recver) {
                    recver
                } else {
                    if !matches!(other, AhmpMessage::Jdn(_) | AhmpMessage::Rst(_))
                        && let Some(sender) = other.sender_session_id()
                    {
                        let code = JoinCode::InvalidStates;
                        let _ = peer.send(AhmpMessage::Rst(Rst {
                            sender_session_id: recver,
                            recver_session_id: sender,
                            code: code.code(),
                            message: code.message().to_string(),
                        }));
                    }
                    return true;
                }
            }
        };

        let Some(world) = state.worlds.get_mut(&target) else {
            return true;
        };
        let mut events = AndEventQueue::new();
        let peer_ref: PeerRef = Arc::new(peer.clone());
        if state
            .participating
            .entry(peer.id().to_string())
            .or_default()
            .insert(target)
        {
            world.peer_connected(&mut events, Arc::clone(&peer_ref));
        }

        match message {
            AhmpMessage::Jn(m) => world.on_jn(&mut events, &peer_ref, m.sender_session_id, m.timestamp),
            AhmpMessage::Jok(m) => world.on_jok(&mut events, &peer_ref, m),
            AhmpMessage::Jdn(m) => world.on_jdn(&mut events, peer.id(), m),
            AhmpMessage::Jni(m) => world.on_jni(&mut events, &peer_ref, m),
            AhmpMessage::Mem(m) => world.on_mem(&mut events, &peer_ref, m),
            AhmpMessage::Sjn(m) => world.on_sjn(&mut events, &peer_ref, m),
            AhmpMessage::Crr(m) => world.on_crr(&mut events, &peer_ref, m),
            AhmpMessage::Rst(m) => world.on_rst(&mut events, peer.id(), m),
            AhmpMessage::Soa(m) => world.on_soa(&mut events, &peer_ref, m),
            AhmpMessage::Sod(m) => world.on_sod(&mut events, &peer_ref, m),
            AhmpMessage::AuPingTx(_) | AhmpMessage::AuPingRx(_) => {}
        }
        check_world(world);
        self.dispatch(state, events).await;
        true
    }

    async fn run_accept(self: Arc<Self>) {
        while let Some(outcome) = self.node.accept().await {
            match outcome {
                Ok(peer) => self.on_peer_connected(peer).await,
                Err(e) => debug!(error = %e, "handshake failed"),
            }
        }
        debug!("accept loop stopped");
    }

    async fn run_timers(self: Arc<Self>) {
        while let Ok(lsid) = self.timers.wait(&self.cancel).await {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let mut events = AndEventQueue::new();
            if let Some(world) = state.worlds.get_mut(&lsid) {
                world.timer_expire(&mut events);
                check_world(world);
            }
            self.dispatch(state, events).await;
        }
        debug!("timer loop stopped");
    }

    async fn with_world<R>(
        &self,
        lsid: Uuid,
        f: impl FnOnce(&mut World, &mut AndEventQueue) -> R,
    ) -> Option<R> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let world = state.worlds.get_mut(&lsid)?;
        let mut events = AndEventQueue::new();
        let result = f(world, &mut events);
        check_world(world);
        self.dispatch(state, events).await;
        Some(result)
    }

    /// Connected peer `id`, dialing it if needed.
    async fn connect(&self, id: &str, cancel: &CancellationToken) -> Result<Peer> {
        let deadline = Instant::now() + JOIN_CONNECT_TIMEOUT;
        loop {
            let notified = self.peer_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(peer) = self.state.lock().await.peers.get(id).cloned() {
                return Ok(peer);
            }
            match self.node.dial(id) {
                Ok(()) | Err(DialError::Registry(RegistryStatus::Redundant)) => {}
                Err(e) => return Err(e).with_context(|| format!("cannot reach {}", id)),
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(JOIN_REDIAL_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => bail!("timed out connecting to {}", id),
                _ = cancel.cancelled() => bail!("join cancelled"),
                _ = self.cancel.cancelled() => bail!("host closed"),
            }
        }
    }
}

impl Host {
    /// Bind a host at `addr` and start its background tasks.
    pub async fn bind(addr: &str, root_key: &RootKey) -> Result<Self> {
        let node = Node::bind(addr, root_key).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(HostInner {
            node,
            state: Mutex::new(HostState::default()),
            timers: TimerQueue::new(),
            events_tx,
            events_rx: Mutex::new(events_rx),
            peer_notify: Notify::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&inner).run_accept());
        tokio::spawn(Arc::clone(&inner).run_timers());
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        self.inner.node.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.node.local_addr()
    }

    pub fn local_addr_candidates(&self) -> &[SocketAddr] {
        self.inner.node.local_addr_candidates()
    }

    pub fn root_cert_pem(&self) -> String {
        self.inner.node.root_secret().root_cert_pem()
    }

    pub fn root_cert_der(&self) -> Vec<u8> {
        self.inner.node.root_secret().root_cert_der()
    }

    pub fn handshake_cert_pem(&self) -> String {
        self.inner.node.root_secret().handshake_cert_pem()
    }

    pub fn handshake_cert_der(&self) -> Vec<u8> {
        self.inner.node.root_secret().handshake_cert_der()
    }

    pub fn aurl(&self, path: &str) -> Aurl {
        self.inner.node.aurl(path)
    }

    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    pub fn append_known_peer(&self, root_cert_pem: &str, handshake_cert_pem: &str) -> Result<bool> {
        self.inner.node.append_known_peer(root_cert_pem, handshake_cert_pem)
    }

    pub fn append_known_peer_der(&self, root_cert_der: &[u8], handshake_cert_der: &[u8]) -> Result<bool> {
        self.inner.node.append_known_peer_der(root_cert_der, handshake_cert_der)
    }

    pub fn erase_known_peer(&self, id: &str) -> bool {
        self.inner.node.erase_known_peer(id)
    }

    pub fn dial(&self, id: &str) -> Result<(), DialError> {
        self.inner.node.dial(id)
    }

    /// Next application event. `None` once the host is closed.
    pub async fn next_event(&self) -> Option<HostEvent> {
        let mut rx = self.inner.events_rx.lock().await;
        tokio::select! {
            event = rx.recv() => event,
            _ = self.inner.cancel.cancelled() => None,
        }
    }

    // ------------------------------------------------------------------------
    // Worlds
    // ------------------------------------------------------------------------

    /// Open a world hosted here. Emits `WorldEnter`.
    pub async fn open_world(&self, url: &str) -> Uuid {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let mut events = AndEventQueue::new();
        let world = World::open(self.id(), url, &mut events);
        let lsid = world.lsid();
        info!(world = %lsid, %url, "opened world");
        state.worlds.insert(lsid, world);
        self.inner.dispatch(state, events).await;
        lsid
    }

    /// Join the world exposed at `aurl`.
    ///
    /// Returns once the JN is sent; the outcome arrives as `WorldEnter` or
    /// `JoinFail`. Cancelling `cancel` while the world is still joining
    /// leaves it.
    pub async fn join_world(&self, aurl: &Aurl, cancel: &CancellationToken) -> Result<Uuid> {
        if aurl.scheme != Scheme::Abyss {
            bail!("cannot join a {} url", aurl.scheme.as_str());
        }
        if aurl.id == self.id() {
            bail!("cannot join a world on this host");
        }

        let peer = self.inner.connect(&aurl.id, cancel).await?;

        let settled = CancellationToken::new();
        let lsid = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            if !state.is_current(&peer) {
                bail!("peer {} disconnected before join", aurl.id);
            }
            let world = World::join(self.id(), Arc::new(peer.clone()), &aurl.path)
                .context("failed to send join request")?;
            let lsid = world.lsid();
            state.worlds.insert(lsid, world);
            state.participating.entry(aurl.id.clone()).or_default().insert(lsid);
            state.pending_joins.insert(lsid, settled.clone());
            lsid
        };
        info!(world = %lsid, peer = %aurl.id, path = %aurl.path, "joining world");

        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = settled.cancelled() => return,
                _ = inner.cancel.cancelled() => return,
            }
            inner
                .with_world(lsid, |world, events| {
                    if world.lifecycle() == Lifecycle::Joining {
                        world.close(events);
                    }
                })
                .await;
        });

        Ok(lsid)
    }

    pub async fn accept_session(&self, lsid: Uuid, session: &PeerSession) -> bool {
        self.inner
            .with_world(lsid, |world, events| world.accept_session(events, session))
            .await
            .is_some()
    }

    pub async fn decline_session(&self, lsid: Uuid, session: &PeerSession, code: u32, message: &str) -> bool {
        self.inner
            .with_world(lsid, |world, events| world.decline_session(events, session, code, message))
            .await
            .is_some()
    }

    /// Leave a world. Unknown or already closed worlds are ignored.
    pub async fn leave_world(&self, lsid: Uuid) {
        self.inner.with_world(lsid, |world, events| world.close(events)).await;
    }

    /// Accept joins for `lsid` at `path`, replacing any earlier path.
    pub async fn expose_world(&self, lsid: Uuid, path: &str) -> Result<()> {
        if !path.starts_with('/') {
            bail!("world path must start with '/'");
        }
        let mut state = self.inner.state.lock().await;
        if !state.worlds.contains_key(&lsid) {
            bail!("unknown world {}", lsid);
        }
        if state.exposed.get(path).is_some_and(|other| *other != lsid) {
            bail!("path {} is exposed by another world", path);
        }
        if let Some(previous) = state.world_paths.insert(lsid, path.to_string()) {
            state.exposed.remove(&previous);
        }
        state.exposed.insert(path.to_string(), lsid);
        debug!(world = %lsid, %path, "world exposed");
        Ok(())
    }

    pub async fn hide_world(&self, lsid: Uuid) {
        let mut state = self.inner.state.lock().await;
        if let Some(path) = state.world_paths.remove(&lsid) {
            state.exposed.remove(&path);
        }
    }

    /// Share objects with one member session.
    pub async fn object_append(&self, lsid: Uuid, session: &PeerSession, objects: Vec<ObjectInfo>) -> bool {
        let state = self.inner.state.lock().await;
        state
            .worlds
            .get(&lsid)
            .is_some_and(|world| world.send_object_append(session, objects))
    }

    pub async fn object_delete(&self, lsid: Uuid, session: &PeerSession, object_ids: Vec<Uuid>) -> bool {
        let state = self.inner.state.lock().await;
        state
            .worlds
            .get(&lsid)
            .is_some_and(|world| world.send_object_delete(session, object_ids))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn world_members(&self, lsid: Uuid) -> Option<Vec<MemberSnapshot>> {
        self.inner.state.lock().await.worlds.get(&lsid).map(World::snapshot)
    }

    pub async fn world_ids(&self) -> Vec<Uuid> {
        self.inner.state.lock().await.worlds.keys().copied().collect()
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().await.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.inner.node.connection_count()
    }

    /// Stop all tasks and close every connection. Idempotent.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.node.close();
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.close();
    }
}
