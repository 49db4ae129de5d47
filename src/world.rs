//! # AND World State Machine
//!
//! AND (Abyss Neighbor Discovery) keeps every participant of a world
//! connected to every other participant. A [`World`] is one local session in
//! one world; it tracks one [`Entry`] per remote peer and reacts to AHMP
//! messages, connection changes, application decisions and timer ticks.
//!
//! Worlds are synchronous and never block. Outgoing messages go straight to
//! the peer's send queue; everything else is appended to an
//! [`AndEventQueue`] for the host to act on.
//!
//! ## Entry States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Cc` | connected, no session known yet |
//! | `DcJni` | told about a session, peer not connected yet |
//! | `Jn` | peer asked to join through us |
//! | `Jni` | told about a session, connected, awaiting app decision |
//! | `RmemNjni` | received MEM before any JNI about it |
//! | `Rmem` | received MEM, awaiting app decision |
//! | `Tmem` | sent MEM, awaiting theirs |
//! | `Mem` | full member both ways |
//!
//! ## Joining
//!
//! ```text
//!  joiner                 target                 member
//!    | ------- JN ---------> |                       |
//!    |                       | (app accepts)         |
//!    | <------ JOK --------- | ------- JNI --------> |
//!    | <--------------- connect + MEM -------------> |
//! ```
//!
//! Members gossip their member lists (SJN) on a randomized timer and answer
//! with corrections (CRR) so that missed introductions heal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::events::{AndEvent, AndEventQueue, JoinCode, PeerSession};
use crate::identity::now_ms;
use crate::messages::{
    AhmpMessage, Jdn, Jn, Jni, Jok, Mem, MemberList, ObjectInfo, PeerSessionInfo, Rst, SessionRef,
    Soa, Sod,
};
use crate::peer::Peer;

/// Delay before the first gossip tick of a world.
pub const INITIAL_TIMER: Duration = Duration::from_millis(500);

/// Base of the randomized gossip interval.
pub const TIMER_BASE_MS: u64 = 300;

/// Members younger than this are not announced in SJN.
pub const SJN_MIN_AGE_MS: u64 = 1000;

/// Members are announced while their SJN count is at most this.
pub const SJN_MAX_COUNT: u32 = 3;

// ============================================================================
// Peers as seen by a world
// ============================================================================

/// What a world needs from a connected peer.
pub trait WorldPeer: Send + Sync {
    fn peer_id(&self) -> &str;

    fn send(&self, message: AhmpMessage) -> anyhow::Result<()>;

    /// Introduction record for this peer's session `session_id`.
    fn session_info(&self, session_id: Uuid, timestamp: u64) -> PeerSessionInfo;
}

pub type PeerRef = Arc<dyn WorldPeer>;

impl WorldPeer for Peer {
    fn peer_id(&self) -> &str {
        self.id()
    }

    fn send(&self, message: AhmpMessage) -> anyhow::Result<()> {
        Peer::send(self, message)
    }

    fn session_info(&self, session_id: Uuid, timestamp: u64) -> PeerSessionInfo {
        let identity = self.identity();
        PeerSessionInfo {
            peer_id: identity.id().to_string(),
            address_candidates: identity.address_candidates().to_vec(),
            session_id,
            timestamp,
            root_cert_der: identity.root_cert_der().to_vec(),
            handshake_cert_der: identity.handshake_cert_der().to_vec(),
        }
    }
}

fn deliver(peer: &PeerRef, message: AhmpMessage) {
    let msg_type = message.msg_type();
    if let Err(e) = peer.send(message) {
        debug!(peer = %peer.peer_id(), ?msg_type, error = %e, "failed to send ahmp message");
    }
}

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    Cc,
    DcJni,
    Jn,
    Jni,
    RmemNjni,
    Rmem,
    Tmem,
    Mem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Joining,
    Working,
    Closed,
}

struct Entry {
    peer: Option<PeerRef>,
    session_id: Option<Uuid>,
    timestamp: u64,
    state: EntryState,
    /// Already known by our join target; skipped in SJN.
    sjnp: bool,
    sjnc: u32,
    is_session_requested: bool,
}

impl Entry {
    fn connected(peer: PeerRef) -> Self {
        Self {
            peer: Some(peer),
            session_id: None,
            timestamp: 0,
            state: EntryState::Cc,
            sjnp: false,
            sjnc: 0,
            is_session_requested: false,
        }
    }

    fn session(&self, peer_id: &str) -> Option<PeerSession> {
        Some(PeerSession { peer_id: peer_id.to_string(), session_id: self.session_id? })
    }
}

/// Read-only view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub peer_id: String,
    pub session_id: Option<Uuid>,
    pub state: EntryState,
    pub is_session_requested: bool,
}

// ============================================================================
// World
// ============================================================================

pub struct World {
    local_id: String,
    lsid: Uuid,
    timestamp: u64,
    lifecycle: Lifecycle,
    join_target: Option<PeerRef>,
    join_path: String,
    url: String,
    entries: HashMap<String, Entry>,
}

fn rst(lsid: Uuid, recver: Uuid, code: u32, message: &str) -> AhmpMessage {
    AhmpMessage::Rst(Rst {
        sender_session_id: lsid,
        recver_session_id: recver,
        code,
        message: message.to_string(),
    })
}

fn jdn(lsid: Uuid, recver: Uuid, code: u32, message: &str) -> AhmpMessage {
    AhmpMessage::Jdn(Jdn {
        sender_session_id: lsid,
        recver_session_id: recver,
        code,
        message: message.to_string(),
    })
}

impl World {
    /// Open a new world hosted locally.
    pub fn open(local_id: &str, url: &str, events: &mut AndEventQueue) -> Self {
        let world = Self::new(local_id, Lifecycle::Working, None, String::new(), url.to_string());
        events.push(world.lsid, AndEvent::WorldEnter { url: url.to_string() });
        events.push(world.lsid, AndEvent::TimerRequest { duration: INITIAL_TIMER });
        world
    }

    /// Start joining the world exposed at `path` on `target`.
    pub fn join(local_id: &str, target: PeerRef, path: &str) -> anyhow::Result<Self> {
        let world = Self::new(local_id, Lifecycle::Joining, Some(Arc::clone(&target)), path.to_string(), String::new());
        target.send(AhmpMessage::Jn(Jn {
            sender_session_id: world.lsid,
            path: path.to_string(),
            timestamp: world.timestamp,
        }))?;
        Ok(world)
    }

    fn new(
        local_id: &str,
        lifecycle: Lifecycle,
        join_target: Option<PeerRef>,
        join_path: String,
        url: String,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            lsid: Uuid::new_v4(),
            timestamp: now_ms(),
            lifecycle,
            join_target,
            join_path,
            url,
            entries: HashMap::new(),
        }
    }

    /// Local session id.
    pub fn lsid(&self) -> Uuid {
        self.lsid
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    pub fn join_path(&self) -> &str {
        &self.join_path
    }

    pub fn join_target_id(&self) -> Option<&str> {
        self.join_target.as_ref().map(|t| t.peer_id())
    }

    pub fn member_count(&self) -> usize {
        self.entries.values().filter(|e| e.state == EntryState::Mem).count()
    }

    /// Sessions in `Mem` state.
    pub fn members(&self) -> Vec<PeerSession> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Mem)
            .filter_map(|(id, e)| e.session(id))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<MemberSnapshot> {
        let mut entries: Vec<MemberSnapshot> = self
            .entries
            .iter()
            .map(|(id, e)| MemberSnapshot {
                peer_id: id.clone(),
                session_id: e.session_id,
                state: e.state,
                is_session_requested: e.is_session_requested,
            })
            .collect();
        entries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        entries
    }

    fn is_join_target(&self, peer_id: &str) -> bool {
        self.lifecycle == Lifecycle::Joining && self.join_target_id() == Some(peer_id)
    }

    fn request_session(&mut self, events: &mut AndEventQueue, peer_id: &str) {
        let lsid = self.lsid;
        if let Some(entry) = self.entries.get_mut(peer_id)
            && let Some(session) = entry.session(peer_id)
        {
            entry.is_session_requested = true;
            events.push(lsid, AndEvent::SessionRequest(session));
        }
    }

    // ------------------------------------------------------------------------
    // Entry removal and replacement
    // ------------------------------------------------------------------------

    /// Drop an entry, telling the peer why.
    fn remove_entry(&mut self, events: &mut AndEventQueue, peer_id: &str, code: u32, message: &str) {
        let Some(entry) = self.entries.get(peer_id) else {
            return;
        };
        if let (Some(peer), Some(session_id)) = (&entry.peer, entry.session_id) {
            let notice = match entry.state {
                EntryState::Jn => jdn(self.lsid, session_id, code, message),
                _ => rst(self.lsid, session_id, code, message),
            };
            deliver(peer, notice);
        }
        self.remove_entry_silent(events, peer_id, true);
    }

    fn remove_entry_silent(&mut self, events: &mut AndEventQueue, peer_id: &str, discard_peer: bool) {
        let Some(entry) = self.entries.remove(peer_id) else {
            return;
        };
        if entry.is_session_requested
            && let Some(session) = entry.session(peer_id)
        {
            events.push(self.lsid, AndEvent::SessionClose(session));
        }
        if discard_peer && entry.peer.is_some() {
            events.push(self.lsid, AndEvent::PeerDiscard { peer_id: peer_id.to_string() });
        }
    }

    /// Replace the entry's session with a strictly newer one.
    ///
    /// The old session is reset on the remote side and closed locally.
    /// Returns false, changing nothing, if `timestamp` is not newer.
    fn try_overwrite_session(
        &mut self,
        events: &mut AndEventQueue,
        peer_id: &str,
        session_id: Uuid,
        timestamp: u64,
    ) -> bool {
        let lsid = self.lsid;
        let Some(entry) = self.entries.get_mut(peer_id) else {
            return false;
        };
        if timestamp <= entry.timestamp {
            return false;
        }

        let code = JoinCode::Expired;
        if let (Some(peer), Some(old)) = (&entry.peer, entry.session_id) {
            let notice = match entry.state {
                EntryState::Jn => jdn(lsid, old, code.code(), code.message()),
                _ => rst(lsid, old, code.code(), code.message()),
            };
            deliver(peer, notice);
        }
        if entry.is_session_requested
            && let Some(session) = entry.session(peer_id)
        {
            events.push(lsid, AndEvent::SessionClose(session));
        }

        entry.session_id = Some(session_id);
        entry.timestamp = timestamp;
        entry.sjnp = false;
        entry.sjnc = 0;
        entry.is_session_requested = false;
        true
    }

    /// Gate for messages only members may send. Misbehaving senders are
    /// reset or dropped.
    fn must_be_member(&mut self, events: &mut AndEventQueue, peer: &PeerRef, sender: Uuid) -> bool {
        let code = JoinCode::InvalidStates;
        match self.entries.get(peer.peer_id()) {
            None => {
                deliver(peer, rst(self.lsid, sender, code.code(), code.message()));
                false
            }
            Some(entry) if entry.session_id != Some(sender) => {
                let code = JoinCode::Expired;
                deliver(peer, rst(self.lsid, sender, code.code(), code.message()));
                false
            }
            Some(entry) if entry.state != EntryState::Mem => {
                self.remove_entry(events, peer.peer_id(), code.code(), code.message());
                false
            }
            Some(_) => true,
        }
    }

    /// Reset every session and forget all entries.
    fn shutdown(&mut self, events: &mut AndEventQueue, code: JoinCode) {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            if let Some(entry) = self.entries.get(&id)
                && let (Some(peer), Some(session_id)) = (&entry.peer, entry.session_id)
            {
                let notice = match entry.state {
                    EntryState::Jn => jdn(self.lsid, session_id, code.code(), code.message()),
                    _ => rst(self.lsid, session_id, code.code(), code.message()),
                };
                deliver(peer, notice);
            }
            self.remove_entry_silent(events, &id, false);
        }
        self.join_target = None;
        self.lifecycle = Lifecycle::Closed;
    }

    fn fail_join(&mut self, events: &mut AndEventQueue, code: u32, message: &str) {
        self.shutdown(events, JoinCode::InvalidStates);
        events.push(self.lsid, AndEvent::JoinFail { code, message: message.to_string() });
        events.push(self.lsid, AndEvent::WorldLeave { code, message: message.to_string() });
    }

    // ------------------------------------------------------------------------
    // Connection events
    // ------------------------------------------------------------------------

    pub fn peer_connected(&mut self, events: &mut AndEventQueue, peer: PeerRef) {
        if self.is_closed() || self.join_target_id() == Some(peer.peer_id()) {
            return;
        }
        let id = peer.peer_id().to_string();
        match self.entries.get_mut(&id) {
            Some(entry) if entry.state == EntryState::DcJni => {
                entry.peer = Some(peer);
                entry.state = EntryState::Jni;
                self.request_session(events, &id);
            }
            Some(entry) => {
                trace!(peer = %id, state = ?entry.state, "peer already tracked");
                if entry.peer.is_none() {
                    entry.peer = Some(peer);
                }
            }
            None => {
                // also while joining: the JOK introduction may arrive after this peer
                self.entries.insert(id, Entry::connected(peer));
            }
        }
    }

    pub fn peer_disconnected(&mut self, events: &mut AndEventQueue, peer_id: &str) {
        if self.is_closed() {
            return;
        }
        if self.is_join_target(peer_id) {
            let code = JoinCode::Closed;
            self.fail_join(events, code.code(), code.message());
            return;
        }
        if self.entries.get(peer_id).is_some_and(|e| e.peer.is_some()) {
            self.remove_entry_silent(events, peer_id, false);
        }
    }

    // ------------------------------------------------------------------------
    // AHMP handlers
    // ------------------------------------------------------------------------

    pub fn on_jn(&mut self, events: &mut AndEventQueue, peer: &PeerRef, sender: Uuid, timestamp: u64) {
        match self.lifecycle {
            Lifecycle::Closed => return,
            Lifecycle::Joining => {
                let code = JoinCode::InvalidStates;
                deliver(peer, jdn(self.lsid, sender, code.code(), code.message()));
                return;
            }
            Lifecycle::Working => {}
        }

        let id = peer.peer_id().to_string();
        let entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| Entry::connected(Arc::clone(peer)));
        if entry.peer.is_none() {
            entry.peer = Some(Arc::clone(peer));
        }
        let current = entry.timestamp;

        if timestamp > current {
            self.try_overwrite_session(events, &id, sender, timestamp);
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = EntryState::Jn;
            }
            self.request_session(events, &id);
        } else {
            let code = if timestamp == current { JoinCode::Collision } else { JoinCode::Duplicate };
            deliver(peer, jdn(self.lsid, sender, code.code(), code.message()));
        }
    }

    pub fn on_jok(&mut self, events: &mut AndEventQueue, peer: &PeerRef, jok: Jok) {
        let code = JoinCode::InvalidStates;
        match self.lifecycle {
            Lifecycle::Closed => {}
            Lifecycle::Joining if self.is_join_target(peer.peer_id()) => {
                let id = peer.peer_id().to_string();
                self.join_target = None;
                self.lifecycle = Lifecycle::Working;
                self.url = jok.url.clone();

                let mut entry = Entry::connected(Arc::clone(peer));
                entry.session_id = Some(jok.sender_session_id);
                entry.timestamp = jok.timestamp;
                entry.state = EntryState::Rmem;
                entry.sjnp = true;
                self.entries.insert(id.clone(), entry);

                events.push(self.lsid, AndEvent::WorldEnter { url: jok.url });
                self.request_session(events, &id);
                events.push(self.lsid, AndEvent::TimerRequest { duration: INITIAL_TIMER });

                for neighbor in jok.neighbors {
                    if neighbor.peer_id != id {
                        self.jni_mems(events, neighbor);
                    }
                }
            }
            Lifecycle::Joining => {
                deliver(peer, rst(self.lsid, jok.sender_session_id, code.code(), code.message()));
            }
            Lifecycle::Working => {
                let known = self
                    .entries
                    .get(peer.peer_id())
                    .is_some_and(|e| e.session_id == Some(jok.sender_session_id));
                if known {
                    self.remove_entry(events, peer.peer_id(), code.code(), code.message());
                } else {
                    deliver(peer, rst(self.lsid, jok.sender_session_id, code.code(), code.message()));
                }
            }
        }
    }

    pub fn on_jdn(&mut self, events: &mut AndEventQueue, peer_id: &str, jdn: Jdn) {
        match self.lifecycle {
            Lifecycle::Joining if self.is_join_target(peer_id) => {
                self.fail_join(events, jdn.code, &jdn.message);
            }
            Lifecycle::Working => {
                let matches = self
                    .entries
                    .get(peer_id)
                    .is_some_and(|e| e.session_id == Some(jdn.sender_session_id));
                if matches {
                    let code = JoinCode::InvalidStates;
                    self.remove_entry(events, peer_id, code.code(), code.message());
                }
            }
            _ => {}
        }
    }

    pub fn on_jni(&mut self, events: &mut AndEventQueue, peer: &PeerRef, jni: Jni) {
        if self.lifecycle != Lifecycle::Working {
            if self.lifecycle == Lifecycle::Joining {
                let code = JoinCode::InvalidStates;
                deliver(peer, rst(self.lsid, jni.sender_session_id, code.code(), code.message()));
            }
            return;
        }
        if !self.must_be_member(events, peer, jni.sender_session_id) {
            return;
        }
        if jni.joiner.peer_id != peer.peer_id() {
            self.jni_mems(events, jni.joiner);
        }
    }

    /// Act on an introduction to another session in this world.
    fn jni_mems(&mut self, events: &mut AndEventQueue, info: PeerSessionInfo) {
        if info.peer_id == self.local_id {
            return;
        }
        let lsid = self.lsid;
        let id = info.peer_id.clone();
        let peer_request = |info: PeerSessionInfo| AndEvent::PeerRequest {
            peer_id: info.peer_id,
            address_candidates: info.address_candidates,
            root_cert_der: info.root_cert_der,
            handshake_cert_der: info.handshake_cert_der,
        };

        let Some(entry) = self.entries.get_mut(&id) else {
            self.entries.insert(
                id,
                Entry {
                    peer: None,
                    session_id: Some(info.session_id),
                    timestamp: info.timestamp,
                    state: EntryState::DcJni,
                    sjnp: false,
                    sjnc: 0,
                    is_session_requested: false,
                },
            );
            events.push(lsid, peer_request(info));
            return;
        };

        match entry.state {
            EntryState::DcJni => {
                if info.timestamp > entry.timestamp {
                    entry.session_id = Some(info.session_id);
                    entry.timestamp = info.timestamp;
                    events.push(lsid, peer_request(info));
                }
            }
            EntryState::Cc => {
                entry.session_id = Some(info.session_id);
                entry.timestamp = info.timestamp;
                entry.state = EntryState::Jni;
                self.request_session(events, &id);
            }
            EntryState::RmemNjni if entry.session_id == Some(info.session_id) => {
                entry.state = EntryState::Rmem;
                self.request_session(events, &id);
            }
            _ => {
                if self.try_overwrite_session(events, &id, info.session_id, info.timestamp)
                    && let Some(entry) = self.entries.get_mut(&id)
                {
                    entry.state = EntryState::Jni;
                    self.request_session(events, &id);
                }
            }
        }
    }

    pub fn on_mem(&mut self, events: &mut AndEventQueue, peer: &PeerRef, mem: Mem) {
        match self.lifecycle {
            Lifecycle::Closed => return,
            Lifecycle::Joining if self.is_join_target(peer.peer_id()) => {
                let code = JoinCode::InvalidStates;
                self.fail_join(events, code.code(), code.message());
                return;
            }
            _ => {}
        }

        // a joining world keeps early MEMs as RmemNjni until the JOK names the sender
        let id = peer.peer_id().to_string();
        let entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| Entry::connected(Arc::clone(peer)));
        if entry.peer.is_none() {
            entry.peer = Some(Arc::clone(peer));
        }

        if entry.session_id != Some(mem.sender_session_id) {
            if self.try_overwrite_session(events, &id, mem.sender_session_id, mem.timestamp) {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.state = EntryState::RmemNjni;
                }
            } else {
                let code = JoinCode::Expired;
                deliver(peer, rst(self.lsid, mem.sender_session_id, code.code(), code.message()));
            }
            return;
        }

        match entry.state {
            EntryState::Jni => entry.state = EntryState::Rmem,
            EntryState::DcJni => {
                entry.state = EntryState::Rmem;
                self.request_session(events, &id);
            }
            EntryState::Tmem => {
                entry.state = EntryState::Mem;
                if let Some(session) = entry.session(&id) {
                    events.push(self.lsid, AndEvent::SessionReady(session));
                }
            }
            EntryState::Cc
            | EntryState::Jn
            | EntryState::RmemNjni
            | EntryState::Rmem
            | EntryState::Mem => {
                let code = JoinCode::InvalidStates;
                self.remove_entry(events, &id, code.code(), code.message());
            }
        }
    }

    pub fn on_sjn(&mut self, events: &mut AndEventQueue, peer: &PeerRef, sjn: MemberList) {
        if self.lifecycle != Lifecycle::Working
            || !self.must_be_member(events, peer, sjn.sender_session_id)
        {
            return;
        }

        let mut unknown = Vec::new();
        for member in sjn.members {
            if member.peer_id == self.local_id {
                continue;
            }
            match self.entries.get_mut(&member.peer_id) {
                Some(entry) if entry.session_id == Some(member.session_id) => match entry.state {
                    EntryState::DcJni | EntryState::Cc | EntryState::RmemNjni => unknown.push(member),
                    EntryState::Mem => entry.sjnc += 1,
                    _ => {}
                },
                _ => unknown.push(member),
            }
        }

        if !unknown.is_empty() {
            deliver(
                peer,
                AhmpMessage::Crr(MemberList {
                    sender_session_id: self.lsid,
                    recver_session_id: sjn.sender_session_id,
                    members: unknown,
                }),
            );
        }
    }

    pub fn on_crr(&mut self, events: &mut AndEventQueue, peer: &PeerRef, crr: MemberList) {
        if self.lifecycle != Lifecycle::Working
            || !self.must_be_member(events, peer, crr.sender_session_id)
        {
            return;
        }
        let Some(sender_timestamp) = self.entries.get(peer.peer_id()).map(|e| e.timestamp) else {
            return;
        };
        let sender_info = peer.session_info(crr.sender_session_id, sender_timestamp);

        for member in crr.members {
            if member.peer_id == self.local_id || member.peer_id == peer.peer_id() {
                continue;
            }
            let Some(entry) = self.entries.get(&member.peer_id) else {
                continue;
            };
            if entry.state != EntryState::Mem || entry.session_id != Some(member.session_id) {
                continue;
            }
            let Some(member_peer) = &entry.peer else {
                continue;
            };
            deliver(
                peer,
                AhmpMessage::Jni(Jni {
                    sender_session_id: self.lsid,
                    recver_session_id: crr.sender_session_id,
                    joiner: member_peer.session_info(member.session_id, entry.timestamp),
                }),
            );
            deliver(
                member_peer,
                AhmpMessage::Jni(Jni {
                    sender_session_id: self.lsid,
                    recver_session_id: member.session_id,
                    joiner: sender_info.clone(),
                }),
            );
        }
    }

    pub fn on_soa(&mut self, events: &mut AndEventQueue, peer: &PeerRef, soa: Soa) {
        if self.lifecycle != Lifecycle::Working
            || !self.must_be_member(events, peer, soa.sender_session_id)
        {
            return;
        }
        let session = PeerSession { peer_id: peer.peer_id().to_string(), session_id: soa.sender_session_id };
        events.push(self.lsid, AndEvent::ObjectAppend { session, objects: soa.objects });
    }

    pub fn on_sod(&mut self, events: &mut AndEventQueue, peer: &PeerRef, sod: Sod) {
        if self.lifecycle != Lifecycle::Working
            || !self.must_be_member(events, peer, sod.sender_session_id)
        {
            return;
        }
        let session = PeerSession { peer_id: peer.peer_id().to_string(), session_id: sod.sender_session_id };
        events.push(self.lsid, AndEvent::ObjectDelete { session, object_ids: sod.object_ids });
    }

    pub fn on_rst(&mut self, events: &mut AndEventQueue, peer_id: &str, rst: Rst) {
        match self.lifecycle {
            Lifecycle::Joining if self.is_join_target(peer_id) => {
                self.fail_join(events, rst.code, &rst.message);
            }
            Lifecycle::Closed => {}
            _ => {
                if self
                    .entries
                    .get(peer_id)
                    .is_some_and(|e| e.session_id == Some(rst.sender_session_id))
                {
                    self.remove_entry_silent(events, peer_id, true);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Application decisions
    // ------------------------------------------------------------------------

    pub fn accept_session(&mut self, events: &mut AndEventQueue, session: &PeerSession) {
        if self.lifecycle != Lifecycle::Working {
            return;
        }
        let Some(entry) = self.entries.get(&session.peer_id) else {
            return;
        };
        if entry.session_id != Some(session.session_id) {
            return;
        }
        let Some(peer) = entry.peer.clone() else {
            return;
        };
        let mem = AhmpMessage::Mem(Mem {
            sender_session_id: self.lsid,
            recver_session_id: session.session_id,
            timestamp: self.timestamp,
        });

        let state = entry.state;
        match state {
            EntryState::Jn => {
                let members: Vec<(PeerRef, Uuid, u64)> = self
                    .entries
                    .iter()
                    .filter(|(id, e)| e.state == EntryState::Mem && **id != session.peer_id)
                    .filter_map(|(_, e)| Some((e.peer.clone()?, e.session_id?, e.timestamp)))
                    .collect();
                let joiner = peer.session_info(session.session_id, entry.timestamp);

                deliver(
                    &peer,
                    AhmpMessage::Jok(Jok {
                        sender_session_id: self.lsid,
                        recver_session_id: session.session_id,
                        timestamp: self.timestamp,
                        url: self.url.clone(),
                        neighbors: members
                            .iter()
                            .map(|(p, sid, ts)| p.session_info(*sid, *ts))
                            .collect(),
                    }),
                );
                for (member, member_session, _) in &members {
                    deliver(
                        member,
                        AhmpMessage::Jni(Jni {
                            sender_session_id: self.lsid,
                            recver_session_id: *member_session,
                            joiner: joiner.clone(),
                        }),
                    );
                }
                self.set_state(&session.peer_id, EntryState::Tmem);
            }
            EntryState::Jni => {
                deliver(&peer, mem);
                self.set_state(&session.peer_id, EntryState::Tmem);
            }
            EntryState::Rmem => {
                deliver(&peer, mem);
                self.set_state(&session.peer_id, EntryState::Mem);
                events.push(self.lsid, AndEvent::SessionReady(session.clone()));
            }
            _ => {}
        }
    }

    pub fn decline_session(
        &mut self,
        events: &mut AndEventQueue,
        session: &PeerSession,
        code: u32,
        message: &str,
    ) {
        let pending = self.entries.get(&session.peer_id).is_some_and(|e| {
            e.session_id == Some(session.session_id)
                && matches!(e.state, EntryState::Jn | EntryState::Jni | EntryState::Rmem)
        });
        if pending {
            self.remove_entry(events, &session.peer_id, code, message);
        }
    }

    fn set_state(&mut self, peer_id: &str, state: EntryState) {
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.state = state;
        }
    }

    /// Leave the world. Idempotent.
    pub fn close(&mut self, events: &mut AndEventQueue) {
        match self.lifecycle {
            Lifecycle::Closed => {}
            Lifecycle::Joining => {
                let code = JoinCode::Canceled;
                self.shutdown(events, code);
                events.push(self.lsid, AndEvent::join_fail(code));
                events.push(self.lsid, AndEvent::world_leave(code));
            }
            Lifecycle::Working => {
                let code = JoinCode::Closed;
                self.shutdown(events, code);
                events.push(self.lsid, AndEvent::world_leave(code));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------------

    fn member_peer(&self, session: &PeerSession) -> Option<&PeerRef> {
        let entry = self.entries.get(&session.peer_id)?;
        if entry.state != EntryState::Mem || entry.session_id != Some(session.session_id) {
            return None;
        }
        entry.peer.as_ref()
    }

    /// Share objects with one member. Returns false if `session` is not a member.
    pub fn send_object_append(&self, session: &PeerSession, objects: Vec<ObjectInfo>) -> bool {
        let Some(peer) = self.member_peer(session) else {
            return false;
        };
        deliver(
            peer,
            AhmpMessage::Soa(Soa {
                sender_session_id: self.lsid,
                recver_session_id: session.session_id,
                objects,
            }),
        );
        true
    }

    pub fn send_object_delete(&self, session: &PeerSession, object_ids: Vec<Uuid>) -> bool {
        let Some(peer) = self.member_peer(session) else {
            return false;
        };
        deliver(
            peer,
            AhmpMessage::Sod(Sod {
                sender_session_id: self.lsid,
                recver_session_id: session.session_id,
                object_ids,
            }),
        );
        true
    }

    // ------------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------------

    /// Gossip tick: announce settled members and schedule the next tick.
    pub fn timer_expire(&mut self, events: &mut AndEventQueue) {
        if self.lifecycle != Lifecycle::Working {
            return;
        }

        let now = now_ms();
        let mut announced = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if entry.state == EntryState::Mem
                && now.saturating_sub(entry.timestamp) >= SJN_MIN_AGE_MS
                && !entry.sjnp
                && entry.sjnc <= SJN_MAX_COUNT
                && let Some(session_id) = entry.session_id
            {
                entry.sjnc += 1;
                announced.push(SessionRef { peer_id: id.clone(), session_id });
            }
        }

        if !announced.is_empty() {
            for entry in self.entries.values().filter(|e| e.state == EntryState::Mem) {
                if let (Some(peer), Some(session_id)) = (&entry.peer, entry.session_id) {
                    deliver(
                        peer,
                        AhmpMessage::Sjn(MemberList {
                            sender_session_id: self.lsid,
                            recver_session_id: session_id,
                            members: announced.clone(),
                        }),
                    );
                }
            }
        }

        let spread = TIMER_BASE_MS * (self.member_count() as u64 + 1);
        let jitter = rand::thread_rng().gen_range(0..spread);
        events.push(
            self.lsid,
            AndEvent::TimerRequest { duration: Duration::from_millis(TIMER_BASE_MS + jitter) },
        );
    }

    // ------------------------------------------------------------------------
    // Sanity
    // ------------------------------------------------------------------------

    /// Check the per-state entry invariants.
    pub fn check_sanity(&self) -> Result<(), String> {
        match self.lifecycle {
            Lifecycle::Closed => {
                if !self.entries.is_empty() || self.join_target.is_some() {
                    return Err("closed world still holds entries".into());
                }
                return Ok(());
            }
            Lifecycle::Joining => {
                if self.join_target.is_none() {
                    return Err("joining world without join target".into());
                }
            }
            Lifecycle::Working => {
                if self.join_target.is_some() {
                    return Err("working world still has a join target".into());
                }
            }
        }

        for (id, entry) in &self.entries {
            if let Some(peer) = &entry.peer
                && peer.peer_id() != id
            {
                return Err(format!("entry {} holds peer {}", id, peer.peer_id()));
            }
            let has_peer = entry.peer.is_some();
            let has_session = entry.session_id.is_some();
            let requested = entry.is_session_requested;
            let ok = match entry.state {
                EntryState::Cc => has_peer && !has_session && !requested,
                EntryState::DcJni => !has_peer && has_session && !requested,
                EntryState::RmemNjni => has_peer && has_session && !requested,
                EntryState::Jn | EntryState::Jni | EntryState::Rmem | EntryState::Tmem | EntryState::Mem => {
                    has_peer && has_session && requested
                }
            };
            if !ok {
                return Err(format!("entry {} inconsistent in {:?}", id, entry.state));
            }
            if self.lifecycle == Lifecycle::Joining
                && !matches!(entry.state, EntryState::Cc | EntryState::RmemNjni)
            {
                return Err(format!("joining world holds {:?} entry {}", entry.state, id));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("lsid", &self.lsid)
            .field("lifecycle", &self.lifecycle)
            .field("url", &self.url)
            .field("entries", &self.entries.len())
            .finish()
    }
}
