//! # Peer Registry
//!
//! Bookkeeping shared by the dialer and acceptor sides of the handshake.
//!
//! | Map | Key | Value |
//! |-----|-----|-------|
//! | known | peer id | latest verified [`PeerIdentity`] |
//! | dialed | peer id | issue time + IPs with a dial in flight |
//! | connected | peer id | live [`Peer`] |
//! | tls certs | transport cert hash | peer id |
//!
//! ## Invariants
//!
//! - At most one connected [`Peer`] per id.
//! - A known identity is only replaced by one with a strictly later issue
//!   time; replacement forgets in-flight dials and closes the live connection.
//! - Handshakes waiting for an unknown id are woken when it becomes known.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::identity::PeerIdentity;
use crate::peer::{PendingPeer, Peer};
use crate::crypto::hash_tls_cert;
use crate::waiter::Waiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryStatus {
    UnknownPeer,
    Redundant,
}

impl std::fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryStatus::UnknownPeer => write!(f, "unknown peer"),
            RegistryStatus::Redundant => write!(f, "redundant peer"),
        }
    }
}

impl std::error::Error for RegistryStatus {}

/// Result of looking up an inbound peer.
pub(crate) enum Acceptance {
    Accept(Arc<PeerIdentity>),
    Redundant(Arc<PeerIdentity>),
    Unknown,
}

struct DialHistory {
    issue_time: i64,
    addresses: Vec<IpAddr>,
}

#[derive(Default)]
struct RegistryState {
    known: HashMap<String, Arc<PeerIdentity>>,
    dialed: HashMap<String, DialHistory>,
    connected: HashMap<String, Peer>,
    tls_certs: HashMap<[u8; 32], String>,
    waiters: HashMap<String, Waiter<Arc<PeerIdentity>>>,
    next_internal_id: u64,
}

#[derive(Clone, Default)]
pub struct PeerRegistry {
    state: Arc<Mutex<RegistryState>>,
}

/// Non-owning back reference held by each [`Peer`].
#[derive(Clone)]
pub(crate) struct RegistryHandle(Weak<Mutex<RegistryState>>);

impl RegistryHandle {
    pub(crate) fn report_close(&self, peer: &Peer) {
        if let Some(state) = self.0.upgrade() {
            PeerRegistry { state }.detach(peer);
        }
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a verified identity. Returns false if an identity with the same
    /// or a later issue time is already known.
    pub fn update(&self, identity: PeerIdentity) -> bool {
        let displaced = {
            let mut state = self.lock();
            if let Some(existing) = state.known.get(identity.id())
                && identity.issue_time() <= existing.issue_time()
            {
                return false;
            }

            let id = identity.id().to_string();
            let identity = Arc::new(identity);
            let replaced = state.known.insert(id.clone(), Arc::clone(&identity)).is_some();
            if let Some(waiter) = state.waiters.remove(&id) {
                waiter.set(Arc::clone(&identity));
            }
            if replaced {
                state.dialed.remove(&id);
                state.connected.get(&id).cloned()
            } else {
                None
            }
        };

        if let Some(peer) = displaced {
            debug!(peer = %peer.id(), "identity replaced, closing live connection");
            peer.close();
        }
        true
    }

    /// Forget a known identity and close its live connection, if any.
    pub fn remove(&self, id: &str) -> bool {
        let (removed, connected) = {
            let mut state = self.lock();
            state.dialed.remove(id);
            let connected = state.connected.remove(id);
            if let Some(peer) = &connected {
                state.tls_certs.remove(&peer.tls_cert_hash());
            }
            (state.known.remove(id).is_some(), connected)
        };

        if let Some(peer) = connected {
            debug!(peer = %peer.id(), "identity erased, closing live connection");
            peer.close();
        }
        removed
    }

    pub fn identity(&self, id: &str) -> Option<Arc<PeerIdentity>> {
        self.lock().known.get(id).cloned()
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.lock().known.contains_key(id)
    }

    pub(crate) fn get_if_acceptable(&self, id: &str) -> Acceptance {
        let state = self.lock();
        match state.known.get(id) {
            None => Acceptance::Unknown,
            Some(identity) if state.connected.contains_key(id) => {
                Acceptance::Redundant(Arc::clone(identity))
            }
            Some(identity) => Acceptance::Accept(Arc::clone(identity)),
        }
    }

    /// Waiter that resolves once `id` becomes known.
    pub(crate) fn identity_waiter(&self, id: &str) -> Waiter<Arc<PeerIdentity>> {
        let mut state = self.lock();
        if let Some(identity) = state.known.get(id) {
            let waiter = Waiter::new();
            waiter.set(Arc::clone(identity));
            return waiter;
        }
        state.waiters.entry(id.to_string()).or_default().clone()
    }

    /// Drop the waiter for `id` once no handshake is waiting on it any more.
    ///
    /// Callers drop their own [`Waiter`] handle first.
    pub(crate) fn release_identity_waiter(&self, id: &str) {
        let mut state = self.lock();
        if state.waiters.get(id).is_some_and(|w| w.handle_count() == 1) {
            state.waiters.remove(id);
        }
    }

    /// Reserve a dial of `id` at `ip`.
    pub(crate) fn get_if_dialable(
        &self,
        id: &str,
        ip: IpAddr,
    ) -> Result<Arc<PeerIdentity>, RegistryStatus> {
        let mut state = self.lock();
        let identity = state.known.get(id).cloned().ok_or(RegistryStatus::UnknownPeer)?;
        if state.connected.contains_key(id) {
            return Err(RegistryStatus::Redundant);
        }

        let history = state.dialed.entry(id.to_string()).or_insert_with(|| DialHistory {
            issue_time: identity.issue_time(),
            addresses: Vec::new(),
        });
        if history.issue_time != identity.issue_time() {
            history.issue_time = identity.issue_time();
            history.addresses.clear();
        }
        if history.addresses.contains(&ip) {
            return Err(RegistryStatus::Redundant);
        }
        history.addresses.push(ip);
        Ok(identity)
    }

    pub(crate) fn report_dial_termination(&self, id: &str, issue_time: i64, ip: IpAddr) {
        let mut state = self.lock();
        let Some(history) = state.dialed.get_mut(id) else {
            return;
        };
        if history.issue_time != issue_time {
            return;
        }
        history.addresses.retain(|a| *a != ip);
        if history.addresses.is_empty() {
            state.dialed.remove(id);
        }
    }

    /// Register a finished handshake as the peer's one live connection.
    pub(crate) fn try_complete(&self, pending: PendingPeer) -> Result<Peer, RegistryStatus> {
        let mut state = self.lock();
        let id = pending.identity.id().to_string();
        if !state.known.contains_key(&id) {
            return Err(RegistryStatus::UnknownPeer);
        }
        if state.connected.contains_key(&id) {
            return Err(RegistryStatus::Redundant);
        }

        state.next_internal_id += 1;
        let internal_id = state.next_internal_id;
        let tls_cert_hash = pending.tls_cert_hash;
        let peer = Peer::spawn(pending, internal_id, RegistryHandle(Arc::downgrade(&self.state)));
        state.connected.insert(id.clone(), peer.clone());
        state.tls_certs.insert(tls_cert_hash, id);
        Ok(peer)
    }

    fn detach(&self, peer: &Peer) {
        let mut state = self.lock();
        if state
            .connected
            .get(peer.id())
            .is_some_and(|p| p.internal_id() == peer.internal_id())
        {
            state.connected.remove(peer.id());
        }
        state.tls_certs.remove(&peer.tls_cert_hash());
    }

    pub fn connected_peer(&self, id: &str) -> Option<Peer> {
        self.lock().connected.get(id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connected.len()
    }

    /// Id of the connected peer presenting this transport certificate.
    pub fn peer_id_from_tls_cert(&self, cert_der: &[u8]) -> Option<String> {
        self.lock().tls_certs.get(&hash_tls_cert(cert_der)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RootKey, RootSecret};
    use crate::waiter::WaitError;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn identity() -> PeerIdentity {
        RootSecret::new(&RootKey::generate())
            .expect("root secret")
            .peer_identity()
            .expect("identity")
    }

    #[test]
    fn update_requires_later_issue_time() {
        let registry = PeerRegistry::new();
        let mut first = identity();
        first.issue_time = 100;
        assert!(registry.update(first.clone()));
        assert!(!registry.update(first.clone()), "equal issue time is a no-op");

        let mut older = first.clone();
        older.issue_time = 99;
        assert!(!registry.update(older));

        let mut newer = first.clone();
        newer.issue_time = 101;
        assert!(registry.update(newer));
        assert_eq!(registry.identity(first.id()).unwrap().issue_time(), 101);
    }

    #[test]
    fn dial_reservations_are_per_ip() {
        let registry = PeerRegistry::new();
        let identity = identity();
        let id = identity.id().to_string();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.1".parse().unwrap();

        assert_eq!(
            registry.get_if_dialable(&id, ip).err(),
            Some(RegistryStatus::UnknownPeer)
        );
        registry.update(identity.clone());
        assert!(registry.get_if_dialable(&id, ip).is_ok());
        assert_eq!(registry.get_if_dialable(&id, ip).err(), Some(RegistryStatus::Redundant));
        assert!(registry.get_if_dialable(&id, other).is_ok());

        registry.report_dial_termination(&id, identity.issue_time(), ip);
        assert!(registry.get_if_dialable(&id, ip).is_ok());
    }

    #[test]
    fn replacement_forgets_dials() {
        let registry = PeerRegistry::new();
        let mut identity = identity();
        identity.issue_time = 10;
        let id = identity.id().to_string();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        registry.update(identity.clone());
        registry.get_if_dialable(&id, ip).unwrap();

        identity.issue_time = 11;
        registry.update(identity);
        assert!(registry.get_if_dialable(&id, ip).is_ok());
        // stale termination reports are ignored
        registry.report_dial_termination(&id, 10, ip);
        assert_eq!(registry.get_if_dialable(&id, ip).err(), Some(RegistryStatus::Redundant));
    }

    #[tokio::test]
    async fn waiter_resolves_on_update() {
        let registry = PeerRegistry::new();
        let identity = identity();
        let waiter = registry.identity_waiter(identity.id());
        assert!(waiter.get().is_none());
        let task = tokio::spawn(async move { waiter.wait().await });
        registry.update(identity.clone());
        let resolved = task.await.unwrap();
        assert_eq!(resolved.id(), identity.id());
        assert!(registry.identity_waiter(identity.id()).get().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiters_are_released() {
        let registry = PeerRegistry::new();
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_millis(100);

        let first = registry.identity_waiter("HUnknownPeer");
        let second = registry.identity_waiter("HUnknownPeer");
        assert_eq!(first.wait_until(deadline, &cancel).await.err(), Some(WaitError::Timeout));
        drop(first);
        registry.release_identity_waiter("HUnknownPeer");
        assert_eq!(registry.lock().waiters.len(), 1, "second handshake still waiting");

        drop(second);
        registry.release_identity_waiter("HUnknownPeer");
        assert!(registry.lock().waiters.is_empty());
    }

    #[test]
    fn acceptance_and_removal() {
        let registry = PeerRegistry::new();
        let identity = identity();
        assert!(matches!(registry.get_if_acceptable(identity.id()), Acceptance::Unknown));
        registry.update(identity.clone());
        assert!(matches!(registry.get_if_acceptable(identity.id()), Acceptance::Accept(_)));
        assert!(registry.remove(identity.id()));
        assert!(!registry.is_known(identity.id()));
        assert_eq!(registry.connection_count(), 0);
    }
}
