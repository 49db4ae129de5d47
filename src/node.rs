//! # Network Node
//!
//! A [`Node`] owns the QUIC endpoint, the identity material and the peer
//! registry, and turns raw connections into authenticated [`Peer`]s.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:0", &RootKey::generate()).await?;
//!
//! // learn about a peer out of band, then connect
//! node.append_known_peer(&root_pem, &handshake_pem)?;
//! node.dial(&peer_id)?;
//!
//! // every handshake outcome, inbound or outbound, surfaces here
//! while let Some(outcome) = node.accept().await {
//!     match outcome {
//!         Ok(peer) => println!("connected to {}", peer.id()),
//!         Err(e) => println!("{}", e),
//!     }
//! }
//! ```
//!
//! ## Component Integration
//!
//! - **Endpoint**: one quinn endpoint for both directions
//! - **Handshaker**: background tasks running the three-step handshake
//! - **PeerRegistry**: known identities, dial reservations, live peers
//! - **Backlog**: bounded queue of handshake outcomes read by `accept()`

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::Endpoint;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aurl::{Aurl, Scheme};
use crate::crypto::{CloseCode, create_client_config, create_server_config};
use crate::handshake::{BACKLOG_CAPACITY, DialError, HandshakeOutcome, Handshaker};
use crate::identity::{PeerIdentity, RootKey, RootSecret};
use crate::peer::Peer;
use crate::registry::{PeerRegistry, RegistryStatus};
use crate::transport::{AddressSelector, bind_endpoint, local_addr_candidates};

pub struct Node {
    root: Arc<RootSecret>,
    endpoint: Endpoint,
    handshaker: Arc<Handshaker>,
    registry: PeerRegistry,
    local_addr: SocketAddr,
    local_addr_candidates: Vec<SocketAddr>,
    selector: AddressSelector,
    backlog: tokio::sync::Mutex<mpsc::Receiver<HandshakeOutcome>>,
    cancel: CancellationToken,
}

impl Node {
    /// Bind a node at `addr` (e.g. `0.0.0.0:0`) with the given root key.
    ///
    /// The handshake certificate is re-issued with this node's address
    /// candidates before any connection is accepted.
    pub async fn bind(addr: &str, root_key: &RootKey) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;

        let root = Arc::new(RootSecret::new(root_key)?);
        let tls = root.new_tls_identity()?;
        let server_config = create_server_config(&tls)?;
        let client_config = create_client_config(&tls)?;

        let endpoint = bind_endpoint(addr, server_config)?;
        let local_addr = endpoint.local_addr().context("failed to get local address")?;
        let local_addr_candidates = local_addr_candidates(local_addr);
        root.issue_handshake_cert(&local_addr_candidates)?;
        let selector = AddressSelector::from_local_candidates(&local_addr_candidates);

        let registry = PeerRegistry::new();
        let cancel = CancellationToken::new();
        let (backlog_tx, backlog_rx) = mpsc::channel(BACKLOG_CAPACITY);

        let handshaker = Arc::new(Handshaker {
            root: Arc::clone(&root),
            tls,
            endpoint: endpoint.clone(),
            client_config,
            registry: registry.clone(),
            backlog: backlog_tx,
            cancel: cancel.clone(),
        });

        {
            let endpoint = endpoint.clone();
            let handshaker = Arc::clone(&handshaker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let incoming = tokio::select! {
                        incoming = endpoint.accept() => incoming,
                        _ = cancel.cancelled() => break,
                    };
                    let Some(incoming) = incoming else {
                        break;
                    };
                    tokio::spawn(Arc::clone(&handshaker).accept(incoming));
                }
                debug!("listener stopped");
            });
        }

        info!(id = %root.id(), addr = %local_addr, "node listening");

        Ok(Self {
            root,
            endpoint,
            handshaker,
            registry,
            local_addr,
            local_addr_candidates,
            selector,
            backlog: tokio::sync::Mutex::new(backlog_rx),
            cancel,
        })
    }

    pub fn id(&self) -> &str {
        self.root.id()
    }

    pub fn root_secret(&self) -> &Arc<RootSecret> {
        &self.root
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_addr_candidates(&self) -> &[SocketAddr] {
        &self.local_addr_candidates
    }

    /// `abyss:` URL pointing at `path` on this node.
    pub fn aurl(&self, path: &str) -> Aurl {
        Aurl::new(Scheme::Abyss, self.id(), self.local_addr_candidates.clone(), path)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Learn a peer from PEM certificates. Returns whether the registry changed.
    pub fn append_known_peer(&self, root_cert_pem: &str, handshake_cert_pem: &str) -> Result<bool> {
        let identity = PeerIdentity::from_pem(root_cert_pem, handshake_cert_pem)
            .context("invalid peer certificates")?;
        Ok(self.append_identity(identity))
    }

    /// Learn a peer from DER certificates. Returns whether the registry changed.
    pub fn append_known_peer_der(&self, root_cert_der: &[u8], handshake_cert_der: &[u8]) -> Result<bool> {
        let identity = PeerIdentity::from_der(root_cert_der, handshake_cert_der)
            .context("invalid peer certificates")?;
        Ok(self.append_identity(identity))
    }

    fn append_identity(&self, identity: PeerIdentity) -> bool {
        if identity.id() == self.id() {
            return false;
        }
        self.registry.update(identity)
    }

    pub fn erase_known_peer(&self, id: &str) -> bool {
        self.registry.remove(id)
    }

    /// Start dialing a known peer on every selected address candidate.
    ///
    /// Returns immediately; the outcome surfaces through [`Node::accept`].
    pub fn dial(&self, id: &str) -> Result<(), DialError> {
        let identity = self
            .registry
            .identity(id)
            .ok_or(DialError::Registry(RegistryStatus::UnknownPeer))?;
        if self.registry.connected_peer(id).is_some() {
            return Err(DialError::Registry(RegistryStatus::Redundant));
        }

        let addresses = self.selector.select(identity.address_candidates());
        if addresses.is_empty() {
            return Err(DialError::NoAddress);
        }

        let mut last_status = RegistryStatus::Redundant;
        let mut launched = 0;
        for addr in addresses {
            match self.registry.get_if_dialable(id, addr.ip()) {
                Ok(identity) => {
                    debug!(peer = %id, %addr, "dialing");
                    tokio::spawn(Arc::clone(&self.handshaker).dial(identity, addr));
                    launched += 1;
                }
                Err(status) => last_status = status,
            }
        }
        if launched == 0 {
            return Err(DialError::Registry(last_status));
        }
        Ok(())
    }

    /// Next handshake outcome. `None` once the node is closed.
    pub async fn accept(&self) -> Option<HandshakeOutcome> {
        let mut backlog = self.backlog.lock().await;
        tokio::select! {
            outcome = backlog.recv() => outcome,
            _ = self.cancel.cancelled() => None,
        }
    }

    pub fn connected_peer(&self, id: &str) -> Option<Peer> {
        self.registry.connected_peer(id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn peer_id_from_tls_cert(&self, cert_der: &[u8]) -> Option<String> {
        self.registry.peer_id_from_tls_cert(cert_der)
    }

    /// Stop listening and close every connection.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.endpoint.close(CloseCode::Close.code(), CloseCode::Close.reason());
        info!(id = %self.id(), "node closed");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.close();
    }
}
