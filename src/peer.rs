//! # Connected Peers
//!
//! A [`Peer`] is an authenticated QUIC connection to another node, carrying
//! AHMP messages on the single bidirectional stream opened during the
//! handshake.
//!
//! - Outbound messages go through a bounded queue drained by a writer task,
//!   so [`Peer::send`] never blocks. A full queue tears the connection down.
//! - Inbound messages are read with [`Peer::recv`]; a malformed frame closes
//!   the connection with `AhmpParseFail`.
//! - [`Peer::close`] is idempotent and unregisters the peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crypto::CloseCode;
use crate::identity::PeerIdentity;
use crate::messages::AhmpMessage;
use crate::registry::RegistryHandle;
use crate::transport::{read_frame, write_frame};

/// Capacity of the per-peer outbound queue.
pub const PEER_SEND_QUEUE: usize = 1024;

/// Handshake stage output: an authenticated connection not yet registered.
pub(crate) struct PendingPeer {
    pub identity: Arc<PeerIdentity>,
    pub connection: Connection,
    pub send: SendStream,
    pub recv: RecvStream,
    pub tls_cert_hash: [u8; 32],
    pub is_dialing: bool,
}

#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    identity: Arc<PeerIdentity>,
    internal_id: u64,
    connection: Connection,
    remote_addr: SocketAddr,
    tls_cert_hash: [u8; 32],
    is_dialing: bool,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: tokio::sync::Mutex<RecvStream>,
    closed: AtomicBool,
    registry: RegistryHandle,
}

impl Peer {
    /// Wrap a completed handshake and start its writer task.
    pub(crate) fn spawn(pending: PendingPeer, internal_id: u64, registry: RegistryHandle) -> Self {
        let (outbound, rx) = mpsc::channel(PEER_SEND_QUEUE);
        tokio::spawn(write_loop(pending.send, rx, pending.connection.clone()));

        Self {
            inner: Arc::new(PeerInner {
                identity: pending.identity,
                internal_id,
                remote_addr: pending.connection.remote_address(),
                connection: pending.connection,
                tls_cert_hash: pending.tls_cert_hash,
                is_dialing: pending.is_dialing,
                outbound,
                inbound: tokio::sync::Mutex::new(pending.recv),
                closed: AtomicBool::new(false),
                registry,
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.identity.id()
    }

    pub fn identity(&self) -> &Arc<PeerIdentity> {
        &self.inner.identity
    }

    /// Registry-assigned id, unique per connection for the node's lifetime.
    pub fn internal_id(&self) -> u64 {
        self.inner.internal_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn tls_cert_hash(&self) -> [u8; 32] {
        self.inner.tls_cert_hash
    }

    /// True if this side opened the connection.
    pub fn is_dialing(&self) -> bool {
        self.inner.is_dialing
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queue a message for delivery.
    pub fn send(&self, message: AhmpMessage) -> Result<()> {
        let frame = message.encode().context("failed to encode ahmp message")?;
        self.send_frame(frame)
    }

    pub(crate) fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("peer {} is closed", self.id());
        }
        match self.inner.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %self.id(), "outbound queue full, dropping connection");
                CloseCode::AhmpStreamFail.apply(&self.inner.connection);
                anyhow::bail!("outbound queue full")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                anyhow::bail!("peer {} writer has stopped", self.id())
            }
        }
    }

    /// Receive the next message. Errors are terminal for this peer.
    pub async fn recv(&self) -> Result<AhmpMessage> {
        let mut inbound = self.inner.inbound.lock().await;
        let frame = read_frame(&mut inbound).await?;
        match AhmpMessage::decode(&frame) {
            Ok(message) => Ok(message),
            Err(e) => {
                CloseCode::AhmpParseFail.apply(&self.inner.connection);
                Err(e).context("failed to decode ahmp message")
            }
        }
    }

    /// Close the connection and unregister it. Safe to call more than once.
    pub fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        CloseCode::Close.apply(&self.inner.connection);
        self.inner.registry.report_close(self);
    }

    /// Resolves once the underlying connection is gone.
    pub async fn closed(&self) {
        self.inner.connection.closed().await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("internal_id", &self.inner.internal_id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("tls", &hex::encode(&self.inner.tls_cert_hash[..8]))
            .finish()
    }
}

async fn write_loop(mut send: SendStream, mut rx: mpsc::Receiver<Vec<u8>>, connection: Connection) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut send, &frame).await {
            debug!(remote = %connection.remote_address(), error = %e, "ahmp write failed");
            CloseCode::AhmpStreamFail.apply(&connection);
            return;
        }
    }
    let _ = send.finish();
}
