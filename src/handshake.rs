//! # Connection Handshake
//!
//! Mutual authentication on top of a TLS 1.3 QUIC connection. TLS only proves
//! possession of an ephemeral key; these three frames, sent on the single
//! bidirectional stream opened by the dialer, bind that key to root ids:
//!
//! | Step | Direction | Frame |
//! |------|-----------|-------|
//! | 1 | dialer → responder | binding cert sealed under the responder's handshake key |
//! | 2 | responder → dialer | responder's binding cert (plain) |
//! | 3 | master → slave | single confirmation byte |
//!
//! The master is the side with the byte-wise smaller id. It registers the
//! connection first and then confirms; the slave registers only after the
//! confirmation arrives, so both sides agree on which of two simultaneous
//! connections survives.
//!
//! ## Security
//!
//! Unauthenticated failures on the responder side (undecryptable envelope,
//! bad binding, unknown id) are reported to the dialer as a timeout at the
//! handshake deadline, giving no oracle to a probing dialer.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, Endpoint, Incoming};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::crypto::{CloseCode, SERVER_NAME, hash_tls_cert, peer_transport_cert};
use crate::identity::{PeerIdentity, RootSecret, TlsIdentity, binding_cert_issuer, tie_break};
use crate::messages::{HandshakeInit, deserialize_bounded, serialize_bounded};
use crate::peer::{Peer, PendingPeer};
use crate::registry::{Acceptance, PeerRegistry, RegistryStatus};
use crate::transport::{read_frame, write_frame};
use crate::waiter::WaitError;

/// Deadline for the whole handshake, from dial or accept to registration.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the queue between handshakes and `accept()`.
pub const BACKLOG_CAPACITY: usize = 32;

/// Body of the step-3 frame.
const CONFIRMATION: [u8; 1] = [0];

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Connecting,
    StreamSetup,
    Handshake1,
    Handshake2,
    Handshake3,
    TieBreaking,
    PeerCompletion,
}

impl HandshakeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeStage::Connecting => "connecting",
            HandshakeStage::StreamSetup => "ahmp-stream-setup",
            HandshakeStage::Handshake1 => "handshake-1",
            HandshakeStage::Handshake2 => "handshake-2",
            HandshakeStage::Handshake3 => "handshake-3",
            HandshakeStage::TieBreaking => "tie-breaking",
            HandshakeStage::PeerCompletion => "peer-completion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeReason {
    TransportFail,
    Timeout,
    Cancelled,
    CryptoFail,
    ParserFail,
    InvalidCert,
    TieBreakFail,
    UnknownPeer,
    Redundant,
}

impl HandshakeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeReason::TransportFail => "transport-failed",
            HandshakeReason::Timeout => "timeout",
            HandshakeReason::Cancelled => "cancelled",
            HandshakeReason::CryptoFail => "cryptography-failure",
            HandshakeReason::ParserFail => "parsing-failure",
            HandshakeReason::InvalidCert => "invalid-certificate",
            HandshakeReason::TieBreakFail => "peer-in-tie",
            HandshakeReason::UnknownPeer => "unknown-peer",
            HandshakeReason::Redundant => "redundant-peer",
        }
    }
}

/// Why a single handshake attempt failed.
#[derive(Debug, Clone)]
pub struct HandshakeError {
    pub is_dialing: bool,
    pub stage: HandshakeStage,
    pub reason: HandshakeReason,
    pub remote_addr: SocketAddr,
    pub peer_id: Option<String>,
    pub cause: String,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} handshake error({}) during {} with {} (peer: {}): {}",
            if self.is_dialing { "outbound" } else { "inbound" },
            self.reason.as_str(),
            self.stage.as_str(),
            self.remote_addr,
            self.peer_id.as_deref().unwrap_or("unknown"),
            self.cause,
        )
    }
}

impl std::error::Error for HandshakeError {}

/// Error returned by [`crate::node::Node::dial`] before any connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    Registry(RegistryStatus),
    NoAddress,
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::Registry(status) => write!(f, "cannot dial: {}", status),
            DialError::NoAddress => write!(f, "cannot dial: no usable address candidate"),
        }
    }
}

impl std::error::Error for DialError {}

/// Handshake result queued for `accept()`.
pub type HandshakeOutcome = Result<Peer, HandshakeError>;

// ============================================================================
// Handshaker
// ============================================================================

/// Shared state for running handshakes in background tasks.
pub(crate) struct Handshaker {
    pub root: Arc<RootSecret>,
    pub tls: TlsIdentity,
    pub endpoint: Endpoint,
    pub client_config: quinn::ClientConfig,
    pub registry: PeerRegistry,
    pub backlog: mpsc::Sender<HandshakeOutcome>,
    pub cancel: CancellationToken,
}

/// Per-attempt context used to build errors.
struct Attempt {
    is_dialing: bool,
    remote_addr: SocketAddr,
    peer_id: Option<String>,
    deadline: Instant,
}

impl Attempt {
    fn error(&self, stage: HandshakeStage, reason: HandshakeReason, cause: impl fmt::Display) -> HandshakeError {
        HandshakeError {
            is_dialing: self.is_dialing,
            stage,
            reason,
            remote_addr: self.remote_addr,
            peer_id: self.peer_id.clone(),
            cause: cause.to_string(),
        }
    }

    fn interrupted(&self, stage: HandshakeStage, why: WaitError) -> HandshakeError {
        let reason = match why {
            WaitError::Timeout => HandshakeReason::Timeout,
            WaitError::Cancelled => HandshakeReason::Cancelled,
        };
        self.error(stage, reason, why)
    }
}

impl Handshaker {
    /// Run `fut` until it completes, the deadline passes or the node shuts down.
    async fn within<T>(
        &self,
        deadline: Instant,
        fut: impl Future<Output = T>,
    ) -> Result<T, WaitError> {
        tokio::select! {
            out = fut => Ok(out),
            _ = tokio::time::sleep_until(deadline) => Err(WaitError::Timeout),
            _ = self.cancel.cancelled() => Err(WaitError::Cancelled),
        }
    }

    async fn report(&self, outcome: HandshakeOutcome) {
        match &outcome {
            Ok(peer) => debug!(peer = %peer.id(), addr = %peer.remote_addr(), "handshake complete"),
            Err(e) => debug!("{}", e),
        }
        tokio::select! {
            sent = self.backlog.send(outcome) => {
                if let Err(mpsc::error::SendError(Ok(peer))) = sent {
                    peer.close();
                }
            }
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Dial one address of a known peer.
    pub async fn dial(self: Arc<Self>, identity: Arc<PeerIdentity>, addr: SocketAddr) {
        let outcome = self.dial_inner(&identity, addr).await;
        self.registry
            .report_dial_termination(identity.id(), identity.issue_time(), addr.ip());
        self.report(outcome).await;
    }

    async fn dial_inner(&self, identity: &PeerIdentity, addr: SocketAddr) -> HandshakeOutcome {
        use HandshakeReason::*;
        use HandshakeStage::*;

        let attempt = Attempt {
            is_dialing: true,
            remote_addr: addr,
            peer_id: Some(identity.id().to_string()),
            deadline: Instant::now() + HANDSHAKE_TIMEOUT,
        };

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, SERVER_NAME)
            .map_err(|e| attempt.error(Connecting, TransportFail, e))?;
        let connection = self
            .within(attempt.deadline, connecting)
            .await
            .map_err(|w| attempt.interrupted(Connecting, w))?
            .map_err(|e| attempt.error(Connecting, TransportFail, e))?;

        let transport_cert = peer_transport_cert(&connection).ok_or_else(|| {
            CloseCode::AuthenticationFail.apply(&connection);
            attempt.error(Connecting, InvalidCert, "missing transport certificate")
        })?;

        let (mut send, mut recv) = self
            .within(attempt.deadline, connection.open_bi())
            .await
            .map_err(|w| attempt.interrupted(StreamSetup, w))?
            .map_err(|e| attempt.error(StreamSetup, TransportFail, e))?;

        // step 1
        let (encrypted_payload, encrypted_secret) = identity
            .encrypt_handshake(self.tls.binding_cert_der())
            .map_err(|e| {
                CloseCode::CryptoFail.apply(&connection);
                attempt.error(Handshake1, CryptoFail, e)
            })?;
        let init = serialize_bounded(&HandshakeInit { encrypted_payload, encrypted_secret })
            .map_err(|e| attempt.error(Handshake1, ParserFail, e))?;
        self.within(attempt.deadline, write_frame(&mut send, &init))
            .await
            .map_err(|w| attempt.interrupted(Handshake1, w))?
            .map_err(|e| {
                CloseCode::AhmpStreamFail.apply(&connection);
                attempt.error(Handshake1, TransportFail, e)
            })?;

        // step 2
        let binding = self
            .within(attempt.deadline, read_frame(&mut recv))
            .await
            .map_err(|w| attempt.interrupted(Handshake2, w))?
            .map_err(|e| {
                CloseCode::AhmpStreamFail.apply(&connection);
                attempt.error(Handshake2, TransportFail, e)
            })?;
        identity
            .verify_tls_binding(&binding, &transport_cert)
            .map_err(|e| {
                CloseCode::AuthenticationFail.apply(&connection);
                attempt.error(Handshake2, InvalidCert, e)
            })?;

        let pending = PendingPeer {
            identity: self
                .registry
                .identity(identity.id())
                .unwrap_or_else(|| Arc::new(identity.clone())),
            connection,
            send,
            recv,
            tls_cert_hash: hash_tls_cert(&transport_cert),
            is_dialing: true,
        };
        self.complete(&attempt, pending).await
    }

    /// Serve one inbound connection attempt.
    pub async fn accept(self: Arc<Self>, incoming: Incoming) {
        let outcome = self.accept_inner(incoming).await;
        self.report(outcome).await;
    }

    async fn accept_inner(&self, incoming: Incoming) -> HandshakeOutcome {
        use HandshakeReason::*;
        use HandshakeStage::*;

        let mut attempt = Attempt {
            is_dialing: false,
            remote_addr: incoming.remote_address(),
            peer_id: None,
            deadline: Instant::now() + HANDSHAKE_TIMEOUT,
        };

        let connecting = incoming
            .accept()
            .map_err(|e| attempt.error(Connecting, TransportFail, e))?;
        let connection = self
            .within(attempt.deadline, connecting)
            .await
            .map_err(|w| attempt.interrupted(Connecting, w))?
            .map_err(|e| attempt.error(Connecting, TransportFail, e))?;

        let transport_cert = peer_transport_cert(&connection).ok_or_else(|| {
            CloseCode::AuthenticationFail.apply(&connection);
            attempt.error(Connecting, InvalidCert, "missing transport certificate")
        })?;

        let (mut send, mut recv) = self
            .within(attempt.deadline, connection.accept_bi())
            .await
            .map_err(|w| attempt.interrupted(StreamSetup, w))?
            .map_err(|e| attempt.error(StreamSetup, TransportFail, e))?;

        // step 1
        let frame = self
            .within(attempt.deadline, read_frame(&mut recv))
            .await
            .map_err(|w| attempt.interrupted(Handshake1, w))?
            .map_err(|e| {
                CloseCode::AhmpStreamFail.apply(&connection);
                attempt.error(Handshake1, TransportFail, e)
            })?;
        let init: HandshakeInit = match deserialize_bounded(&frame) {
            Ok(init) => init,
            Err(e) => {
                return Err(self
                    .disguise(&attempt, &connection, attempt.error(Handshake1, ParserFail, e))
                    .await);
            }
        };
        let binding = match self
            .root
            .decrypt_handshake(&init.encrypted_payload, &init.encrypted_secret)
        {
            Ok(binding) => binding,
            Err(e) => {
                return Err(self
                    .disguise(&attempt, &connection, attempt.error(Handshake1, CryptoFail, e))
                    .await);
            }
        };
        let claimed_id = match binding_cert_issuer(&binding) {
            Ok(id) => id,
            Err(e) => {
                return Err(self
                    .disguise(&attempt, &connection, attempt.error(Handshake1, InvalidCert, e))
                    .await);
            }
        };
        attempt.peer_id = Some(claimed_id.clone());

        let identity = loop {
            match self.registry.get_if_acceptable(&claimed_id) {
                Acceptance::Accept(identity) => break identity,
                Acceptance::Redundant(identity) => {
                    let err = attempt.error(Handshake1, Redundant, "already connected");
                    if identity.verify_tls_binding(&binding, &transport_cert).is_ok() {
                        CloseCode::RedundantConnection.apply(&connection);
                        return Err(err);
                    }
                    return Err(self.disguise(&attempt, &connection, err).await);
                }
                Acceptance::Unknown => {
                    trace!(peer = %claimed_id, "waiting for identity of inbound peer");
                    let waiter = self.registry.identity_waiter(&claimed_id);
                    let waited = waiter.wait_until(attempt.deadline, &self.cancel).await;
                    drop(waiter);
                    if let Err(w) = waited {
                        self.registry.release_identity_waiter(&claimed_id);
                        CloseCode::HandshakeTimeout.apply(&connection);
                        let reason = match w {
                            WaitError::Timeout => UnknownPeer,
                            WaitError::Cancelled => Cancelled,
                        };
                        return Err(attempt.error(Handshake1, reason, "peer identity not known"));
                    }
                }
            }
        };

        if let Err(e) = identity.verify_tls_binding(&binding, &transport_cert) {
            return Err(self
                .disguise(&attempt, &connection, attempt.error(Handshake1, InvalidCert, e))
                .await);
        }

        // step 2
        self.within(attempt.deadline, write_frame(&mut send, self.tls.binding_cert_der()))
            .await
            .map_err(|w| attempt.interrupted(Handshake2, w))?
            .map_err(|e| {
                CloseCode::AhmpStreamFail.apply(&connection);
                attempt.error(Handshake2, TransportFail, e)
            })?;

        let pending = PendingPeer {
            identity,
            connection,
            send,
            recv,
            tls_cert_hash: hash_tls_cert(&transport_cert),
            is_dialing: false,
        };
        self.complete(&attempt, pending).await
    }

    /// Hold the connection until the deadline, then close it as a timeout.
    async fn disguise(
        &self,
        attempt: &Attempt,
        connection: &Connection,
        error: HandshakeError,
    ) -> HandshakeError {
        let _ = self.within(attempt.deadline, std::future::pending::<()>()).await;
        CloseCode::HandshakeTimeout.apply(connection);
        error
    }

    /// Tie-break, step 3 and registration.
    async fn complete(&self, attempt: &Attempt, mut pending: PendingPeer) -> HandshakeOutcome {
        use HandshakeReason::*;
        use HandshakeStage::*;

        let connection = pending.connection.clone();
        let Some(is_master) = tie_break(self.root.id(), pending.identity.id()) else {
            CloseCode::CryptoFail.apply(&connection);
            return Err(attempt.error(TieBreaking, TieBreakFail, "peer presented our own id"));
        };

        if !is_master {
            let confirmation = self
                .within(attempt.deadline, read_frame(&mut pending.recv))
                .await
                .map_err(|w| attempt.interrupted(Handshake3, w))?
                .map_err(|e| attempt.error(Handshake3, TransportFail, e))?;
            if confirmation != CONFIRMATION {
                CloseCode::AhmpParseFail.apply(&connection);
                return Err(attempt.error(Handshake3, ParserFail, "unexpected confirmation frame"));
            }
        }

        let peer = match self.registry.try_complete(pending) {
            Ok(peer) => peer,
            Err(RegistryStatus::Redundant) => {
                CloseCode::RedundantConnection.apply(&connection);
                return Err(attempt.error(PeerCompletion, Redundant, "already connected"));
            }
            Err(RegistryStatus::UnknownPeer) => {
                CloseCode::AuthenticationFail.apply(&connection);
                return Err(attempt.error(PeerCompletion, UnknownPeer, "peer was forgotten"));
            }
        };

        if is_master
            && let Err(e) = peer.send_frame(CONFIRMATION.to_vec())
        {
            peer.close();
            return Err(attempt.error(Handshake3, TransportFail, e));
        }
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_direction_stage_and_reason() {
        let err = HandshakeError {
            is_dialing: true,
            stage: HandshakeStage::Handshake2,
            reason: HandshakeReason::InvalidCert,
            remote_addr: "127.0.0.1:1605".parse().unwrap(),
            peer_id: Some("Habc".into()),
            cause: "bad signature".into(),
        };
        assert_eq!(
            err.to_string(),
            "outbound handshake error(invalid-certificate) during handshake-2 with 127.0.0.1:1605 (peer: Habc): bad signature"
        );

        let inbound = HandshakeError { is_dialing: false, peer_id: None, ..err };
        assert!(inbound.to_string().starts_with("inbound handshake error"));
        assert!(inbound.to_string().contains("(peer: unknown)"));
    }

    #[test]
    fn stage_and_reason_names() {
        assert_eq!(HandshakeStage::StreamSetup.as_str(), "ahmp-stream-setup");
        assert_eq!(HandshakeStage::PeerCompletion.as_str(), "peer-completion");
        assert_eq!(HandshakeReason::TieBreakFail.as_str(), "peer-in-tie");
        assert_eq!(HandshakeReason::Redundant.as_str(), "redundant-peer");
    }
}
