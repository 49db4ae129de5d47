//! # Abyss Core - Peer-to-Peer World Networking
//!
//! Abyss Core connects hosts of a peer-to-peer world browser and keeps the
//! participants of every shared world directly connected to each other.
//!
//! - **Identity**: Ed25519 root keys, self-signed root certificates and
//!   RSA handshake certificates carrying address candidates
//! - **Transport**: QUIC with mutual TLS 1.3, one authenticated connection per peer
//! - **Handshake**: three steps binding the ephemeral TLS key to the root identity
//! - **AND**: neighbor discovery state machine per world session
//! - **Host**: routes AHMP messages to worlds and reports events to the application
//!
//! ## Security Model
//!
//! - Peer ids are derived from the root public key; nothing else names a peer
//! - Only peers whose certificates were added out of band (or introduced by a
//!   world member) are accepted
//! - Handshake failures on the accepting side are indistinguishable from
//!   timeouts
//! - All decoding is size-bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Root secret, peer identity, certificates, handshake envelope |
//! | `crypto` | rustls/quinn configuration and Ed25519 verifiers |
//! | `aurl` | `abyss:` / `abyst:` URL codec |
//! | `messages` | AHMP wire messages |
//! | `transport` | QUIC endpoint, framing, address candidates |
//! | `registry` | Known and connected peers |
//! | `peer` | Connected peer handle |
//! | `handshake` | Connection authentication |
//! | `node` | Listening, dialing, handshake backlog |
//! | `world` | AND state machine |
//! | `events` | World and application events |
//! | `timer` | World timer queue |
//! | `host` | Host router and event loop |
//! | `gateway` | Gateway route configuration |

mod aurl;
mod crypto;
mod events;
mod gateway;
mod handshake;
mod host;
mod identity;
mod messages;
mod node;
mod peer;
mod registry;
mod timer;
mod transport;
mod waiter;
mod world;

pub use aurl::{Aurl, AurlError, Scheme};
pub use crypto::CloseCode;
pub use events::{AndEvent, AndEventQueue, HostEvent, JoinCode, PeerSession};
pub use gateway::{GatewayConfigError, Route, RouteTable};
pub use handshake::{DialError, HandshakeError, HandshakeOutcome, HandshakeReason, HandshakeStage};
pub use host::{EVENT_CHANNEL_CAPACITY, Host};
pub use identity::{
    IdentityError, PeerIdentity, RootKey, RootSecret, TlsIdentity, is_valid_peer_id, tie_break,
};
pub use messages::{AhmpMessage, AhmpType, AuPing, MessageError, ObjectInfo, PeerSessionInfo, SessionRef};
pub use node::Node;
pub use peer::Peer;
pub use registry::{PeerRegistry, RegistryStatus};
pub use timer::TimerQueue;
pub use waiter::{WaitError, Waiter};
pub use world::{EntryState, Lifecycle, MemberSnapshot, PeerRef, World, WorldPeer};
