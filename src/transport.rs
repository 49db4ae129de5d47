//! # QUIC Transport Adapter
//!
//! Thin layer between quinn and the rest of the crate:
//!
//! - **Endpoint**: one UDP socket acting as both QUIC client and server
//! - **Framing**: length-prefixed frames on a bidirectional stream
//! - **Address candidates**: the addresses this node advertises
//! - **Address selection**: which of a peer's candidates are worth dialing
//!
//! ## Frame Format
//!
//! ```text
//! +----------------+---------------------+
//! | len: u32 (BE)  | body: [u8; len]     |
//! +----------------+---------------------+
//! ```
//!
//! Frames larger than [`MAX_FRAME_SIZE`] are rejected before the body is read.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use quinn::{Endpoint, RecvStream, SendStream};
use tracing::warn;

use crate::messages::MAX_MESSAGE_SIZE;

/// Maximum accepted frame body.
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE;

/// Bind a QUIC endpoint that accepts and initiates connections.
pub fn bind_endpoint(addr: SocketAddr, server_config: quinn::ServerConfig) -> Result<Endpoint> {
    Endpoint::server(server_config, addr)
        .with_context(|| format!("failed to bind QUIC endpoint on {}", addr))
}

// ============================================================================
// Framing
// ============================================================================

pub async fn write_frame(send: &mut SendStream, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", body.len(), MAX_FRAME_SIZE);
    }
    let len = body.len() as u32;
    send.write_all(&len.to_be_bytes())
        .await
        .context("failed to write frame length")?;
    send.write_all(body).await.context("failed to write frame body")?;
    Ok(())
}

pub async fn read_frame(recv: &mut RecvStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .context("failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        warn!(size = len, max = MAX_FRAME_SIZE, "peer sent oversized frame");
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut body = vec![0u8; len];
    recv.read_exact(&mut body)
        .await
        .context("failed to read frame body")?;
    Ok(body)
}

// ============================================================================
// Local Address Candidates
// ============================================================================

/// Addresses to advertise for an endpoint bound at `bound`.
///
/// When bound to a specific IP, that address alone is returned. When bound
/// to `0.0.0.0`, every IPv4 interface address is advertised and loopback is
/// always appended.
pub fn local_addr_candidates(bound: SocketAddr) -> Vec<SocketAddr> {
    if !bound.ip().is_unspecified() {
        return vec![bound];
    }

    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.into_iter().map(|iface| iface.ip()).collect(),
        Err(e) => {
            warn!(error = %e, "failed to enumerate network interfaces");
            Vec::new()
        }
    };
    interface_candidates(interfaces, bound.port())
}

/// Non-loopback IPv4 interface addresses, deduplicated, followed by loopback.
fn interface_candidates(ips: impl IntoIterator<Item = IpAddr>, port: u16) -> Vec<SocketAddr> {
    let mut addresses = Vec::new();
    for ip in ips {
        let IpAddr::V4(v4) = ip else {
            continue;
        };
        if v4.is_loopback() || v4.is_unspecified() || v4.is_link_local() {
            continue;
        }
        let addr = SocketAddr::new(ip, port);
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }

    addresses.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    addresses
}

// ============================================================================
// Address Selection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressClass {
    Unusable,
    Loopback,
    Private,
    Public,
}

fn classify(ip: IpAddr) -> AddressClass {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_unspecified() || v4.is_broadcast() || v4.is_link_local() || v4.is_multicast() {
                AddressClass::Unusable
            } else if v4.is_loopback() {
                AddressClass::Loopback
            } else if v4.is_private() {
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_unspecified() || v6.is_multicast() {
                AddressClass::Unusable
            } else if v6.is_loopback() {
                AddressClass::Loopback
            } else {
                AddressClass::Public
            }
        }
    }
}

/// Picks which of a peer's advertised addresses to dial.
///
/// Public addresses win. Without any, one private address on a different
/// host than ours is tried, and loopback is the last resort.
#[derive(Debug, Clone, Default)]
pub struct AddressSelector {
    local_public: Option<IpAddr>,
    local_private: Option<IpAddr>,
}

impl AddressSelector {
    /// Derive our own public/private IPs from our advertised candidates.
    pub fn from_local_candidates(candidates: &[SocketAddr]) -> Self {
        let mut selector = Self::default();
        for addr in candidates {
            match classify(addr.ip()) {
                AddressClass::Public if selector.local_public.is_none() => {
                    selector.local_public = Some(addr.ip())
                }
                AddressClass::Private if selector.local_private.is_none() => {
                    selector.local_private = Some(addr.ip())
                }
                _ => {}
            }
        }
        selector
    }

    pub fn select(&self, candidates: &[SocketAddr]) -> Vec<SocketAddr> {
        let mut public = Vec::new();
        let mut private = None;
        let mut loopback = None;

        for addr in candidates {
            match classify(addr.ip()) {
                AddressClass::Unusable => {}
                AddressClass::Loopback => {
                    if loopback.is_none() {
                        loopback = Some(*addr);
                    }
                }
                AddressClass::Private => {
                    if private.is_none() && Some(addr.ip()) != self.local_private {
                        private = Some(*addr);
                    }
                }
                AddressClass::Public => {
                    // our own public address means a shared NAT; try the LAN path
                    if Some(addr.ip()) != self.local_public {
                        public.push(*addr);
                    }
                }
            }
        }

        if !public.is_empty() {
            return public;
        }
        private.or(loopback).into_iter().collect()
    }
}
