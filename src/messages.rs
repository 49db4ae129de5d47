//! # AHMP Wire Messages
//!
//! AHMP (Abyss Host Messaging Protocol) is the closed set of messages peers
//! exchange on the single bidirectional stream of a connection.
//!
//! ## Framing
//!
//! Every message travels as one frame: a big-endian `u32` length followed by
//! a bincode envelope `{ msg_type: u32, payload: bytes }`. The payload is the
//! bincode encoding of the typed body for `msg_type`.
//!
//! | Type | Tag | Meaning |
//! |------|-----|---------|
//! | `JN` | 1 | join request |
//! | `JOK` | 2 | join accepted, with current members |
//! | `JDN` | 3 | join denied |
//! | `JNI` | 4 | join notification about a newcomer |
//! | `MEM` | 5 | membership declaration |
//! | `SJN` | 6 | shared member list (gossip) |
//! | `CRR` | 7 | correction: members the receiver does not know |
//! | `RST` | 8 | session reset |
//! | `SOA` | 0x100 | shared objects appended |
//! | `SOD` | 0x101 | shared objects deleted |
//! | `AU_PING_TX` | 0x1000 | reserved ping |
//! | `AU_PING_RX` | 0x1001 | reserved pong |
//!
//! ## Security Limits
//!
//! - `MAX_MESSAGE_SIZE`: frames larger than this are rejected before reading
//! - All decoding goes through `deserialize_bounded()`
//! - Decoded messages are validated (session ids, peer id syntax, list sizes)

use std::net::SocketAddr;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::identity::{MAX_ADDRESS_CANDIDATES, is_valid_peer_id};

/// Maximum size of one AHMP frame body (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of entries in a member or neighbor list.
pub const MAX_LIST_LEN: usize = 4096;

/// Maximum number of objects in one SOA/SOD.
pub const MAX_OBJECTS: usize = 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum MessageError {
    Codec(bincode::Error),
    UnknownType(u32),
    Invalid(&'static str),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::Codec(e) => write!(f, "ahmp codec error: {}", e),
            MessageError::UnknownType(t) => write!(f, "unknown ahmp message type {:#x}", t),
            MessageError::Invalid(what) => write!(f, "invalid ahmp message: {}", what),
        }
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MessageError::Codec(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<bincode::Error> for MessageError {
    fn from(e: bincode::Error) -> Self {
        MessageError::Codec(e)
    }
}

// ============================================================================
// Message Bodies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AhmpType {
    Jn = 1,
    Jok = 2,
    Jdn = 3,
    Jni = 4,
    Mem = 5,
    Sjn = 6,
    Crr = 7,
    Rst = 8,
    Soa = 0x100,
    Sod = 0x101,
    AuPingTx = 0x1000,
    AuPingRx = 0x1001,
}

impl AhmpType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => AhmpType::Jn,
            2 => AhmpType::Jok,
            3 => AhmpType::Jdn,
            4 => AhmpType::Jni,
            5 => AhmpType::Mem,
            6 => AhmpType::Sjn,
            7 => AhmpType::Crr,
            8 => AhmpType::Rst,
            0x100 => AhmpType::Soa,
            0x101 => AhmpType::Sod,
            0x1000 => AhmpType::AuPingTx,
            0x1001 => AhmpType::AuPingRx,
            _ => return None,
        })
    }
}

/// Everything a member needs to reach and authenticate another member's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSessionInfo {
    pub peer_id: String,
    pub address_candidates: Vec<SocketAddr>,
    pub session_id: Uuid,
    /// Session creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub root_cert_der: Vec<u8>,
    pub handshake_cert_der: Vec<u8>,
}

/// `(peer_id, session_id)` pair used in SJN and CRR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub peer_id: String,
    pub session_id: Uuid,
}

/// A shared object placed in a world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: Uuid,
    pub addr: String,
    /// Position (x, y, z) followed by rotation quaternion (w, x, y, z).
    pub transform: [f32; 7],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jn {
    pub sender_session_id: Uuid,
    pub path: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jok {
    pub sender_session_id: Uuid,
    pub recver_session_id: Uuid,
    pub timestamp: u64,
    pub url: String,
    pub neighbors: Vec<PeerSessionInfo>,
}

/// Join denial. `sender_session_id` is nil when no world answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jdn {
    pub sender_session_id: Uuid,
    pub recver_session_id: Uuid,
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jni {
    pub sender_session_id: Uuid,
    pub recver_session_id: Uuid,
    pub joiner: PeerSessionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mem {
    pub sender_session_id: Uuid,
    pub recver_session_id: Uuid,
    pub timestamp: u64,
}

/// Body shared by SJN and CRR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberList {
    pub sender_session_id: Uuid,
    pub recver_session_id: Uuid,
    pub members: Vec<SessionRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rst {
    pub sender_session_id: Uuid,
    pub recver_session_id: Uuid,
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Soa {
    pub sender_session_id: Uuid,
    pub recver_session_id: Uuid,
    pub objects: Vec<ObjectInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sod {
    pub sender_session_id: Uuid,
    pub recver_session_id: Uuid,
    pub object_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuPing {
    pub nonce: u64,
}

/// First handshake frame: the sealed binding certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInit {
    pub encrypted_payload: Vec<u8>,
    pub encrypted_secret: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    msg_type: u32,
    payload: Vec<u8>,
}

// ============================================================================
// AhmpMessage
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum AhmpMessage {
    Jn(Jn),
    Jok(Jok),
    Jdn(Jdn),
    Jni(Jni),
    Mem(Mem),
    Sjn(MemberList),
    Crr(MemberList),
    Rst(Rst),
    Soa(Soa),
    Sod(Sod),
    AuPingTx(AuPing),
    AuPingRx(AuPing),
}

impl AhmpMessage {
    pub fn msg_type(&self) -> AhmpType {
        match self {
            AhmpMessage::Jn(_) => AhmpType::Jn,
            AhmpMessage::Jok(_) => AhmpType::Jok,
            AhmpMessage::Jdn(_) => AhmpType::Jdn,
            AhmpMessage::Jni(_) => AhmpType::Jni,
            AhmpMessage::Mem(_) => AhmpType::Mem,
            AhmpMessage::Sjn(_) => AhmpType::Sjn,
            AhmpMessage::Crr(_) => AhmpType::Crr,
            AhmpMessage::Rst(_) => AhmpType::Rst,
            AhmpMessage::Soa(_) => AhmpType::Soa,
            AhmpMessage::Sod(_) => AhmpType::Sod,
            AhmpMessage::AuPingTx(_) => AhmpType::AuPingTx,
            AhmpMessage::AuPingRx(_) => AhmpType::AuPingRx,
        }
    }

    /// Session the message is addressed to. `None` for JN and pings.
    pub fn recver_session_id(&self) -> Option<Uuid> {
        match self {
            AhmpMessage::Jn(_) | AhmpMessage::AuPingTx(_) | AhmpMessage::AuPingRx(_) => None,
            AhmpMessage::Jok(m) => Some(m.recver_session_id),
            AhmpMessage::Jdn(m) => Some(m.recver_session_id),
            AhmpMessage::Jni(m) => Some(m.recver_session_id),
            AhmpMessage::Mem(m) => Some(m.recver_session_id),
            AhmpMessage::Sjn(m) | AhmpMessage::Crr(m) => Some(m.recver_session_id),
            AhmpMessage::Rst(m) => Some(m.recver_session_id),
            AhmpMessage::Soa(m) => Some(m.recver_session_id),
            AhmpMessage::Sod(m) => Some(m.recver_session_id),
        }
    }

    /// Session the message comes from. `None` for pings.
    pub fn sender_session_id(&self) -> Option<Uuid> {
        match self {
            AhmpMessage::AuPingTx(_) | AhmpMessage::AuPingRx(_) => None,
            AhmpMessage::Jn(m) => Some(m.sender_session_id),
            AhmpMessage::Jok(m) => Some(m.sender_session_id),
            AhmpMessage::Jdn(m) => Some(m.sender_session_id),
            AhmpMessage::Jni(m) => Some(m.sender_session_id),
            AhmpMessage::Mem(m) => Some(m.sender_session_id),
            AhmpMessage::Sjn(m) | AhmpMessage::Crr(m) => Some(m.sender_session_id),
            AhmpMessage::Rst(m) => Some(m.sender_session_id),
            AhmpMessage::Soa(m) => Some(m.sender_session_id),
            AhmpMessage::Sod(m) => Some(m.sender_session_id),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let payload = match self {
            AhmpMessage::Jn(m) => serialize_bounded(m),
            AhmpMessage::Jok(m) => serialize_bounded(m),
            AhmpMessage::Jdn(m) => serialize_bounded(m),
            AhmpMessage::Jni(m) => serialize_bounded(m),
            AhmpMessage::Mem(m) => serialize_bounded(m),
            AhmpMessage::Sjn(m) | AhmpMessage::Crr(m) => serialize_bounded(m),
            AhmpMessage::Rst(m) => serialize_bounded(m),
            AhmpMessage::Soa(m) => serialize_bounded(m),
            AhmpMessage::Sod(m) => serialize_bounded(m),
            AhmpMessage::AuPingTx(m) | AhmpMessage::AuPingRx(m) => serialize_bounded(m),
        }?;
        let envelope = Envelope { msg_type: self.msg_type() as u32, payload };
        Ok(serialize_bounded(&envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let envelope: Envelope = deserialize_bounded(bytes)?;
        let msg_type = AhmpType::from_tag(envelope.msg_type)
            .ok_or(MessageError::UnknownType(envelope.msg_type))?;
        let payload = &envelope.payload;
        let message = match msg_type {
            AhmpType::Jn => AhmpMessage::Jn(deserialize_bounded(payload)?),
            AhmpType::Jok => AhmpMessage::Jok(deserialize_bounded(payload)?),
            AhmpType::Jdn => AhmpMessage::Jdn(deserialize_bounded(payload)?),
            AhmpType::Jni => AhmpMessage::Jni(deserialize_bounded(payload)?),
            AhmpType::Mem => AhmpMessage::Mem(deserialize_bounded(payload)?),
            AhmpType::Sjn => AhmpMessage::Sjn(deserialize_bounded(payload)?),
            AhmpType::Crr => AhmpMessage::Crr(deserialize_bounded(payload)?),
            AhmpType::Rst => AhmpMessage::Rst(deserialize_bounded(payload)?),
            AhmpType::Soa => AhmpMessage::Soa(deserialize_bounded(payload)?),
            AhmpType::Sod => AhmpMessage::Sod(deserialize_bounded(payload)?),
            AhmpType::AuPingTx => AhmpMessage::AuPingTx(deserialize_bounded(payload)?),
            AhmpType::AuPingRx => AhmpMessage::AuPingRx(deserialize_bounded(payload)?),
        };
        message.validate()?;
        Ok(message)
    }

    /// Structural checks applied to every decoded message.
    pub fn validate(&self) -> Result<(), MessageError> {
        match self {
            AhmpMessage::Jn(m) => {
                non_nil(m.sender_session_id)?;
                if !m.path.starts_with('/') {
                    return Err(MessageError::Invalid("join path must be absolute"));
                }
            }
            AhmpMessage::Jok(m) => {
                session_pair(m.sender_session_id, m.recver_session_id)?;
                bounded(m.neighbors.len(), MAX_LIST_LEN)?;
                m.neighbors.iter().try_for_each(validate_info)?;
            }
            AhmpMessage::Jdn(m) => non_nil(m.recver_session_id)?,
            AhmpMessage::Jni(m) => {
                session_pair(m.sender_session_id, m.recver_session_id)?;
                validate_info(&m.joiner)?;
            }
            AhmpMessage::Mem(m) => session_pair(m.sender_session_id, m.recver_session_id)?,
            AhmpMessage::Sjn(m) | AhmpMessage::Crr(m) => {
                session_pair(m.sender_session_id, m.recver_session_id)?;
                bounded(m.members.len(), MAX_LIST_LEN)?;
                for member in &m.members {
                    peer_id(&member.peer_id)?;
                    non_nil(member.session_id)?;
                }
            }
            AhmpMessage::Rst(m) => session_pair(m.sender_session_id, m.recver_session_id)?,
            AhmpMessage::Soa(m) => {
                session_pair(m.sender_session_id, m.recver_session_id)?;
                bounded(m.objects.len(), MAX_OBJECTS)?;
            }
            AhmpMessage::Sod(m) => {
                session_pair(m.sender_session_id, m.recver_session_id)?;
                bounded(m.object_ids.len(), MAX_OBJECTS)?;
            }
            AhmpMessage::AuPingTx(_) | AhmpMessage::AuPingRx(_) => {}
        }
        Ok(())
    }
}

fn non_nil(session_id: Uuid) -> Result<(), MessageError> {
    if session_id.is_nil() {
        return Err(MessageError::Invalid("nil session id"));
    }
    Ok(())
}

fn session_pair(sender: Uuid, recver: Uuid) -> Result<(), MessageError> {
    non_nil(sender)?;
    non_nil(recver)
}

fn bounded(len: usize, max: usize) -> Result<(), MessageError> {
    if len > max {
        return Err(MessageError::Invalid("list too long"));
    }
    Ok(())
}

fn peer_id(id: &str) -> Result<(), MessageError> {
    if !is_valid_peer_id(id) {
        return Err(MessageError::Invalid("malformed peer id"));
    }
    Ok(())
}

fn validate_info(info: &PeerSessionInfo) -> Result<(), MessageError> {
    peer_id(&info.peer_id)?;
    non_nil(info.session_id)?;
    bounded(info.address_candidates.len(), MAX_ADDRESS_CANDIDATES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer_id() -> String {
        format!("H{}", "3".repeat(43))
    }

    fn info() -> PeerSessionInfo {
        PeerSessionInfo {
            peer_id: test_peer_id(),
            address_candidates: vec!["127.0.0.1:1605".parse().unwrap()],
            session_id: Uuid::new_v4(),
            timestamp: 1_700_000_000_000,
            root_cert_der: vec![1, 2, 3],
            handshake_cert_der: vec![4, 5, 6],
        }
    }

    #[test]
    fn jok_round_trip_is_byte_identical() {
        let msg = AhmpMessage::Jok(Jok {
            sender_session_id: Uuid::new_v4(),
            recver_session_id: Uuid::new_v4(),
            timestamp: 42,
            url: "https://example.org/world".into(),
            neighbors: vec![info(), info()],
        });
        let bytes = msg.encode().expect("encode");
        let decoded = AhmpMessage::decode(&bytes).expect("decode");
        assert_eq!(decoded, msg);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn object_messages_round_trip() {
        let msg = AhmpMessage::Soa(Soa {
            sender_session_id: Uuid::new_v4(),
            recver_session_id: Uuid::new_v4(),
            objects: vec![ObjectInfo {
                id: Uuid::new_v4(),
                addr: "carrot.aml".into(),
                transform: [0.0, 1.0, 2.0, 1.0, 0.0, 0.0, 0.0],
            }],
        });
        assert_eq!(AhmpMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn unknown_type_rejected() {
        let envelope = Envelope { msg_type: 0x77, payload: vec![] };
        let bytes = serialize_bounded(&envelope).unwrap();
        assert!(matches!(AhmpMessage::decode(&bytes), Err(MessageError::UnknownType(0x77))));
    }

    #[test]
    fn truncated_payload_rejected() {
        let msg = AhmpMessage::Mem(Mem {
            sender_session_id: Uuid::new_v4(),
            recver_session_id: Uuid::new_v4(),
            timestamp: 1,
        });
        let bytes = msg.encode().unwrap();
        assert!(matches!(
            AhmpMessage::decode(&bytes[..bytes.len() - 1]),
            Err(MessageError::Codec(_))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = AhmpMessage::AuPingTx(AuPing { nonce: 9 }).encode().unwrap();
        bytes.push(0);
        assert!(AhmpMessage::decode(&bytes).is_err());
    }

    #[test]
    fn nil_sessions_rejected() {
        let msg = AhmpMessage::Mem(Mem {
            sender_session_id: Uuid::nil(),
            recver_session_id: Uuid::new_v4(),
            timestamp: 1,
        });
        assert!(matches!(
            AhmpMessage::decode(&msg.encode().unwrap()),
            Err(MessageError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_member_id_rejected() {
        let msg = AhmpMessage::Sjn(MemberList {
            sender_session_id: Uuid::new_v4(),
            recver_session_id: Uuid::new_v4(),
            members: vec![SessionRef { peer_id: "nope".into(), session_id: Uuid::new_v4() }],
        });
        assert!(AhmpMessage::decode(&msg.encode().unwrap()).is_err());
    }

    #[test]
    fn jdn_may_come_from_no_world() {
        let msg = AhmpMessage::Jdn(Jdn {
            sender_session_id: Uuid::nil(),
            recver_session_id: Uuid::new_v4(),
            code: 404,
            message: "Not Found".into(),
        });
        assert_eq!(AhmpMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn recver_session_accessor() {
        let recver = Uuid::new_v4();
        let msg = AhmpMessage::Rst(Rst {
            sender_session_id: Uuid::new_v4(),
            recver_session_id: recver,
            code: 598,
            message: "Reset Requested".into(),
        });
        assert_eq!(msg.recver_session_id(), Some(recver));
        assert_eq!(AhmpMessage::AuPingRx(AuPing { nonce: 1 }).recver_session_id(), None);
    }
}
