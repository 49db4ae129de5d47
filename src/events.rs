//! World and host events.
//!
//! Worlds never call back into the host. They append [`AndEvent`]s to an
//! [`AndEventQueue`] which the host drains after every call, turning most of
//! them into [`HostEvent`]s for the application.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

use crate::messages::ObjectInfo;
use crate::peer::Peer;

/// Result codes carried by JDN, RST, JoinFail and WorldLeave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinCode {
    Redundant,
    NotFound,
    Duplicate,
    Canceled,
    Closed,
    Collision,
    InvalidStates,
    Expired,
    Reset,
    Rejected,
}

impl JoinCode {
    pub fn code(self) -> u32 {
        match self {
            JoinCode::Redundant => 110,
            JoinCode::NotFound => 404,
            JoinCode::Duplicate => 480,
            JoinCode::Canceled => 498,
            JoinCode::Closed => 499,
            JoinCode::Collision => 520,
            JoinCode::InvalidStates => 521,
            JoinCode::Expired => 530,
            JoinCode::Reset => 598,
            JoinCode::Rejected => 599,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            JoinCode::Redundant => "Already Joined",
            JoinCode::NotFound => "Not Found",
            JoinCode::Duplicate => "Duplicate Join",
            JoinCode::Canceled => "Join Canceled",
            JoinCode::Closed => "Peer Disconnected",
            JoinCode::Collision => "Session ID Collided",
            JoinCode::InvalidStates => "Invalid States",
            JoinCode::Expired => "Join Expired",
            JoinCode::Reset => "Reset Requested",
            JoinCode::Rejected => "Join Rejected",
        }
    }
}

/// A remote peer's session in a world.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerSession {
    pub peer_id: String,
    pub session_id: Uuid,
}

/// Side effects requested by a world.
#[derive(Debug, Clone, PartialEq)]
pub enum AndEvent {
    WorldEnter { url: String },
    SessionRequest(PeerSession),
    SessionReady(PeerSession),
    SessionClose(PeerSession),
    ObjectAppend { session: PeerSession, objects: Vec<ObjectInfo> },
    ObjectDelete { session: PeerSession, object_ids: Vec<Uuid> },
    JoinFail { code: u32, message: String },
    WorldLeave { code: u32, message: String },
    /// Connect to this peer and report back with `peer_connected`.
    PeerRequest {
        peer_id: String,
        address_candidates: Vec<SocketAddr>,
        root_cert_der: Vec<u8>,
        handshake_cert_der: Vec<u8>,
    },
    /// The world no longer needs messages from this peer.
    PeerDiscard { peer_id: String },
    /// Call `timer_expire` after this long.
    TimerRequest { duration: Duration },
}

impl AndEvent {
    pub(crate) fn join_fail(code: JoinCode) -> Self {
        AndEvent::JoinFail { code: code.code(), message: code.message().to_string() }
    }

    pub(crate) fn world_leave(code: JoinCode) -> Self {
        AndEvent::WorldLeave { code: code.code(), message: code.message().to_string() }
    }
}

/// FIFO of `(world, event)` pairs.
#[derive(Debug, Default)]
pub struct AndEventQueue {
    events: VecDeque<(Uuid, AndEvent)>,
}

impl AndEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, world: Uuid, event: AndEvent) {
        self.events.push_back((world, event));
    }

    pub fn pop(&mut self) -> Option<(Uuid, AndEvent)> {
        self.events.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (Uuid, AndEvent)> + '_ {
        self.events.drain(..)
    }
}

/// Events delivered to the application.
#[derive(Debug, Clone)]
pub enum HostEvent {
    WorldEnter { world: Uuid, url: String },
    SessionRequest { world: Uuid, session: PeerSession },
    SessionReady { world: Uuid, session: PeerSession },
    SessionClose { world: Uuid, session: PeerSession },
    ObjectAppend { world: Uuid, session: PeerSession, objects: Vec<ObjectInfo> },
    ObjectDelete { world: Uuid, session: PeerSession, object_ids: Vec<Uuid> },
    JoinFail { world: Uuid, code: u32, message: String },
    WorldLeave { world: Uuid, code: u32, message: String },
    PeerConnected { peer: Peer },
    PeerDisconnected { peer_id: String },
}

impl HostEvent {
    /// World this event belongs to, if any.
    pub fn world(&self) -> Option<Uuid> {
        match self {
            HostEvent::WorldEnter { world, .. }
            | HostEvent::SessionRequest { world, .. }
            | HostEvent::SessionReady { world, .. }
            | HostEvent::SessionClose { world, .. }
            | HostEvent::ObjectAppend { world, .. }
            | HostEvent::ObjectDelete { world, .. }
            | HostEvent::JoinFail { world, .. }
            | HostEvent::WorldLeave { world, .. } => Some(*world),
            HostEvent::PeerConnected { .. } | HostEvent::PeerDisconnected { .. } => None,
        }
    }

    /// Lift a world event to an application event. `None` for events the
    /// host consumes itself.
    pub(crate) fn from_and(world: Uuid, event: AndEvent) -> Option<Self> {
        Some(match event {
            AndEvent::WorldEnter { url } => HostEvent::WorldEnter { world, url },
            AndEvent::SessionRequest(session) => HostEvent::SessionRequest { world, session },
            AndEvent::SessionReady(session) => HostEvent::SessionReady { world, session },
            AndEvent::SessionClose(session) => HostEvent::SessionClose { world, session },
            AndEvent::ObjectAppend { session, objects } => {
                HostEvent::ObjectAppend { world, session, objects }
            }
            AndEvent::ObjectDelete { session, object_ids } => {
                HostEvent::ObjectDelete { world, session, object_ids }
            }
            AndEvent::JoinFail { code, message } => HostEvent::JoinFail { world, code, message },
            AndEvent::WorldLeave { code, message } => HostEvent::WorldLeave { world, code, message },
            AndEvent::PeerRequest { .. }
            | AndEvent::PeerDiscard { .. }
            | AndEvent::TimerRequest { .. } => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_codes() {
        assert_eq!(JoinCode::NotFound.code(), 404);
        assert_eq!(JoinCode::Duplicate.message(), "Duplicate Join");
        assert_eq!(JoinCode::Closed.message(), "Peer Disconnected");
        assert_eq!(JoinCode::Rejected.code(), 599);
    }

    #[test]
    fn queue_is_fifo() {
        let mut queue = AndEventQueue::new();
        let world = Uuid::new_v4();
        queue.push(world, AndEvent::WorldEnter { url: "a".into() });
        queue.push(world, AndEvent::TimerRequest { duration: Duration::from_millis(5) });
        assert_eq!(queue.len(), 2);
        assert!(matches!(queue.pop(), Some((_, AndEvent::WorldEnter { .. }))));
        assert!(matches!(queue.pop(), Some((_, AndEvent::TimerRequest { .. }))));
        assert!(queue.is_empty());
    }

    #[test]
    fn internal_events_are_not_lifted() {
        let world = Uuid::new_v4();
        assert!(HostEvent::from_and(world, AndEvent::PeerDiscard { peer_id: "x".into() }).is_none());
        let lifted = HostEvent::from_and(world, AndEvent::join_fail(JoinCode::Canceled)).unwrap();
        assert_eq!(lifted.world(), Some(world));
    }
}
