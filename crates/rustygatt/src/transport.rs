//! Transport seam
//!
//! The engine never touches a radio. A [`Transport`] carries already-framed
//! ATT PDUs to and from peers, and reports link activity back to the server
//! as [`TransportEvent`]s over the channel returned by
//! [`GattServer::event_sender`](crate::gatt::GattServer::event_sender).

use std::fmt;
use thiserror::Error;

/// Identifies one connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Errors reported by [`Transport::send`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The outbound buffer is full; retry after `SendBufferDrained`
    #[error("Send buffer full")]
    WouldBlock,

    /// The peer is gone
    #[error("Peer disconnected")]
    Disconnected,
}

/// Link-level events delivered to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer connected
    Connected(SessionId),
    /// A complete ATT PDU arrived from a peer
    BytesReceived(SessionId, Vec<u8>),
    /// A peer disconnected
    Disconnected(SessionId),
    /// The outbound buffer for a peer has room again
    SendBufferDrained(SessionId),
}

impl TransportEvent {
    /// Session the event belongs to
    pub fn session(&self) -> SessionId {
        match self {
            TransportEvent::Connected(id)
            | TransportEvent::BytesReceived(id, _)
            | TransportEvent::Disconnected(id)
            | TransportEvent::SendBufferDrained(id) => *id,
        }
    }
}

/// Outbound half of a link to one or more peers
pub trait Transport: Send + Sync {
    /// Send one ATT PDU to a peer
    fn send(&self, session: SessionId, pdu: &[u8]) -> Result<(), SendError>;

    /// Drop the link to a peer
    fn disconnect(&self, session: SessionId);

    /// Whether the link to a peer is encrypted
    fn is_encrypted(&self, _session: SessionId) -> bool {
        false
    }
}
