use crate::error::Result;
use bytes::Bytes;
use std::fmt;

pub mod memory;
#[cfg(feature = "async")]
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
#[cfg(feature = "async")]
pub use tcp::TcpTransport;

/// Transport-scoped handle for one remote endpoint. Stable for the lifetime
/// of the connection, never reused by the same transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    /// In-order, lossless. Every protocol command uses this.
    ReliableOrdered,
    /// Best effort. Exposed as a capability only.
    Unreliable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    RemoteClose,
    LocalClose,
    Timeout,
    ConnectionRejected,
    NetworkError(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::RemoteClose => write!(f, "remote closed the connection"),
            DisconnectReason::LocalClose => write!(f, "connection closed locally"),
            DisconnectReason::Timeout => write!(f, "timed out"),
            DisconnectReason::ConnectionRejected => write!(f, "connection rejected"),
            DisconnectReason::NetworkError(e) => write!(f, "network error: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote endpoint asks to connect. Nothing is established until the
    /// owner calls [`Transport::accept`].
    ConnectionRequest { peer: PeerId, addr: String, key: String },
    Connected { peer: PeerId, addr: String },
    Receive { peer: PeerId, data: Bytes, method: DeliveryMethod },
    Disconnected { peer: PeerId, reason: DisconnectReason },
    NetworkError { addr: String, message: String },
    LatencyUpdate { peer: PeerId, millis: u32 },
}

/// Message-oriented transport. Events are only surfaced by
/// [`drain_events`](Transport::drain_events), which gives the protocol layer a
/// single-threaded processing model even when the implementation reads
/// sockets on background threads.
pub trait Transport {
    fn listen(&mut self, port: u16) -> Result<()>;
    fn connect(&mut self, host: &str, port: u16, key: &str) -> Result<PeerId>;
    fn accept(&mut self, peer: PeerId) -> Result<()>;
    fn reject(&mut self, peer: PeerId) -> Result<()>;
    fn send_to(&mut self, peer: PeerId, data: Bytes, method: DeliveryMethod) -> Result<()>;
    fn disconnect(&mut self, peer: PeerId, notice: Option<Bytes>) -> Result<()>;
    fn drain_events(&mut self) -> Vec<TransportEvent>;
    fn has_pending_events(&self) -> bool;
    /// Established peers only.
    fn peers(&self) -> Vec<PeerId>;
    fn peer_addr(&self, peer: PeerId) -> Option<String>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;

    /// Sends to every established peer except `except`. A failing peer is
    /// logged and skipped; its disconnect surfaces through the event queue.
    fn send_to_all(&mut self, data: Bytes, method: DeliveryMethod, except: Option<PeerId>) -> usize {
        let mut sent = 0;
        for peer in self.peers() {
            if Some(peer) == except {
                continue;
            }
            match self.send_to(peer, data.clone(), method) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Send of {} bytes to {} failed: {}", data.len(), peer, e),
            }
        }
        sent
    }
}
