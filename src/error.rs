use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown command type: {0}")]
    UnknownCommandType(u8),

    #[error("Transfer sequence violation: expected chunk {expected}, got {actual}")]
    TransferSequenceViolation { expected: u32, actual: u32 },

    #[error("No world transfer in progress")]
    NoActiveTransfer,

    #[error("Peer {0} timed out")]
    PeerTimeout(u64),

    #[error("Peer {0} disconnected")]
    PeerDisconnected(u64),

    #[error("Transport failed to start: {0}")]
    TransportStartFailure(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Port mapping failed: {0}")]
    PortMapping(String),

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Not running")]
    NotRunning,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl SyncError {
    /// Errors scoped to a single message. These are logged and the message is
    /// dropped; the session keeps running.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            SyncError::HandshakeRejected(_)
                | SyncError::Decode(_)
                | SyncError::UnknownCommandType(_)
                | SyncError::Host(_)
                | SyncError::Json(_)
                | SyncError::MsgPackDecode(_)
                | SyncError::Bincode(_)
        )
    }
}

/// Failure reported by the host simulation while applying a change or loading
/// a received world.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Change rejected by host: {0}")]
    Rejected(String),

    #[error("Referenced entity {0} does not exist")]
    UnknownEntity(u32),

    #[error("World load failed: {0}")]
    LoadFailed(String),

    #[error("World snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
