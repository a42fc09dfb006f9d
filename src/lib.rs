pub mod protocol;
pub mod serialization;
pub mod codec;
pub mod error;
pub mod session;
pub mod guard;
pub mod transport;
pub mod lifecycle;
pub mod dispatch;
pub mod transfer;
pub mod host;
pub mod config;
pub mod nat;
pub mod server;
pub mod client;
pub mod pump;
pub mod debug;

pub use protocol::{
    PlayerId, EntityId, PROTOCOL_VERSION,
    Command, CommandType, WorldChange,
    ConnectionRequestCommand, ConnectionResultCommand, ConnectionCloseCommand,
    PingCommand, PongCommand, WorldTransferCommand,
    PlayerJoinedCommand, PlayerLeftCommand,
    EntityCreateCommand, EntityRemoveCommand, CustomChangeCommand,
};

pub use serialization::{
    BinarySerializer, BinaryFormat, FrameReader, FrameWriter, MAX_FRAME_SIZE,
};

pub use codec::{
    CommandCodec, peek_type,
};

pub use error::{
    SyncError, HostError, Result,
};

pub use session::{
    Player, SessionRegistry,
};

pub use guard::{
    ReentrancyGuard, GuardToken, IdCollector, IdReplay, CollectedIds,
};

pub use transport::{
    Transport, TransportEvent, PeerId, DeliveryMethod, DisconnectReason,
    MemoryNetwork, MemoryTransport,
};

#[cfg(feature = "async")]
pub use transport::TcpTransport;

pub use lifecycle::{
    LifecycleManager, Acceptance, HEARTBEAT_INTERVAL, PEER_TIMEOUT,
};

pub use dispatch::{
    Dispatcher, CommandHandler, WorldChangeHandler, DispatchStats,
};

pub use transfer::{
    CHUNK_SIZE, chunk_count,
    SnapshotSource, MemorySnapshot, FileSnapshot,
    ChunkSender, OutgoingTransfer, WorldReceiver, ChunkOutcome,
};

pub use host::{
    WorldHost, StatusSink, ApplyContext, NullStatus, LogStatus,
};

pub use config::{
    ServerConfig, ClientConfig, RelayPolicy, DEFAULT_PORT,
};

pub use nat::{
    PortMapper, ManualPortForwarding,
};

#[cfg(feature = "upnp")]
pub use nat::UpnpPortMapper;

pub use server::Server;

pub use client::{
    Client, ClientStatus,
};

pub use pump::{
    EventPump, Pumpable,
};

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_command, trace_transport_send, trace_transport_receive,
    format_bytes, command_summary,
};
