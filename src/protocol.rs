use serde::{Deserialize, Serialize};

pub type PlayerId = u32;
pub type EntityId = u32;

/// Bumped whenever a payload layout changes. Peers on different versions are
/// refused during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandType {
    ConnectionRequest = 0,
    ConnectionResult = 1,
    ConnectionClose = 2,
    Ping = 3,
    Pong = 4,
    WorldTransfer = 5,
    PlayerJoined = 6,
    PlayerLeft = 7,
    EntityCreate = 8,
    EntityRemove = 9,
    CustomChange = 10,
}

impl CommandType {
    pub const ALL: [CommandType; 11] = [
        CommandType::ConnectionRequest,
        CommandType::ConnectionResult,
        CommandType::ConnectionClose,
        CommandType::Ping,
        CommandType::Pong,
        CommandType::WorldTransfer,
        CommandType::PlayerJoined,
        CommandType::PlayerLeft,
        CommandType::EntityCreate,
        CommandType::EntityRemove,
        CommandType::CustomChange,
    ];

    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandType::ConnectionRequest => "ConnectionRequest",
            CommandType::ConnectionResult => "ConnectionResult",
            CommandType::ConnectionClose => "ConnectionClose",
            CommandType::Ping => "Ping",
            CommandType::Pong => "Pong",
            CommandType::WorldTransfer => "WorldTransfer",
            CommandType::PlayerJoined => "PlayerJoined",
            CommandType::PlayerLeft => "PlayerLeft",
            CommandType::EntityCreate => "EntityCreate",
            CommandType::EntityRemove => "EntityRemove",
            CommandType::CustomChange => "CustomChange",
        }
    }

    /// Commands that describe a mutation of the shared world, as opposed to
    /// session control traffic.
    pub fn is_world_change(self) -> bool {
        matches!(
            self,
            CommandType::EntityCreate | CommandType::EntityRemove | CommandType::CustomChange
        )
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequestCommand {
    pub username: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResultCommand {
    pub success: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCloseCommand {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingCommand {
    pub timestamp_millis: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongCommand {
    pub timestamp_millis: u64,
}

/// One slice of a serialized world snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldTransferCommand {
    pub index: u32,
    pub count: u32,
    pub chunk: Vec<u8>,
}

impl WorldTransferCommand {
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.count > 0 && self.index == self.count - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerJoinedCommand {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLeftCommand {
    pub username: String,
    pub reason: String,
}

/// Creation of a simulated entity. The id sequences are the identifiers the
/// host allocated while creating it; peers replay them in the same order so
/// their allocations match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreateCommand {
    pub array16_ids: Vec<u16>,
    pub array32_ids: Vec<u32>,
    pub info_index: u16,
    pub kind: u8,
    pub flags: u8,
    pub position: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRemoveCommand {
    pub entity_id: EntityId,
}

/// Host-defined change carried as opaque bytes. `channel` lets the host route
/// it to the right subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomChangeCommand {
    pub channel: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum WorldChange {
    EntityCreate(EntityCreateCommand),
    EntityRemove(EntityRemoveCommand),
    Custom(CustomChangeCommand),
}

impl WorldChange {
    pub fn command_type(&self) -> CommandType {
        match self {
            WorldChange::EntityCreate(_) => CommandType::EntityCreate,
            WorldChange::EntityRemove(_) => CommandType::EntityRemove,
            WorldChange::Custom(_) => CommandType::CustomChange,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ConnectionRequest(ConnectionRequestCommand),
    ConnectionResult(ConnectionResultCommand),
    ConnectionClose(ConnectionCloseCommand),
    Ping(PingCommand),
    Pong(PongCommand),
    WorldTransfer(WorldTransferCommand),
    PlayerJoined(PlayerJoinedCommand),
    PlayerLeft(PlayerLeftCommand),
    Change(WorldChange),
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::ConnectionRequest(_) => CommandType::ConnectionRequest,
            Command::ConnectionResult(_) => CommandType::ConnectionResult,
            Command::ConnectionClose(_) => CommandType::ConnectionClose,
            Command::Ping(_) => CommandType::Ping,
            Command::Pong(_) => CommandType::Pong,
            Command::WorldTransfer(_) => CommandType::WorldTransfer,
            Command::PlayerJoined(_) => CommandType::PlayerJoined,
            Command::PlayerLeft(_) => CommandType::PlayerLeft,
            Command::Change(change) => change.command_type(),
        }
    }

    pub fn connection_request(username: impl Into<String>) -> Self {
        Command::ConnectionRequest(ConnectionRequestCommand {
            username: username.into(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    pub fn accepted() -> Self {
        Command::ConnectionResult(ConnectionResultCommand {
            success: true,
            reason: None,
        })
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Command::ConnectionResult(ConnectionResultCommand {
            success: false,
            reason: Some(reason.into()),
        })
    }

    pub fn close(reason: impl Into<String>) -> Self {
        Command::ConnectionClose(ConnectionCloseCommand {
            reason: reason.into(),
        })
    }

    pub fn ping(timestamp_millis: u64) -> Self {
        Command::Ping(PingCommand { timestamp_millis })
    }

    pub fn pong(timestamp_millis: u64) -> Self {
        Command::Pong(PongCommand { timestamp_millis })
    }

    pub fn world_chunk(index: u32, count: u32, chunk: Vec<u8>) -> Self {
        Command::WorldTransfer(WorldTransferCommand { index, count, chunk })
    }

    pub fn player_joined(username: impl Into<String>) -> Self {
        Command::PlayerJoined(PlayerJoinedCommand {
            username: username.into(),
        })
    }

    pub fn player_left(username: impl Into<String>, reason: impl Into<String>) -> Self {
        Command::PlayerLeft(PlayerLeftCommand {
            username: username.into(),
            reason: reason.into(),
        })
    }

    pub fn as_world_change(&self) -> Option<&WorldChange> {
        match self {
            Command::Change(change) => Some(change),
            _ => None,
        }
    }
}

impl From<WorldChange> for Command {
    fn from(change: WorldChange) -> Self {
        Command::Change(change)
    }
}

/// Wall-clock milliseconds, used for ping timestamps.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_tags_are_dense() {
        for (i, ty) in CommandType::ALL.iter().enumerate() {
            assert_eq!(ty.as_u8() as usize, i);
            assert_eq!(CommandType::from_u8(i as u8), Some(*ty));
        }
        assert_eq!(CommandType::from_u8(CommandType::ALL.len() as u8), None);
        assert_eq!(CommandType::from_u8(0xFF), None);
    }

    #[test]
    fn test_world_change_tags() {
        let remove = Command::from(WorldChange::EntityRemove(EntityRemoveCommand { entity_id: 7 }));
        assert_eq!(remove.command_type(), CommandType::EntityRemove);
        assert!(remove.command_type().is_world_change());
        assert!(remove.as_world_change().is_some());

        let ping = Command::ping(10);
        assert!(!ping.command_type().is_world_change());
        assert!(ping.as_world_change().is_none());
    }

    #[test]
    fn test_world_transfer_bounds() {
        let first = WorldTransferCommand { index: 0, count: 3, chunk: vec![] };
        let last = WorldTransferCommand { index: 2, count: 3, chunk: vec![] };
        let only = WorldTransferCommand { index: 0, count: 1, chunk: vec![] };

        assert!(first.is_first() && !first.is_last());
        assert!(last.is_last() && !last.is_first());
        assert!(only.is_first() && only.is_last());
    }

    #[test]
    fn test_connection_request_carries_version() {
        match Command::connection_request("alice") {
            Command::ConnectionRequest(req) => {
                assert_eq!(req.username, "alice");
                assert_eq!(req.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
