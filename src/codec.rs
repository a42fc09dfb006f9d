use crate::error::{Result, SyncError};
use crate::protocol::*;
use crate::serialization::{BinaryFormat, BinarySerializer};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandCodec {
    serializer: BinarySerializer,
}

impl CommandCodec {
    pub fn new(format: BinaryFormat) -> Self {
        Self {
            serializer: BinarySerializer::new(format),
        }
    }

    pub fn format(&self) -> BinaryFormat {
        self.serializer.get_format()
    }

    pub fn encode(&self, command: &Command) -> Result<Bytes> {
        let tag = command.command_type();
        let payload = match command {
            Command::ConnectionRequest(c) => self.serializer.serialize(c)?,
            Command::ConnectionResult(c) => self.serializer.serialize(c)?,
            Command::ConnectionClose(c) => self.serializer.serialize(c)?,
            Command::Ping(c) => self.serializer.serialize(c)?,
            Command::Pong(c) => self.serializer.serialize(c)?,
            Command::WorldTransfer(c) => self.serializer.serialize(c)?,
            Command::PlayerJoined(c) => self.serializer.serialize(c)?,
            Command::PlayerLeft(c) => self.serializer.serialize(c)?,
            Command::Change(WorldChange::EntityCreate(c)) => self.serializer.serialize(c)?,
            Command::Change(WorldChange::EntityRemove(c)) => self.serializer.serialize(c)?,
            Command::Change(WorldChange::Custom(c)) => self.serializer.serialize(c)?,
        };

        let mut buffer = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buffer.put_u8(tag.as_u8());
        buffer.put_u32_le(payload.len() as u32);
        buffer.put_slice(&payload);
        Ok(buffer.freeze())
    }

    pub fn decode(&self, data: &[u8]) -> Result<Command> {
        let tag = peek_type(data)?;
        let payload = payload_slice(data)?;

        let command = match tag {
            CommandType::ConnectionRequest => Command::ConnectionRequest(self.payload(tag, payload)?),
            CommandType::ConnectionResult => Command::ConnectionResult(self.payload(tag, payload)?),
            CommandType::ConnectionClose => Command::ConnectionClose(self.payload(tag, payload)?),
            CommandType::Ping => Command::Ping(self.payload(tag, payload)?),
            CommandType::Pong => Command::Pong(self.payload(tag, payload)?),
            CommandType::WorldTransfer => Command::WorldTransfer(self.payload(tag, payload)?),
            CommandType::PlayerJoined => Command::PlayerJoined(self.payload(tag, payload)?),
            CommandType::PlayerLeft => Command::PlayerLeft(self.payload(tag, payload)?),
            CommandType::EntityCreate => {
                Command::Change(WorldChange::EntityCreate(self.payload(tag, payload)?))
            }
            CommandType::EntityRemove => {
                Command::Change(WorldChange::EntityRemove(self.payload(tag, payload)?))
            }
            CommandType::CustomChange => {
                Command::Change(WorldChange::Custom(self.payload(tag, payload)?))
            }
        };

        Ok(command)
    }

    fn payload<T: DeserializeOwned>(&self, tag: CommandType, payload: &[u8]) -> Result<T> {
        self.serializer.deserialize(payload).map_err(|e| {
            SyncError::Decode(format!("{} payload ({} bytes): {}", tag, payload.len(), e))
        })
    }

    /// Serializes a bare payload value; used by benches and tests that need
    /// to hand-build frames.
    pub fn encode_raw<T: Serialize>(&self, tag: u8, value: &T) -> Result<Bytes> {
        let payload = self.serializer.serialize(value)?;
        let mut buffer = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buffer.put_u8(tag);
        buffer.put_u32_le(payload.len() as u32);
        buffer.put_slice(&payload);
        Ok(buffer.freeze())
    }
}

/// Reads the type tag without decoding the payload.
pub fn peek_type(data: &[u8]) -> Result<CommandType> {
    let tag = *data
        .first()
        .ok_or_else(|| SyncError::Decode("empty message".to_string()))?;
    CommandType::from_u8(tag).ok_or(SyncError::UnknownCommandType(tag))
}

fn payload_slice(data: &[u8]) -> Result<&[u8]> {
    if data.len() < HEADER_LEN {
        return Err(SyncError::Decode(format!(
            "truncated header: {} of {} bytes",
            data.len(),
            HEADER_LEN
        )));
    }

    let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
    let available = data.len() - HEADER_LEN;

    if available < len {
        return Err(SyncError::Decode(format!(
            "truncated payload: {} of {} bytes",
            available, len
        )));
    }
    if available > len {
        return Err(SyncError::Decode(format!(
            "{} trailing bytes after payload",
            available - len
        )));
    }

    Ok(&data[HEADER_LEN..])
}
