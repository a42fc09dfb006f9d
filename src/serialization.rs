use crate::error::{Result, SyncError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound for a single frame on a stream transport. A world chunk plus
/// its header fits comfortably.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryFormat {
    Json,
    MessagePack,
    #[default]
    Bincode,
}

impl BinaryFormat {
    pub fn name(self) -> &'static str {
        match self {
            BinaryFormat::Json => "json",
            BinaryFormat::MessagePack => "messagepack",
            BinaryFormat::Bincode => "bincode",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BinarySerializer {
    format: BinaryFormat,
}

impl BinarySerializer {
    pub fn new(format: BinaryFormat) -> Self {
        Self { format }
    }

    pub fn json() -> Self {
        Self::new(BinaryFormat::Json)
    }

    pub fn messagepack() -> Self {
        Self::new(BinaryFormat::MessagePack)
    }

    pub fn bincode() -> Self {
        Self::new(BinaryFormat::Bincode)
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self.format {
            BinaryFormat::Json => Ok(serde_json::to_vec(value)?),
            BinaryFormat::MessagePack => Ok(rmp_serde::to_vec(value)?),
            BinaryFormat::Bincode => Ok(bincode::serialize(value)?),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self.format {
            BinaryFormat::Json => Ok(serde_json::from_slice(data)?),
            BinaryFormat::MessagePack => Ok(rmp_serde::from_slice(data)?),
            BinaryFormat::Bincode => Ok(bincode::deserialize(data)?),
        }
    }

    pub fn get_format(&self) -> BinaryFormat {
        self.format
    }
}

impl Default for BinarySerializer {
    fn default() -> Self {
        Self::new(BinaryFormat::default())
    }
}

/// Accumulates length-prefixed frames (`u32` little-endian length, then the
/// payload) for writing to a byte stream.
pub struct FrameWriter {
    buffer: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(SyncError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        self.buffer.put_u32_le(payload.len() as u32);
        self.buffer.put_slice(payload);
        Ok(())
    }

    pub fn flush(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reassembles length-prefixed frames from arbitrarily split stream reads.
pub struct FrameReader {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed,
    /// or an error if the announced length exceeds the limit.
    pub fn try_read_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > self.max_frame_size {
            return Err(SyncError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < 4 + len {
            return Ok(None);
        }

        self.buffer.advance(4);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PingCommand;

    #[test]
    fn test_serializer_formats_agree() {
        let ping = PingCommand { timestamp_millis: 42 };

        for format in [BinaryFormat::Json, BinaryFormat::MessagePack, BinaryFormat::Bincode] {
            let serializer = BinarySerializer::new(format);
            let data = serializer.serialize(&ping).unwrap();
            let decoded: PingCommand = serializer.deserialize(&data).unwrap();
            assert_eq!(decoded, ping, "format {}", format.name());
        }
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut writer = FrameWriter::new();
        writer.write_frame(b"hello").unwrap();
        writer.write_frame(b"").unwrap();
        writer.write_frame(b"world!").unwrap();
        let stream = writer.flush();

        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for byte in stream.iter() {
            reader.feed(&[*byte]);
            while let Some(frame) = reader.try_read_frame().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"hello");
        assert!(frames[1].is_empty());
        assert_eq!(&frames[2][..], b"world!");
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut reader = FrameReader::with_max_frame_size(16);
        reader.feed(&(17u32).to_le_bytes());
        assert!(matches!(
            reader.try_read_frame(),
            Err(SyncError::FrameTooLarge { size: 17, max: 16 })
        ));

        let mut writer = FrameWriter::new();
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(writer.write_frame(&big).is_err());
    }
}
