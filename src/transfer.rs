use crate::debug::format_bytes;
use crate::error::{Result, SyncError};
use crate::protocol::Command;
use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks for a snapshot of `len` bytes. An empty snapshot still
/// travels as one empty chunk so the receiver sees a final chunk.
pub fn chunk_count(len: u64) -> u32 {
    let count = len.div_ceil(CHUNK_SIZE as u64);
    count.max(1) as u32
}

fn chunk_offset(index: u32) -> u64 {
    index as u64 * CHUNK_SIZE as u64
}

/// Random-access byte source for a serialized world.
pub trait SnapshotSource {
    fn len(&self) -> u64;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    data: Bytes,
}

impl MemorySnapshot {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl SnapshotSource for MemorySnapshot {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = (offset as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

#[derive(Debug)]
pub struct FileSnapshot {
    file: File,
    len: u64,
}

impl FileSnapshot {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl SnapshotSource for FileSnapshot {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read(buf)
    }
}

/// Sender half: reads numbered chunks out of a snapshot.
pub struct ChunkSender {
    source: Box<dyn SnapshotSource>,
    chunk_count: u32,
}

impl ChunkSender {
    pub fn new(source: Box<dyn SnapshotSource>) -> Self {
        Self {
            source,
            chunk_count: 0,
        }
    }

    pub fn begin_transfer(&mut self) -> u32 {
        self.chunk_count = chunk_count(self.source.len());
        self.chunk_count
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn source_len(&self) -> u64 {
        self.source.len()
    }

    /// Exactly `CHUNK_SIZE` bytes at `index * CHUNK_SIZE`, except the final
    /// chunk which holds the remainder.
    pub fn get_chunk(&mut self, index: u32) -> Result<Vec<u8>> {
        let offset = chunk_offset(index);
        let len = self.source.len();
        if index >= chunk_count(len) {
            return Err(SyncError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                format!("chunk {} out of range for {} byte snapshot", index, len),
            )));
        }

        let want = (len - offset).min(CHUNK_SIZE as u64) as usize;
        let mut chunk = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.source.read_at(offset + filled as u64, &mut chunk[filled..])?;
            if n == 0 {
                return Err(SyncError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("snapshot ended at {} bytes", offset + filled as u64),
                )));
            }
            filled += n;
        }
        Ok(chunk)
    }
}

/// A transfer queued for one peer, drained a few chunks per tick.
pub struct OutgoingTransfer {
    sender: ChunkSender,
    next_index: u32,
}

impl OutgoingTransfer {
    pub fn new(source: Box<dyn SnapshotSource>) -> Self {
        let mut sender = ChunkSender::new(source);
        sender.begin_transfer();
        Self {
            sender,
            next_index: 0,
        }
    }

    pub fn chunk_count(&self) -> u32 {
        self.sender.chunk_count()
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn is_done(&self) -> bool {
        self.next_index >= self.sender.chunk_count()
    }

    pub fn next_command(&mut self) -> Option<Result<Command>> {
        if self.is_done() {
            return None;
        }

        let index = self.next_index;
        self.next_index += 1;
        Some(
            self.sender
                .get_chunk(index)
                .map(|chunk| Command::world_chunk(index, self.sender.chunk_count(), chunk)),
        )
    }
}

#[derive(Debug)]
struct WorldTransferState {
    expected_chunk_count: u32,
    last_written_index: Option<u32>,
    bytes_written: u64,
    file: File,
}

impl WorldTransferState {
    fn next_index(&self) -> u32 {
        self.last_written_index.map_or(0, |last| last + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    InProgress { current: u32, max: u32 },
    Complete { path: PathBuf, bytes: u64 },
}

/// Receiver half: reassembles chunks into `path`.
///
/// All writes go through one lock, so a chunk write and a progress read from
/// another call site never interleave mid-write.
#[derive(Debug)]
pub struct WorldReceiver {
    path: PathBuf,
    state: Mutex<Option<WorldTransferState>>,
    progress: Mutex<(u32, u32)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorldReceiver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
            progress: Mutex::new((0, 0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).is_some()
    }

    pub fn progress(&self) -> (u32, u32) {
        *lock(&self.progress)
    }

    /// Opens a fresh destination, discarding any earlier partial file.
    pub fn start_transfer(&self, chunk_count: u32) -> Result<()> {
        if chunk_count == 0 {
            return Err(SyncError::TransferSequenceViolation {
                expected: 1,
                actual: 0,
            });
        }

        let mut state = lock(&self.state);
        state.take();
        remove_if_exists(&self.path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;

        *state = Some(WorldTransferState {
            expected_chunk_count: chunk_count,
            last_written_index: None,
            bytes_written: 0,
            file,
        });
        *lock(&self.progress) = (0, chunk_count);

        tracing::info!("World transfer started: {} chunks into {}", chunk_count, self.path.display());
        Ok(())
    }

    /// Writes one chunk. Rewriting an already-written index is an idempotent
    /// overwrite; skipping ahead aborts the transfer and deletes the partial
    /// file. So does a chunk whose `count` disagrees with the one the
    /// transfer started with. Writing the final chunk closes the file and
    /// reports completion exactly once.
    pub fn write_chunk(&self, index: u32, count: u32, chunk: &[u8]) -> Result<ChunkOutcome> {
        let mut guard = lock(&self.state);
        let state = guard.as_mut().ok_or(SyncError::NoActiveTransfer)?;

        if count != state.expected_chunk_count {
            let expected = state.expected_chunk_count;
            guard.take();
            drop(guard);
            self.discard_partial();
            tracing::warn!(
                "World transfer aborted: chunk {} claims {} chunks, transfer started with {}",
                index,
                count,
                expected
            );
            return Err(SyncError::TransferSequenceViolation {
                expected,
                actual: count,
            });
        }

        let next = state.next_index();
        if index > next || index >= state.expected_chunk_count || chunk.len() > CHUNK_SIZE {
            let expected = next.min(state.expected_chunk_count.saturating_sub(1));
            guard.take();
            drop(guard);
            self.discard_partial();
            tracing::warn!(
                "World transfer aborted: chunk {} ({} bytes) while expecting {}",
                index,
                chunk.len(),
                expected
            );
            return Err(SyncError::TransferSequenceViolation {
                expected,
                actual: index,
            });
        }

        state.file.seek(SeekFrom::Start(chunk_offset(index)))?;
        state.file.write_all(chunk)?;

        if index == next {
            state.last_written_index = Some(index);
            state.bytes_written += chunk.len() as u64;
        }

        let max = state.expected_chunk_count;
        let current = {
            let mut progress = lock(&self.progress);
            progress.0 = progress.0.max(index);
            progress.0
        };

        tracing::debug!("World chunk received {}/{} ({})", index, max, format_bytes(chunk.len()));

        if index == next && index == max - 1 {
            drop(guard);
            let bytes = self.finish_transfer()?;
            return Ok(ChunkOutcome::Complete {
                path: self.path.clone(),
                bytes,
            });
        }

        Ok(ChunkOutcome::InProgress { current, max })
    }

    /// Flushes and closes the destination. Returns the bytes written.
    pub fn finish_transfer(&self) -> Result<u64> {
        let mut state = lock(&self.state)
            .take()
            .ok_or(SyncError::NoActiveTransfer)?;
        state.file.flush()?;
        state.file.sync_all()?;

        tracing::info!(
            "World transfer finished: {} in {} chunks",
            format_bytes(state.bytes_written as usize),
            state.expected_chunk_count
        );
        Ok(state.bytes_written)
    }

    /// Drops any in-flight transfer and deletes its partial file. Returns
    /// whether a transfer was active.
    pub fn abort(&self) -> bool {
        let had_transfer = lock(&self.state).take().is_some();
        if had_transfer {
            self.discard_partial();
            tracing::info!("World transfer into {} abandoned", self.path.display());
        }
        had_transfer
    }

    fn discard_partial(&self) {
        if let Err(e) = remove_if_exists(&self.path) {
            tracing::warn!("Could not delete partial world {}: {}", self.path.display(), e);
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 1);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(chunk_count(150_000), 3);
    }

    #[test]
    fn test_sender_chunk_sizes() {
        let mut sender = ChunkSender::new(Box::new(MemorySnapshot::new(world(150_000))));
        assert_eq!(sender.begin_transfer(), 3);

        let sizes: Vec<usize> = (0..3).map(|i| sender.get_chunk(i).unwrap().len()).collect();
        assert_eq!(sizes, vec![65_536, 65_536, 18_928]);
        assert!(sender.get_chunk(3).is_err());
    }

    #[test]
    fn test_reassembly_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = world(150_000);
        let mut sender = ChunkSender::new(Box::new(MemorySnapshot::new(source.clone())));
        let count = sender.begin_transfer();

        let receiver = WorldReceiver::new(dir.path().join("world.sav"));
        receiver.start_transfer(count).unwrap();
        assert_eq!(receiver.progress(), (0, 3));

        let mut completions = 0;
        for index in 0..count {
            let chunk = sender.get_chunk(index).unwrap();
            match receiver.write_chunk(index, count, &chunk).unwrap() {
                ChunkOutcome::InProgress { current, max } => {
                    assert_eq!((current, max), (index, count));
                }
                ChunkOutcome::Complete { path, bytes } => {
                    completions += 1;
                    assert_eq!(bytes, 150_000);
                    assert_eq!(fs::read(&path).unwrap(), source);
                }
            }
        }

        assert_eq!(completions, 1);
        assert_eq!(receiver.progress(), (2, 3));
        assert!(!receiver.is_active());
        assert_eq!(fs::metadata(receiver.path()).unwrap().len(), 150_000);
    }

    #[test]
    fn test_rewriting_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = world(CHUNK_SIZE * 3);
        let mut sender = ChunkSender::new(Box::new(MemorySnapshot::new(source.clone())));
        sender.begin_transfer();

        let receiver = WorldReceiver::new(dir.path().join("world.sav"));
        receiver.start_transfer(3).unwrap();

        let first = sender.get_chunk(0).unwrap();
        let second = sender.get_chunk(1).unwrap();
        receiver.write_chunk(0, 3, &first).unwrap();
        receiver.write_chunk(1, 3, &second).unwrap();
        receiver.write_chunk(1, 3, &second).unwrap();
        receiver.write_chunk(0, 3, &first).unwrap();
        assert_eq!(receiver.progress(), (1, 3));

        let last = sender.get_chunk(2).unwrap();
        assert!(matches!(receiver.write_chunk(2, 3, &last).unwrap(), ChunkOutcome::Complete { bytes, .. } if bytes == source.len() as u64));
        assert_eq!(fs::read(receiver.path()).unwrap(), source);
    }

    #[test]
    fn test_skipped_chunk_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.sav");
        let receiver = WorldReceiver::new(&path);
        receiver.start_transfer(4).unwrap();
        receiver.write_chunk(0, 4, &[1; 16]).unwrap();

        let result = receiver.write_chunk(2, 4, &[2; 16]);
        assert!(matches!(
            result,
            Err(SyncError::TransferSequenceViolation { expected: 1, actual: 2 })
        ));
        assert!(!receiver.is_active());
        assert!(!path.exists());
        assert!(matches!(receiver.write_chunk(1, 4, &[0; 16]), Err(SyncError::NoActiveTransfer)));
    }

    #[test]
    fn test_changed_chunk_count_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.sav");
        let receiver = WorldReceiver::new(&path);
        receiver.start_transfer(3).unwrap();
        receiver.write_chunk(0, 3, &[1; 16]).unwrap();

        let result = receiver.write_chunk(1, 5, &[2; 16]);
        assert!(matches!(
            result,
            Err(SyncError::TransferSequenceViolation { expected: 3, actual: 5 })
        ));
        assert!(!receiver.is_active());
        assert!(!path.exists());
    }

    #[test]
    fn test_chunk_before_start_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = WorldReceiver::new(dir.path().join("world.sav"));
        assert!(matches!(receiver.write_chunk(0, 1, b"x"), Err(SyncError::NoActiveTransfer)));
    }

    #[test]
    fn test_start_truncates_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.sav");
        fs::write(&path, vec![9u8; 1000]).unwrap();

        let receiver = WorldReceiver::new(&path);
        receiver.start_transfer(1).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        receiver.write_chunk(0, 1, b"tiny").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"tiny");
    }

    #[test]
    fn test_abort_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.sav");
        let receiver = WorldReceiver::new(&path);
        receiver.start_transfer(2).unwrap();
        receiver.write_chunk(0, 2, &[0; 8]).unwrap();

        assert!(receiver.abort());
        assert!(!path.exists());
        assert!(!receiver.abort());
    }

    #[test]
    fn test_outgoing_transfer_commands() {
        let mut outgoing = OutgoingTransfer::new(Box::new(MemorySnapshot::new(world(CHUNK_SIZE + 10))));
        assert_eq!(outgoing.chunk_count(), 2);

        let mut seen = Vec::new();
        while let Some(command) = outgoing.next_command() {
            match command.unwrap() {
                Command::WorldTransfer(chunk) => seen.push((chunk.index, chunk.count, chunk.chunk.len())),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec![(0, 2, CHUNK_SIZE), (1, 2, 10)]);
        assert!(outgoing.is_done());
    }

    #[test]
    fn test_file_snapshot_reads_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sav");
        let source = world(CHUNK_SIZE + 100);
        fs::write(&path, &source).unwrap();

        let mut sender = ChunkSender::new(Box::new(FileSnapshot::open(&path).unwrap()));
        assert_eq!(sender.begin_transfer(), 2);
        let mut joined = sender.get_chunk(0).unwrap();
        joined.extend(sender.get_chunk(1).unwrap());
        assert_eq!(joined, source);
    }
}
