use crate::error::HostError;
use crate::guard::IdReplay;
use crate::protocol::WorldChange;
use crate::transfer::SnapshotSource;
use crate::transport::PeerId;
use std::path::Path;

/// Explicit context for one remote apply. Host code that can accept it
/// should use it instead of consulting the process-wide guard.
#[derive(Debug)]
pub struct ApplyContext {
    /// Peer the change arrived from. `None` on a client, where everything
    /// arrives via the server.
    pub origin: Option<PeerId>,
    /// Ids to consume, in order, for any allocation the apply performs.
    pub ids: IdReplay,
}

impl ApplyContext {
    pub fn new(origin: Option<PeerId>, ids: IdReplay) -> Self {
        Self { origin, ids }
    }

    pub fn for_change(origin: Option<PeerId>, change: &WorldChange) -> Self {
        let ids = match change {
            WorldChange::EntityCreate(create) => {
                IdReplay::new(create.array16_ids.clone(), create.array32_ids.clone())
            }
            _ => IdReplay::empty(),
        };
        Self::new(origin, ids)
    }
}

pub trait WorldHost {
    /// Mutates local state. Failures are values, never panics into the
    /// transport layer.
    fn apply_remote_change(&mut self, change: &WorldChange, ctx: &mut ApplyContext) -> Result<(), HostError>;

    /// Serialized world for a joining client. Only called on the server.
    fn world_snapshot(&mut self) -> Result<Box<dyn SnapshotSource>, HostError>;

    /// Loads a completely received world file. Only called on a client.
    fn load_world(&mut self, path: &Path) -> Result<(), HostError>;

    /// Advances the host simulation by one pump tick.
    fn simulation_step(&mut self) {}
}

/// Observability sink. Implementations must return quickly.
pub trait StatusSink {
    fn report_progress(&mut self, _current: u32, _max: u32) {}
    fn player_joined(&mut self, _username: &str) {}
    fn player_left(&mut self, _username: &str, _reason: &str) {}
    fn message(&mut self, _text: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatus;

impl StatusSink for NullStatus {}

/// Forwards status to `tracing`; useful for headless servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn report_progress(&mut self, current: u32, max: u32) {
        tracing::debug!("Progress {}/{}", current, max);
    }

    fn player_joined(&mut self, username: &str) {
        tracing::info!("Player {} has connected!", username);
    }

    fn player_left(&mut self, username: &str, reason: &str) {
        tracing::info!("Player {} left ({})", username, reason);
    }

    fn message(&mut self, text: &str) {
        tracing::info!("{}", text);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::guard::ReentrancyGuard;
    use crate::transfer::MemorySnapshot;
    use std::path::PathBuf;

    /// Host double that records everything the protocol core asks of it.
    #[derive(Default)]
    pub struct TestHost {
        pub guard: ReentrancyGuard,
        pub snapshot: Option<Vec<u8>>,
        pub applied: Vec<WorldChange>,
        pub guard_during_apply: Vec<bool>,
        pub loaded: Vec<(PathBuf, Vec<u8>)>,
        pub fail_apply: bool,
        pub steps: u32,
    }

    impl TestHost {
        pub fn with_world(len: usize) -> Self {
            Self {
                snapshot: Some((0..len).map(|i| (i % 253) as u8).collect()),
                ..Default::default()
            }
        }
    }

    impl WorldHost for TestHost {
        fn apply_remote_change(&mut self, change: &WorldChange, _ctx: &mut ApplyContext) -> Result<(), HostError> {
            self.guard_during_apply.push(self.guard.is_set());
            if self.fail_apply {
                return Err(HostError::Rejected("test host refuses".to_string()));
            }
            self.applied.push(change.clone());
            Ok(())
        }

        fn world_snapshot(&mut self) -> Result<Box<dyn SnapshotSource>, HostError> {
            self.snapshot
                .clone()
                .map(|data| Box::new(MemorySnapshot::new(data)) as Box<dyn SnapshotSource>)
                .ok_or_else(|| HostError::SnapshotUnavailable("no world".to_string()))
        }

        fn load_world(&mut self, path: &Path) -> Result<(), HostError> {
            let data = std::fs::read(path).map_err(|e| HostError::LoadFailed(e.to_string()))?;
            self.loaded.push((path.to_path_buf(), data));
            Ok(())
        }

        fn simulation_step(&mut self) {
            self.steps += 1;
        }
    }

    #[derive(Debug, Default)]
    pub struct RecordingStatus {
        pub progress: Vec<(u32, u32)>,
        pub joined: Vec<String>,
        pub left: Vec<(String, String)>,
        pub messages: Vec<String>,
    }

    impl StatusSink for RecordingStatus {
        fn report_progress(&mut self, current: u32, max: u32) {
            self.progress.push((current, max));
        }

        fn player_joined(&mut self, username: &str) {
            self.joined.push(username.to_string());
        }

        fn player_left(&mut self, username: &str, reason: &str) {
            self.left.push((username.to_string(), reason.to_string()));
        }

        fn message(&mut self, text: &str) {
            self.messages.push(text.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EntityCreateCommand, EntityRemoveCommand};

    #[test]
    fn test_context_carries_create_ids() {
        let change = WorldChange::EntityCreate(EntityCreateCommand {
            array16_ids: vec![1, 2],
            array32_ids: vec![3],
            info_index: 0,
            kind: 0,
            flags: 0,
            position: [0.0; 3],
        });
        let mut ctx = ApplyContext::for_change(Some(PeerId(4)), &change);
        assert_eq!(ctx.origin, Some(PeerId(4)));
        assert_eq!(ctx.ids.next_u16(), Some(1));
        assert_eq!(ctx.ids.next_u16(), Some(2));
        assert_eq!(ctx.ids.next_u32(), Some(3));

        let remove = WorldChange::EntityRemove(EntityRemoveCommand { entity_id: 1 });
        assert!(ApplyContext::for_change(None, &remove).ids.is_exhausted());
    }
}
