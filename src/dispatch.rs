use crate::codec::CommandCodec;
use crate::error::{Result, SyncError};
use crate::guard::ReentrancyGuard;
use crate::host::{ApplyContext, WorldHost};
use crate::protocol::{Command, CommandType};
use crate::transport::PeerId;
use ahash::AHashMap;
use bytes::Bytes;

pub trait CommandHandler {
    fn command_type(&self) -> CommandType;

    /// Transactional handlers run with the reentrancy guard raised, so host
    /// callbacks triggered by the apply are not broadcast again.
    fn transactional(&self) -> bool {
        false
    }

    /// Whether the server forwards this command to the other peers.
    fn relays(&self) -> bool {
        false
    }

    fn handle(&self, command: &Command, origin: Option<PeerId>, host: &mut dyn WorldHost) -> Result<()>;
}

/// Applies entity and custom changes to the host.
#[derive(Debug, Clone, Copy)]
pub struct WorldChangeHandler {
    command_type: CommandType,
}

impl WorldChangeHandler {
    pub fn new(command_type: CommandType) -> Self {
        Self { command_type }
    }
}

impl CommandHandler for WorldChangeHandler {
    fn command_type(&self) -> CommandType {
        self.command_type
    }

    fn transactional(&self) -> bool {
        true
    }

    fn relays(&self) -> bool {
        true
    }

    fn handle(&self, command: &Command, origin: Option<PeerId>, host: &mut dyn WorldHost) -> Result<()> {
        let change = command.as_world_change().ok_or_else(|| {
            SyncError::Decode(format!(
                "{} handler received {}",
                self.command_type,
                command.command_type()
            ))
        })?;

        let mut ctx = ApplyContext::for_change(origin, change);
        host.apply_remote_change(change, &mut ctx)?;

        if !ctx.ids.is_exhausted() {
            tracing::warn!(
                "{} applied with {} replay ids left unconsumed",
                self.command_type,
                ctx.ids.remaining()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub failed: u64,
    pub relayed: u64,
}

pub struct Dispatcher {
    codec: CommandCodec,
    handlers: AHashMap<CommandType, Box<dyn CommandHandler>>,
    guard: ReentrancyGuard,
    peer_stats: AHashMap<PeerId, DispatchStats>,
    totals: DispatchStats,
}

impl Dispatcher {
    pub fn new(codec: CommandCodec, guard: ReentrancyGuard) -> Self {
        Self {
            codec,
            handlers: AHashMap::new(),
            guard,
            peer_stats: AHashMap::new(),
            totals: DispatchStats::default(),
        }
    }

    /// Dispatcher with a [`WorldChangeHandler`] for every world-change type.
    pub fn with_world_handlers(codec: CommandCodec, guard: ReentrancyGuard) -> Self {
        let mut dispatcher = Self::new(codec, guard);
        for command_type in CommandType::ALL.into_iter().filter(|t| t.is_world_change()) {
            dispatcher.register(Box::new(WorldChangeHandler::new(command_type)));
        }
        dispatcher
    }

    /// Registers a handler, replacing any earlier one for the same type.
    pub fn register(&mut self, handler: Box<dyn CommandHandler>) {
        let command_type = handler.command_type();
        if self.handlers.insert(command_type, handler).is_some() {
            tracing::debug!("Replaced handler for {}", command_type);
        }
    }

    pub fn codec(&self) -> CommandCodec {
        self.codec
    }

    pub fn set_codec(&mut self, codec: CommandCodec) {
        self.codec = codec;
    }

    pub fn guard(&self) -> &ReentrancyGuard {
        &self.guard
    }

    pub fn encode(&self, command: &Command) -> Result<Bytes> {
        self.codec.encode(command)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Command> {
        self.codec.decode(data)
    }

    pub fn handles(&self, command_type: CommandType) -> bool {
        self.handlers.contains_key(&command_type)
    }

    pub fn relays(&self, command_type: CommandType) -> bool {
        self.handlers
            .get(&command_type)
            .map(|h| h.relays())
            .unwrap_or(false)
    }

    /// Runs the handler registered for the command's type. The guard is
    /// released on every exit path, including handler failure and unwinding.
    pub fn dispatch(&mut self, command: &Command, origin: Option<PeerId>, host: &mut dyn WorldHost) -> Result<()> {
        let command_type = command.command_type();
        let handler = self
            .handlers
            .get(&command_type)
            .ok_or(SyncError::UnknownCommandType(command_type.as_u8()))?;

        let result = {
            let _token = handler.transactional().then(|| self.guard.enter());
            handler.handle(command, origin, host)
        };

        let stats = &mut self.totals;
        match &result {
            Ok(()) => stats.dispatched += 1,
            Err(_) => stats.failed += 1,
        }
        if let Some(peer) = origin {
            let stats = self.peer_stats.entry(peer).or_default();
            match &result {
                Ok(()) => stats.dispatched += 1,
                Err(_) => stats.failed += 1,
            }
        }

        result
    }

    pub fn record_relay(&mut self, origin: PeerId) {
        self.totals.relayed += 1;
        self.peer_stats.entry(origin).or_default().relayed += 1;
    }

    pub fn stats(&self, peer: PeerId) -> Option<DispatchStats> {
        self.peer_stats.get(&peer).copied()
    }

    pub fn totals(&self) -> DispatchStats {
        self.totals
    }

    /// Discards per-peer state when a session ends.
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.peer_stats.remove(&peer);
    }

    pub fn forget_all(&mut self) {
        self.peer_stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use crate::protocol::{CustomChangeCommand, EntityCreateCommand, EntityRemoveCommand, WorldChange};
    use crate::transfer::SnapshotSource;
    use std::path::Path;

    #[derive(Default)]
    struct RecordingHost {
        guard: ReentrancyGuard,
        guard_seen: Vec<bool>,
        applied: Vec<WorldChange>,
        replayed: Vec<u16>,
        fail: bool,
    }

    impl WorldHost for RecordingHost {
        fn apply_remote_change(&mut self, change: &WorldChange, ctx: &mut ApplyContext) -> std::result::Result<(), HostError> {
            self.guard_seen.push(self.guard.is_set());
            while let Some(id) = ctx.ids.next_u16() {
                self.replayed.push(id);
            }
            if self.fail {
                return Err(HostError::UnknownEntity(7));
            }
            self.applied.push(change.clone());
            Ok(())
        }

        fn world_snapshot(&mut self) -> std::result::Result<Box<dyn SnapshotSource>, HostError> {
            Err(HostError::SnapshotUnavailable("test host".to_string()))
        }

        fn load_world(&mut self, _path: &Path) -> std::result::Result<(), HostError> {
            Ok(())
        }
    }

    fn setup() -> (Dispatcher, RecordingHost) {
        let guard = ReentrancyGuard::new();
        let dispatcher = Dispatcher::with_world_handlers(CommandCodec::default(), guard.clone());
        let host = RecordingHost {
            guard,
            ..Default::default()
        };
        (dispatcher, host)
    }

    fn create() -> Command {
        Command::Change(WorldChange::EntityCreate(EntityCreateCommand {
            array16_ids: vec![10, 11],
            array32_ids: vec![],
            info_index: 2,
            kind: 1,
            flags: 0,
            position: [1.0, 2.0, 0.0],
        }))
    }

    #[test]
    fn test_world_change_applied_under_guard() {
        let (mut dispatcher, mut host) = setup();

        assert!(!dispatcher.guard().is_set());
        dispatcher.dispatch(&create(), Some(PeerId(1)), &mut host).unwrap();
        assert!(!dispatcher.guard().is_set());

        assert_eq!(host.guard_seen, vec![true]);
        assert_eq!(host.replayed, vec![10, 11]);
        assert_eq!(host.applied.len(), 1);
    }

    #[test]
    fn test_guard_released_after_failure() {
        let (mut dispatcher, mut host) = setup();
        host.fail = true;

        let remove = Command::Change(WorldChange::EntityRemove(EntityRemoveCommand { entity_id: 7 }));
        let result = dispatcher.dispatch(&remove, Some(PeerId(1)), &mut host);

        assert!(matches!(result, Err(SyncError::Host(HostError::UnknownEntity(7)))));
        assert_eq!(host.guard_seen, vec![true]);
        assert!(!dispatcher.guard().is_set());
        assert_eq!(
            dispatcher.stats(PeerId(1)),
            Some(DispatchStats {
                dispatched: 0,
                failed: 1,
                relayed: 0
            })
        );
    }

    #[test]
    fn test_guard_released_after_panic() {
        struct Exploding;

        impl CommandHandler for Exploding {
            fn command_type(&self) -> CommandType {
                CommandType::CustomChange
            }

            fn transactional(&self) -> bool {
                true
            }

            fn handle(&self, _: &Command, _: Option<PeerId>, _: &mut dyn WorldHost) -> Result<()> {
                panic!("handler bug");
            }
        }

        let (mut dispatcher, mut host) = setup();
        dispatcher.register(Box::new(Exploding));
        let custom = Command::Change(WorldChange::Custom(CustomChangeCommand {
            channel: 0,
            payload: vec![],
        }));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = dispatcher.dispatch(&custom, None, &mut host);
        }));
        assert!(outcome.is_err());
        assert!(!host.guard.is_set());
    }

    #[test]
    fn test_unregistered_type_is_unknown() {
        let (mut dispatcher, mut host) = setup();
        let result = dispatcher.dispatch(&Command::player_joined("x"), Some(PeerId(2)), &mut host);

        assert!(matches!(result, Err(SyncError::UnknownCommandType(tag)) if tag == CommandType::PlayerJoined.as_u8()));
        assert!(host.guard_seen.is_empty());
    }

    #[test]
    fn test_relay_flags() {
        let (dispatcher, _) = setup();
        assert!(dispatcher.relays(CommandType::EntityCreate));
        assert!(dispatcher.relays(CommandType::CustomChange));
        assert!(!dispatcher.relays(CommandType::Ping));
        assert!(!dispatcher.handles(CommandType::WorldTransfer));
    }

    #[test]
    fn test_forget_peer_discards_stats() {
        let (mut dispatcher, mut host) = setup();
        dispatcher.dispatch(&create(), Some(PeerId(5)), &mut host).unwrap();
        dispatcher.record_relay(PeerId(5));
        assert_eq!(dispatcher.stats(PeerId(5)).unwrap().relayed, 1);

        dispatcher.forget_peer(PeerId(5));
        assert!(dispatcher.stats(PeerId(5)).is_none());
        assert_eq!(dispatcher.totals().dispatched, 1);
    }
}
