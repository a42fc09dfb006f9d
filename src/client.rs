use crate::codec::{peek_type, CommandCodec};
use crate::config::ClientConfig;
use crate::debug;
use crate::dispatch::{CommandHandler, Dispatcher};
use crate::error::{Result, SyncError};
use crate::guard::ReentrancyGuard;
use crate::host::{NullStatus, StatusSink, WorldHost};
use crate::protocol::{now_millis, Command, WorldChange, WorldTransferCommand};
use crate::transfer::{ChunkOutcome, WorldReceiver};
use crate::transport::{DeliveryMethod, DisconnectReason, PeerId, Transport, TransportEvent};
use bytes::Bytes;
use std::fmt;
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Downloading,
    Loading,
    Connected,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Connecting => "connecting",
            ClientStatus::Downloading => "downloading world",
            ClientStatus::Loading => "loading world",
            ClientStatus::Connected => "connected",
        };
        f.write_str(name)
    }
}

pub struct Client<T: Transport, H: WorldHost, S: StatusSink = NullStatus> {
    transport: T,
    host: H,
    status: S,
    config: ClientConfig,
    state: ClientStatus,
    server: Option<PeerId>,
    dispatcher: Dispatcher,
    guard: ReentrancyGuard,
    receiver: Option<WorldReceiver>,
    players: Vec<String>,
    held_changes: Vec<Command>,
    last_heard: Option<Instant>,
    latency_millis: u32,
}

impl<T: Transport, H: WorldHost, S: StatusSink> Client<T, H, S> {
    pub fn new(transport: T, host: H, status: S) -> Self {
        Self::with_guard(transport, host, status, ReentrancyGuard::new())
    }

    pub fn with_guard(transport: T, host: H, status: S, guard: ReentrancyGuard) -> Self {
        Self {
            transport,
            host,
            status,
            config: ClientConfig::default(),
            state: ClientStatus::Disconnected,
            server: None,
            dispatcher: Dispatcher::with_world_handlers(CommandCodec::default(), guard.clone()),
            guard,
            receiver: None,
            players: Vec::new(),
            held_changes: Vec::new(),
            last_heard: None,
            latency_millis: 0,
        }
    }

    pub fn register_handler(&mut self, handler: Box<dyn CommandHandler>) {
        self.dispatcher.register(handler);
    }

    /// Opens the transport link. The handshake itself runs inside later
    /// ticks once the transport reports the link established.
    pub fn connect(&mut self, config: ClientConfig) -> Result<()> {
        if self.state != ClientStatus::Disconnected {
            return Err(SyncError::Transport(format!("client is already {}", self.state)));
        }
        config.validate()?;

        let server = self
            .transport
            .connect(&config.host, config.port, &config.connection_key)?;

        self.dispatcher.set_codec(CommandCodec::new(config.format));
        self.receiver = Some(WorldReceiver::new(config.download_path.clone()));
        self.server = Some(server);
        self.state = ClientStatus::Connecting;

        tracing::info!("Connecting to {}:{} as '{}'", config.host, config.port, config.username);
        self.status
            .message(&format!("Connecting to {}:{}", config.host, config.port));
        self.config = config;
        Ok(())
    }

    /// Leaves the session, telling the server why.
    pub fn disconnect(&mut self) {
        if let Some(server) = self.server {
            let notice = self.dispatcher.encode(&Command::close("Client left")).ok();
            if let Err(e) = self.transport.disconnect(server, notice) {
                tracing::debug!("Disconnect from {} failed: {}", server, e);
            }
        }
        self.teardown("left the session");
    }

    pub fn tick(&mut self, now: Instant) -> usize {
        let events = self.transport.drain_events();
        let handled = events.len();
        for event in events {
            self.handle_event(event, now);
        }

        self.host.simulation_step();
        handled
    }

    /// Sends a locally-authored change to the server. Returns `Ok(false)`
    /// when the change is the host re-observing a remote apply.
    pub fn on_local_change(&mut self, change: WorldChange) -> Result<bool> {
        if self.guard.is_set() {
            tracing::trace!("Dropping {} raised during a remote apply", change.command_type());
            return Ok(false);
        }
        if self.state != ClientStatus::Connected {
            return Err(SyncError::NotConnected);
        }

        let command = Command::from(change);
        debug::log_command("Sent", &command);
        self.send(&command)?;
        Ok(true)
    }

    pub fn state(&self) -> ClientStatus {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientStatus::Connected
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Other participants as announced by the server, host first.
    pub fn players(&self) -> &[String] {
        &self.players
    }

    pub fn progress(&self) -> Option<(u32, u32)> {
        self.receiver.as_ref().map(|r| r.progress())
    }

    pub fn latency_millis(&self) -> u32 {
        self.latency_millis
    }

    pub fn last_heard(&self) -> Option<Instant> {
        self.last_heard
    }

    pub fn guard(&self) -> ReentrancyGuard {
        self.guard.clone()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn status(&self) -> &S {
        &self.status
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn has_pending_events(&self) -> bool {
        self.transport.has_pending_events()
    }

    fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected { peer, addr } if Some(peer) == self.server => {
                tracing::info!("Connected to {}, sending handshake", addr);
                let request = Command::connection_request(self.config.username.clone());
                if let Err(e) = self.send(&request) {
                    tracing::error!("Handshake to {} failed: {}", addr, e);
                    self.teardown("handshake failed");
                }
            }
            TransportEvent::ConnectionRequest { peer, addr, .. } => {
                tracing::warn!("Refusing inbound connection from {}", addr);
                if let Err(e) = self.transport.reject(peer) {
                    tracing::debug!("Reject of {} failed: {}", addr, e);
                }
            }
            TransportEvent::Receive { peer, data, .. } if Some(peer) == self.server => {
                let len = data.len();
                if let Err(e) = self.handle_receive(data.clone(), now) {
                    let kind = peek_type(&data).map(|t| t.name()).unwrap_or("unknown");
                    if e.is_per_message() {
                        tracing::warn!("Dropped {} ({} bytes) from server: {}", kind, len, e);
                    } else {
                        tracing::error!("Failed handling {} ({} bytes) from server: {}", kind, len, e);
                    }
                }
            }
            TransportEvent::Disconnected { peer, reason } if Some(peer) == self.server => {
                if reason == DisconnectReason::ConnectionRejected {
                    tracing::warn!("Server rejected the connection");
                    self.status.message("Connection rejected by server");
                } else {
                    self.status.message(&format!("Disconnected: {}", reason));
                }
                self.teardown(&reason.to_string());
            }
            TransportEvent::NetworkError { addr, message } => {
                tracing::warn!("Network error from {}: {}", addr, message);
            }
            TransportEvent::LatencyUpdate { peer, millis } if Some(peer) == self.server => {
                self.latency_millis = millis;
            }
            other => tracing::trace!("Ignoring {:?}", other),
        }
    }

    fn handle_receive(&mut self, data: Bytes, now: Instant) -> Result<()> {
        debug::trace_transport_receive(data.len(), "server");
        let command = self.dispatcher.decode(&data)?;
        debug::log_command("Received", &command);
        self.last_heard = Some(now);

        match command {
            Command::ConnectionResult(result) if result.success => {
                if self.state == ClientStatus::Connecting {
                    self.state = ClientStatus::Downloading;
                    tracing::info!("Handshake accepted, downloading world");
                    self.status.message("Downloading world");
                }
                Ok(())
            }
            Command::ConnectionResult(result) => {
                let reason = result.reason.unwrap_or_else(|| "no reason given".to_string());
                self.status.message(&format!("Connection refused: {}", reason));
                self.teardown("refused");
                Err(SyncError::HandshakeRejected(reason))
            }
            Command::ConnectionClose(close) => {
                tracing::info!("Server closed the session: {}", close.reason);
                self.status.message(&format!("Disconnected: {}", close.reason));
                if let Some(server) = self.server {
                    self.transport.disconnect(server, None)?;
                }
                self.teardown(&close.reason);
                Ok(())
            }
            Command::Ping(ping) => self.send(&Command::pong(ping.timestamp_millis)),
            Command::Pong(pong) => {
                let latency = now_millis().saturating_sub(pong.timestamp_millis);
                self.latency_millis = latency.min(u32::MAX as u64) as u32;
                Ok(())
            }
            Command::WorldTransfer(chunk) => self.handle_chunk(chunk),
            Command::PlayerJoined(joined) => {
                self.status.player_joined(&joined.username);
                self.players.push(joined.username);
                Ok(())
            }
            Command::PlayerLeft(left) => {
                if let Some(pos) = self.players.iter().position(|name| *name == left.username) {
                    self.players.remove(pos);
                }
                self.status.player_left(&left.username, &left.reason);
                Ok(())
            }
            Command::ConnectionRequest(_) => {
                tracing::warn!("Ignoring handshake request sent by the server");
                Ok(())
            }
            command => match self.state {
                ClientStatus::Connected => self.dispatcher.dispatch(&command, None, &mut self.host),
                ClientStatus::Downloading | ClientStatus::Loading => {
                    tracing::trace!("Holding {} until the world is loaded", command.command_type());
                    self.held_changes.push(command);
                    Ok(())
                }
                _ => {
                    tracing::warn!("Dropping {} while {}", command.command_type(), self.state);
                    Ok(())
                }
            },
        }
    }

    fn handle_chunk(&mut self, chunk: WorldTransferCommand) -> Result<()> {
        if self.state != ClientStatus::Downloading {
            tracing::warn!(
                "Ignoring world chunk {}/{} while {}",
                chunk.index,
                chunk.count,
                self.state
            );
            return Ok(());
        }
        let receiver = self.receiver.as_ref().ok_or(SyncError::NoActiveTransfer)?;

        if chunk.is_first() {
            receiver.start_transfer(chunk.count)?;
        }

        match receiver.write_chunk(chunk.index, chunk.count, &chunk.chunk) {
            Ok(ChunkOutcome::InProgress { current, max }) => {
                self.status.report_progress(current, max);
                Ok(())
            }
            Ok(ChunkOutcome::Complete { path, bytes }) => {
                self.status.report_progress(chunk.index, chunk.count);
                tracing::info!("World downloaded ({})", debug::format_bytes(bytes as usize));
                self.load_world(&path)
            }
            Err(e) => {
                tracing::error!("World download failed: {}", e);
                self.status.message("World download failed, reconnect to retry");
                self.disconnect();
                Err(e)
            }
        }
    }

    fn load_world(&mut self, path: &Path) -> Result<()> {
        self.state = ClientStatus::Loading;
        self.status.message("Loading world");

        if let Err(e) = self.host.load_world(path) {
            tracing::error!("Loading {} failed: {}", path.display(), e);
            self.status.message(&format!("World load failed: {}", e));
            self.disconnect();
            return Err(e.into());
        }

        self.state = ClientStatus::Connected;
        tracing::info!("World loaded, {} held changes to apply", self.held_changes.len());
        self.status.message("Connected");

        for command in std::mem::take(&mut self.held_changes) {
            if let Err(e) = self.dispatcher.dispatch(&command, None, &mut self.host) {
                tracing::warn!("Held {} failed to apply: {}", command.command_type(), e);
            }
        }
        Ok(())
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        let server = self.server.ok_or(SyncError::NotConnected)?;
        let data = self.dispatcher.encode(command)?;
        debug::trace_transport_send(data.len(), &server.to_string());
        self.transport.send_to(server, data, DeliveryMethod::ReliableOrdered)
    }

    fn teardown(&mut self, reason: &str) {
        if self.state == ClientStatus::Disconnected && self.server.is_none() {
            return;
        }

        if let Some(receiver) = &self.receiver {
            receiver.abort();
        }
        self.server = None;
        self.players.clear();
        self.held_changes.clear();
        self.dispatcher.forget_all();
        self.state = ClientStatus::Disconnected;
        tracing::info!("Session ended: {}", reason);
    }
}

impl<T: Transport, H: WorldHost, S: StatusSink> Drop for Client<T, H, S> {
    fn drop(&mut self) {
        if self.server.is_some() {
            self.disconnect();
        }
    }
}
