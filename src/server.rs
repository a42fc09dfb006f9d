use crate::codec::{peek_type, CommandCodec};
use crate::config::{RelayPolicy, ServerConfig};
use crate::debug;
use crate::dispatch::{CommandHandler, Dispatcher};
use crate::error::{Result, SyncError};
use crate::guard::ReentrancyGuard;
use crate::host::{NullStatus, StatusSink, WorldHost};
use crate::lifecycle::{Acceptance, LifecycleManager};
use crate::nat::{self, PortMapper};
use crate::protocol::{now_millis, Command, ConnectionRequestCommand, WorldChange};
use crate::session::SessionRegistry;
use crate::transfer::OutgoingTransfer;
use crate::transport::{DeliveryMethod, PeerId, Transport, TransportEvent};
use ahash::AHashMap;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Instant;

pub struct Server<T: Transport, H: WorldHost, S: StatusSink = NullStatus> {
    transport: T,
    host: H,
    status: S,
    config: ServerConfig,
    running: bool,
    lifecycle: LifecycleManager,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    guard: ReentrancyGuard,
    awaiting_handshake: AHashMap<PeerId, Instant>,
    outgoing: BTreeMap<PeerId, OutgoingTransfer>,
    port_mapper: Box<dyn PortMapper>,
    mapped_port: Option<u16>,
}

impl<T: Transport, H: WorldHost, S: StatusSink> Server<T, H, S> {
    pub fn new(transport: T, host: H, status: S) -> Self {
        Self::with_guard(transport, host, status, ReentrancyGuard::new())
    }

    /// Uses a guard the host already holds, so its broadcast path sees the
    /// same flag the dispatcher raises.
    pub fn with_guard(transport: T, host: H, status: S, guard: ReentrancyGuard) -> Self {
        Self {
            transport,
            host,
            status,
            config: ServerConfig::default(),
            running: false,
            lifecycle: LifecycleManager::new(String::new()),
            registry: SessionRegistry::new(),
            dispatcher: Dispatcher::with_world_handlers(CommandCodec::default(), guard.clone()),
            guard,
            awaiting_handshake: AHashMap::new(),
            outgoing: BTreeMap::new(),
            port_mapper: nat::default_port_mapper(),
            mapped_port: None,
        }
    }

    pub fn set_port_mapper(&mut self, mapper: Box<dyn PortMapper>) {
        self.port_mapper = mapper;
    }

    pub fn register_handler(&mut self, handler: Box<dyn CommandHandler>) {
        self.dispatcher.register(handler);
    }

    /// Binds the transport and starts accepting players. A running server is
    /// stopped first and restarted with `config`. On failure the reason is
    /// logged and reported to the status sink, and the server stays stopped.
    pub fn start(&mut self, config: ServerConfig) -> bool {
        if self.running {
            tracing::info!("Restarting server (was on port {})", self.config.port);
            self.stop();
        }

        if let Err(e) = config.validate().and_then(|_| self.transport.listen(config.port)) {
            tracing::error!("Server failed to start on port {}: {}", config.port, e);
            self.status.message(&format!("Server failed to start: {}", e));
            return false;
        }

        self.lifecycle = LifecycleManager::new(config.connection_key.clone())
            .with_heartbeat_interval(config.heartbeat_interval)
            .with_timeout(config.peer_timeout);
        self.dispatcher.set_codec(CommandCodec::new(config.format));
        self.running = true;

        tracing::info!(
            "Server '{}' listening on port {} ({} payloads)",
            config.username,
            config.port,
            config.format.name()
        );
        if config.port_mapping {
            match self.port_mapper.map_port(config.port) {
                Ok(()) => {
                    tracing::info!("Port {} mapped on the gateway", config.port);
                    self.mapped_port = Some(config.port);
                }
                Err(e) => tracing::warn!(
                    "Failed to open port {} automatically, forward it manually for remote players: {}",
                    config.port,
                    e
                ),
            }
        }
        self.status.message(&format!("Server started on port {}", config.port));
        self.config = config;
        true
    }

    /// Tells every peer the session is over and drops all session state.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }

        let notice = self.encode(&Command::close("Server stopped")).ok();
        let mut peers: Vec<PeerId> = self.registry.iter().map(|p| p.peer).collect();
        peers.extend(self.awaiting_handshake.keys().copied());
        peers.sort();
        for peer in peers {
            if let Err(e) = self.transport.disconnect(peer, notice.clone()) {
                tracing::debug!("Disconnect of {} during stop failed: {}", peer, e);
            }
        }

        self.transport.stop();
        self.transport.drain_events();

        if let Some(port) = self.mapped_port.take() {
            self.port_mapper.unmap_port(port);
        }

        self.registry.clear();
        self.awaiting_handshake.clear();
        self.outgoing.clear();
        self.dispatcher.forget_all();
        self.lifecycle.reset();
        self.running = false;

        tracing::info!("Server stopped");
        self.status.message("Server stopped");
    }

    /// One processing step. Returns the number of transport events handled.
    pub fn tick(&mut self, now: Instant) -> usize {
        if !self.running {
            return 0;
        }

        let events = self.transport.drain_events();
        let handled = events.len();
        for event in events {
            self.handle_event(event, now);
        }

        if self.lifecycle.heartbeat_due(now) {
            self.send_heartbeats();
            self.evict_timed_out(now);
        }

        self.pump_transfers();
        self.host.simulation_step();
        handled
    }

    /// Broadcasts a locally-authored change to every player. Returns
    /// `Ok(false)` when the change is the host re-observing a remote apply.
    pub fn on_local_change(&mut self, change: WorldChange) -> Result<bool> {
        if self.guard.is_set() {
            tracing::trace!("Dropping {} raised during a remote apply", change.command_type());
            return Ok(false);
        }
        if !self.running {
            return Err(SyncError::NotRunning);
        }

        let command = Command::from(change);
        debug::log_command("Sent", &command);
        let data = self.encode(&command)?;
        self.broadcast_bytes(data, None);
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The host's own name followed by every connected player, in join order.
    pub fn player_list(&self) -> Vec<String> {
        if !self.running {
            return Vec::new();
        }
        let mut names = vec![self.config.username.clone()];
        names.extend(self.registry.usernames());
        names
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
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

    pub fn is_sending_world(&self, peer: PeerId) -> bool {
        self.outgoing.contains_key(&peer)
    }

    fn encode(&self, command: &Command) -> Result<Bytes> {
        self.dispatcher.encode(command)
    }

    fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::ConnectionRequest { peer, addr, key } => {
                self.handle_connection_request(peer, &addr, &key, now)
            }
            TransportEvent::Connected { peer, addr } => {
                tracing::debug!("Transport link to {} established as {}", addr, peer);
            }
            TransportEvent::Receive { peer, data, .. } => {
                let len = data.len();
                if let Err(e) = self.handle_receive(peer, data.clone(), now) {
                    let kind = peek_type(&data).map(|t| t.name()).unwrap_or("unknown");
                    let addr = self.peer_label(peer);
                    if e.is_per_message() {
                        tracing::warn!("Dropped {} ({} bytes) from {}: {}", kind, len, addr, e);
                    } else {
                        tracing::error!("Failed handling {} ({} bytes) from {}: {}", kind, len, addr, e);
                    }
                }
            }
            TransportEvent::Disconnected { peer, reason } => {
                self.teardown(peer, &reason.to_string());
            }
            TransportEvent::NetworkError { addr, message } => {
                tracing::warn!("Network error from {}: {}", addr, message);
            }
            TransportEvent::LatencyUpdate { peer, millis } => {
                self.registry.set_latency(peer, millis);
            }
        }
    }

    /// Accepted links count against `max_players` from the moment they are
    /// let in, so requests drained in the same tick cannot overfill.
    fn handle_connection_request(&mut self, peer: PeerId, addr: &str, key: &str, now: Instant) {
        if self.lifecycle.accept(key) == Acceptance::Reject {
            tracing::warn!("Rejected connection from {}: wrong connection key", addr);
            if let Err(e) = self.transport.reject(peer) {
                tracing::debug!("Reject of {} failed: {}", addr, e);
            }
            return;
        }

        if self.registry.len() + self.awaiting_handshake.len() >= self.config.max_players {
            tracing::warn!("Rejected connection from {}: server full ({} players)", addr, self.config.max_players);
            if let Err(e) = self.transport.reject(peer) {
                tracing::debug!("Reject of {} failed: {}", addr, e);
            }
            return;
        }

        match self.transport.accept(peer) {
            Ok(()) => {
                self.awaiting_handshake.insert(peer, now);
            }
            Err(e) => tracing::warn!("Accepting {} failed: {}", addr, e),
        }
    }

    fn handle_receive(&mut self, peer: PeerId, data: Bytes, now: Instant) -> Result<()> {
        debug::trace_transport_receive(data.len(), &self.peer_label(peer));
        let command = self.dispatcher.decode(&data)?;
        debug::log_command("Received", &command);

        if !self.registry.contains(peer) {
            return match command {
                Command::ConnectionRequest(request) => self.handshake(peer, request, now),
                other => {
                    tracing::warn!(
                        "Dropping {} from {} before handshake",
                        other.command_type(),
                        self.peer_label(peer)
                    );
                    Ok(())
                }
            };
        }

        self.registry.touch(peer, now);

        match command {
            Command::ConnectionRequest(_) => {
                tracing::warn!("Ignoring repeated handshake from {}", self.peer_label(peer));
                Ok(())
            }
            Command::Ping(ping) => self.send(peer, &Command::pong(ping.timestamp_millis)),
            Command::Pong(pong) => {
                let latency = now_millis().saturating_sub(pong.timestamp_millis);
                self.registry.set_latency(peer, latency.min(u32::MAX as u64) as u32);
                Ok(())
            }
            Command::ConnectionClose(close) => {
                self.teardown(peer, &close.reason);
                self.transport.disconnect(peer, None)
            }
            command => self.dispatch_and_relay(peer, &command, data),
        }
    }

    fn handshake(&mut self, peer: PeerId, request: ConnectionRequestCommand, now: Instant) -> Result<()> {
        self.awaiting_handshake.remove(&peer);

        let verdict = self.lifecycle.validate_handshake(&request).and_then(|_| {
            if self.registry.len() >= self.config.max_players {
                Err(format!("server full ({} players)", self.config.max_players))
            } else {
                Ok(())
            }
        });
        if let Err(reason) = verdict {
            let notice = self.encode(&Command::refused(reason.clone()))?;
            self.transport.disconnect(peer, Some(notice))?;
            return Err(SyncError::HandshakeRejected(reason));
        }

        let username = self
            .lifecycle
            .on_connected(&mut self.registry, peer, &request.username, now)
            .username
            .clone();

        self.send(peer, &Command::accepted())?;

        let mut others: Vec<_> = self
            .registry
            .iter()
            .filter(|p| p.peer != peer)
            .map(|p| (p.id, p.username.clone()))
            .collect();
        others.sort();
        let host_name = self.config.username.clone();
        for name in std::iter::once(host_name).chain(others.into_iter().map(|(_, name)| name)) {
            self.send(peer, &Command::player_joined(name))?;
        }

        let joined = self.encode(&Command::player_joined(username.clone()))?;
        self.broadcast_bytes(joined, Some(peer));
        self.status.player_joined(&username);

        match self.host.world_snapshot() {
            Ok(source) => {
                let transfer = OutgoingTransfer::new(source);
                tracing::info!("Sending world to '{}' in {} chunks", username, transfer.chunk_count());
                self.outgoing.insert(peer, transfer);
            }
            Err(e) => {
                tracing::error!("No world to send to '{}': {}", username, e);
                self.evict(peer, "world unavailable");
            }
        }
        Ok(())
    }

    fn dispatch_and_relay(&mut self, peer: PeerId, command: &Command, data: Bytes) -> Result<()> {
        let relay = self.dispatcher.relays(command.command_type());

        if relay && self.config.relay_policy == RelayPolicy::BeforeApply {
            self.relay(peer, data.clone());
        }

        self.dispatcher.dispatch(command, Some(peer), &mut self.host)?;

        if relay && self.config.relay_policy == RelayPolicy::AfterApply {
            self.relay(peer, data);
        }
        Ok(())
    }

    /// Forwards the received bytes unchanged to every player but the origin.
    fn relay(&mut self, origin: PeerId, data: Bytes) {
        let sent = self.broadcast_bytes(data, Some(origin));
        if sent > 0 {
            self.dispatcher.record_relay(origin);
        }
    }

    fn broadcast_bytes(&mut self, data: Bytes, except: Option<PeerId>) -> usize {
        let mut peers: Vec<PeerId> = self.registry.iter().map(|p| p.peer).collect();
        peers.sort();

        let mut sent = 0;
        for peer in peers.into_iter().filter(|p| Some(*p) != except) {
            match self.transport.send_to(peer, data.clone(), DeliveryMethod::ReliableOrdered) {
                Ok(()) => {
                    debug::trace_transport_send(data.len(), &peer.to_string());
                    sent += 1;
                }
                Err(e) => tracing::warn!("Broadcast to {} failed: {}", peer, e),
            }
        }
        sent
    }

    fn send(&mut self, peer: PeerId, command: &Command) -> Result<()> {
        let data = self.encode(command)?;
        debug::trace_transport_send(data.len(), &peer.to_string());
        self.transport.send_to(peer, data, DeliveryMethod::ReliableOrdered)
    }

    fn send_heartbeats(&mut self) {
        let ping = match self.encode(&Command::ping(now_millis())) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Failed to encode ping: {}", e);
                return;
            }
        };
        self.broadcast_bytes(ping, None);
    }

    fn evict_timed_out(&mut self, now: Instant) {
        for peer in self.lifecycle.handshake_expired(&self.awaiting_handshake, now) {
            tracing::warn!(
                "{} sent no handshake within {:?}",
                self.peer_label(peer),
                self.lifecycle.timeout()
            );
            self.evict(peer, "handshake timed out");
        }

        for peer in self.lifecycle.timed_out(&self.registry, now) {
            tracing::warn!(
                "{} timed out after {:?} without a heartbeat",
                self.peer_label(peer),
                self.lifecycle.timeout()
            );
            self.evict(peer, "timed out");
        }
    }

    /// Sends a close notice, drops the transport link and tears the session
    /// down. Safe to call for a peer that is already gone.
    fn evict(&mut self, peer: PeerId, reason: &str) {
        let notice = self.encode(&Command::close(reason)).ok();
        if let Err(e) = self.transport.disconnect(peer, notice) {
            tracing::debug!("Disconnect of {} failed: {}", peer, e);
        }
        self.teardown(peer, reason);
    }

    fn teardown(&mut self, peer: PeerId, reason: &str) {
        self.awaiting_handshake.remove(&peer);
        self.outgoing.remove(&peer);
        self.dispatcher.forget_peer(peer);

        if let Some(player) = self.lifecycle.on_disconnected(&mut self.registry, peer, reason) {
            if let Ok(left) = self.encode(&Command::player_left(player.username.clone(), reason)) {
                self.broadcast_bytes(left, None);
            }
            self.status.player_left(&player.username, reason);
        }
    }

    fn pump_transfers(&mut self) {
        let peers: Vec<PeerId> = self.outgoing.keys().copied().collect();
        let mut failed = Vec::new();

        for peer in peers {
            let Some(transfer) = self.outgoing.get_mut(&peer) else {
                continue;
            };

            for _ in 0..self.config.chunks_per_tick {
                let Some(next) = transfer.next_command() else {
                    break;
                };
                let sent = next
                    .and_then(|command| self.dispatcher.encode(&command))
                    .and_then(|data| self.transport.send_to(peer, data, DeliveryMethod::ReliableOrdered));
                if let Err(e) = sent {
                    tracing::error!(
                        "World chunk {}/{} to {} failed: {}",
                        transfer.next_index(),
                        transfer.chunk_count(),
                        peer,
                        e
                    );
                    failed.push(peer);
                    break;
                }
            }

            if transfer.is_done() {
                tracing::info!("World sent to {}", peer);
                self.outgoing.remove(&peer);
            }
        }

        for peer in failed {
            self.evict(peer, "world transfer failed");
        }
    }

    fn peer_label(&self, peer: PeerId) -> String {
        match self.transport.peer_addr(peer) {
            Some(addr) => format!("{} ({})", peer, addr),
            None => peer.to_string(),
        }
    }
}

impl<T: Transport, H: WorldHost, S: StatusSink> Drop for Server<T, H, S> {
    fn drop(&mut self) {
        self.stop();
    }
}
