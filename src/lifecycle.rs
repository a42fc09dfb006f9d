use crate::protocol::{ConnectionRequestCommand, PROTOCOL_VERSION};
use crate::session::{Player, SessionRegistry};
use crate::transport::PeerId;
use ahash::AHashMap;
use std::time::{Duration, Instant};

/// Interval between server pings and timeout sweeps.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// A player not heard from for longer than this is evicted.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15);

pub const MAX_USERNAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accept,
    Reject,
}

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    connection_key: String,
    heartbeat_interval: Duration,
    timeout: Duration,
    last_heartbeat: Option<Instant>,
}

impl LifecycleManager {
    pub fn new(connection_key: impl Into<String>) -> Self {
        Self {
            connection_key: connection_key.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            timeout: PEER_TIMEOUT,
            last_heartbeat: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Transport-level admission: only an exact key match is let in.
    pub fn accept(&self, key: &str) -> Acceptance {
        if key == self.connection_key {
            Acceptance::Accept
        } else {
            Acceptance::Reject
        }
    }

    /// Application-level handshake checks, run before a session exists.
    pub fn validate_handshake(&self, request: &ConnectionRequestCommand) -> Result<(), String> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version mismatch: server {}, client {}",
                PROTOCOL_VERSION, request.protocol_version
            ));
        }

        let username = request.username.trim();
        if username.is_empty() {
            return Err("username cannot be empty".to_string());
        }
        if username.len() > MAX_USERNAME_LEN {
            return Err(format!("username longer than {} bytes", MAX_USERNAME_LEN));
        }

        Ok(())
    }

    pub fn on_connected<'a>(
        &self,
        registry: &'a mut SessionRegistry,
        peer: PeerId,
        username: &str,
        now: Instant,
    ) -> &'a Player {
        let player = registry.add(peer, username.trim(), now);
        tracing::info!("Player '{}' (id={}) connected as {}", player.username, player.id, peer);
        player
    }

    /// Removes the session if it still exists. Returns `None` when the peer
    /// was already evicted, so callers run teardown at most once.
    pub fn on_disconnected(&self, registry: &mut SessionRegistry, peer: PeerId, reason: &str) -> Option<Player> {
        let player = registry.remove(peer)?;
        tracing::info!("Player '{}' (id={}) left: {}", player.username, player.id, reason);
        Some(player)
    }

    /// True once per interval; the first call is always due.
    pub fn heartbeat_due(&mut self, now: Instant) -> bool {
        match self.last_heartbeat {
            Some(last) if now.saturating_duration_since(last) < self.heartbeat_interval => false,
            _ => {
                self.last_heartbeat = Some(now);
                true
            }
        }
    }

    pub fn timed_out(&self, registry: &SessionRegistry, now: Instant) -> Vec<PeerId> {
        let mut stale: Vec<PeerId> = registry
            .iter()
            .filter(|p| now.saturating_duration_since(p.last_heartbeat_at) > self.timeout)
            .map(|p| p.peer)
            .collect();
        stale.sort();
        stale
    }

    /// Links let in at the transport level whose handshake never arrived.
    /// They hold a player slot, so they age out on the same timeout.
    pub fn handshake_expired(&self, awaiting: &AHashMap<PeerId, Instant>, now: Instant) -> Vec<PeerId> {
        let mut expired: Vec<PeerId> = awaiting
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) > self.timeout)
            .map(|(peer, _)| *peer)
            .collect();
        expired.sort();
        expired
    }

    pub fn reset(&mut self) {
        self.last_heartbeat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_requires_exact_key() {
        let lifecycle = LifecycleManager::new("secret");
        assert_eq!(lifecycle.accept("secret"), Acceptance::Accept);
        assert_eq!(lifecycle.accept("Secret"), Acceptance::Reject);
        assert_eq!(lifecycle.accept("secret "), Acceptance::Reject);
        assert_eq!(lifecycle.accept(""), Acceptance::Reject);
    }

    #[test]
    fn test_handshake_validation() {
        let lifecycle = LifecycleManager::new("k");
        let ok = ConnectionRequestCommand {
            username: "alice".to_string(),
            protocol_version: PROTOCOL_VERSION,
        };
        assert!(lifecycle.validate_handshake(&ok).is_ok());

        let old = ConnectionRequestCommand {
            protocol_version: PROTOCOL_VERSION + 1,
            ..ok.clone()
        };
        assert!(lifecycle.validate_handshake(&old).is_err());

        let blank = ConnectionRequestCommand {
            username: "   ".to_string(),
            ..ok
        };
        assert!(lifecycle.validate_handshake(&blank).is_err());
    }

    #[test]
    fn test_heartbeat_cadence() {
        let mut lifecycle = LifecycleManager::new("k");
        let start = Instant::now();

        assert!(lifecycle.heartbeat_due(start));
        assert!(!lifecycle.heartbeat_due(start + Duration::from_millis(50)));
        assert!(lifecycle.heartbeat_due(start + HEARTBEAT_INTERVAL));
        assert!(!lifecycle.heartbeat_due(start + HEARTBEAT_INTERVAL + Duration::from_millis(99)));
    }

    #[test]
    fn test_timeout_detection() {
        let lifecycle = LifecycleManager::new("k");
        let mut registry = SessionRegistry::new();
        let start = Instant::now();
        registry.add(PeerId(1), "quiet", start);
        registry.add(PeerId(2), "chatty", start);
        registry.touch(PeerId(2), start + Duration::from_secs(10));

        assert!(lifecycle.timed_out(&registry, start + PEER_TIMEOUT).is_empty());

        let later = start + PEER_TIMEOUT + Duration::from_millis(1);
        assert_eq!(lifecycle.timed_out(&registry, later), vec![PeerId(1)]);
    }

    #[test]
    fn test_handshake_expiry() {
        let lifecycle = LifecycleManager::new("k").with_timeout(Duration::from_secs(2));
        let start = Instant::now();
        let mut awaiting = AHashMap::new();
        awaiting.insert(PeerId(4), start);
        awaiting.insert(PeerId(3), start + Duration::from_secs(1));

        assert!(lifecycle.handshake_expired(&awaiting, start + Duration::from_secs(2)).is_empty());
        assert_eq!(
            lifecycle.handshake_expired(&awaiting, start + Duration::from_millis(2500)),
            vec![PeerId(4)]
        );
        assert_eq!(
            lifecycle.handshake_expired(&awaiting, start + Duration::from_secs(4)),
            vec![PeerId(3), PeerId(4)]
        );
    }

    #[test]
    fn test_disconnect_runs_once() {
        let lifecycle = LifecycleManager::new("k");
        let mut registry = SessionRegistry::new();
        lifecycle.on_connected(&mut registry, PeerId(9), " dave ", Instant::now());
        assert!(registry.find_by_username("dave").is_some());

        assert!(lifecycle.on_disconnected(&mut registry, PeerId(9), "timeout").is_some());
        assert!(lifecycle.on_disconnected(&mut registry, PeerId(9), "transport error").is_none());
        assert!(registry.find_by_username("dave").is_none());
    }
}
