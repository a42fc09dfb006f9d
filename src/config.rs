use crate::error::{Result, SyncError};
use crate::lifecycle::{HEARTBEAT_INTERVAL, PEER_TIMEOUT};
use crate::serialization::BinaryFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4230;

/// When the server forwards a received change relative to applying it
/// locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPolicy {
    /// Forward before the local apply. Peers may apply a change the server
    /// itself failed to apply.
    BeforeApply,
    /// Forward only once the local apply succeeded.
    #[default]
    AfterApply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub username: String,
    pub connection_key: String,
    pub max_players: usize,
    pub chunks_per_tick: usize,
    pub relay_policy: RelayPolicy,
    pub format: BinaryFormat,
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
    /// Ask the gateway to forward `port` on start. Failure is only logged.
    pub port_mapping: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            username: "Host".to_string(),
            connection_key: String::new(),
            max_players: 16,
            chunks_per_tick: 4,
            relay_policy: RelayPolicy::default(),
            format: BinaryFormat::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            peer_timeout: PEER_TIMEOUT,
            port_mapping: true,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16, username: impl Into<String>, connection_key: impl Into<String>) -> Self {
        Self {
            port,
            username: username.into(),
            connection_key: connection_key.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(SyncError::InvalidConfig("username cannot be empty".to_string()));
        }
        if self.chunks_per_tick == 0 {
            return Err(SyncError::InvalidConfig("chunks_per_tick must be at least 1".to_string()));
        }
        if self.max_players == 0 {
            return Err(SyncError::InvalidConfig("max_players must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn with_max_players(mut self, max_players: usize) -> Self {
        self.max_players = max_players;
        self
    }

    pub fn with_chunks_per_tick(mut self, chunks: usize) -> Self {
        self.chunks_per_tick = chunks;
        self
    }

    pub fn with_relay_policy(mut self, policy: RelayPolicy) -> Self {
        self.relay_policy = policy;
        self
    }

    pub fn with_format(mut self, format: BinaryFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn with_port_mapping(mut self, enabled: bool) -> Self {
        self.port_mapping = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connection_key: String,
    /// Where the received world is reassembled before the host loads it.
    pub download_path: PathBuf,
    pub format: BinaryFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: "Player".to_string(),
            connection_key: String::new(),
            download_path: std::env::temp_dir().join("worldsync-download.sav"),
            format: BinaryFormat::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(SyncError::InvalidConfig("username cannot be empty".to_string()));
        }
        if self.host.is_empty() {
            return Err(SyncError::InvalidConfig("host cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_connection_key(mut self, key: impl Into<String>) -> Self {
        self.connection_key = key.into();
        self
    }

    pub fn with_download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = path.into();
        self
    }

    pub fn with_format(mut self, format: BinaryFormat) -> Self {
        self.format = format;
        self
    }
}
