use crate::protocol::PlayerId;
use crate::transport::PeerId;
use ahash::AHashMap;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
    pub last_heartbeat_at: Instant,
    pub latency_millis: u32,
    pub peer: PeerId,
}

/// Authoritative list of participants that completed the handshake.
///
/// Usernames are not required to be unique; [`find_by_username`] returns the
/// earliest-joined match.
///
/// [`find_by_username`]: SessionRegistry::find_by_username
#[derive(Debug, Default)]
pub struct SessionRegistry {
    players: AHashMap<PeerId, Player>,
    next_id: PlayerId,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: PeerId, username: impl Into<String>, now: Instant) -> &Player {
        self.next_id += 1;
        let player = Player {
            id: self.next_id,
            username: username.into(),
            last_heartbeat_at: now,
            latency_millis: 0,
            peer,
        };
        self.players.insert(peer, player);
        &self.players[&peer]
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<Player> {
        self.players.remove(&peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<&Player> {
        self.players.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut Player> {
        self.players.get_mut(&peer)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.players.contains_key(&peer)
    }

    pub fn find_by_username(&self, username: &str) -> Option<&Player> {
        self.players
            .values()
            .filter(|p| p.username == username)
            .min_by_key(|p| p.id)
    }

    pub fn touch(&mut self, peer: PeerId, now: Instant) -> bool {
        match self.players.get_mut(&peer) {
            Some(player) => {
                player.last_heartbeat_at = now;
                true
            }
            None => false,
        }
    }

    pub fn set_latency(&mut self, peer: PeerId, millis: u32) -> bool {
        match self.players.get_mut(&peer) {
            Some(player) => {
                player.latency_millis = millis;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Connected usernames ordered by join order.
    pub fn usernames(&self) -> Vec<String> {
        let mut players: Vec<&Player> = self.players.values().collect();
        players.sort_by_key(|p| p.id);
        players.into_iter().map(|p| p.username.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }
}
