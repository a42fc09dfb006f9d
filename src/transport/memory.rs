use super::{DeliveryMethod, DisconnectReason, PeerId, Transport, TransportEvent};
use crate::error::{Result, SyncError};
use ahash::AHashMap;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

type EndpointId = u64;

struct Link {
    remote_endpoint: EndpointId,
    remote_peer: PeerId,
    established: bool,
    addr: String,
}

#[derive(Default)]
struct Endpoint {
    inbox: VecDeque<TransportEvent>,
    links: BTreeMap<PeerId, Link>,
    next_peer: u64,
    listening: Option<u16>,
    running: bool,
}

impl Endpoint {
    fn allocate_peer(&mut self) -> PeerId {
        self.next_peer += 1;
        PeerId(self.next_peer)
    }
}

#[derive(Default)]
struct Hub {
    endpoints: AHashMap<EndpointId, Endpoint>,
    listeners: AHashMap<u16, EndpointId>,
    next_endpoint: EndpointId,
}

impl Hub {
    fn endpoint(&mut self, id: EndpointId) -> &mut Endpoint {
        self.endpoints.entry(id).or_default()
    }

    fn push(&mut self, id: EndpointId, event: TransportEvent) {
        self.endpoint(id).inbox.push_back(event);
    }

    fn unlink(&mut self, id: EndpointId, peer: PeerId) -> Option<Link> {
        self.endpoint(id).links.remove(&peer)
    }
}

/// In-process network. Every [`MemoryTransport`] created from the same
/// network can reach the others by port; delivery is reliable and ordered.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> MemoryTransport {
        let mut hub = self.lock();
        hub.next_endpoint += 1;
        let id = hub.next_endpoint;
        hub.endpoints.insert(id, Endpoint::default());

        MemoryTransport {
            network: self.clone(),
            id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    id: EndpointId,
}

impl MemoryTransport {
    fn addr(id: EndpointId) -> String {
        format!("memory:{}", id)
    }

    /// Drops the link without any notice to either side's protocol layer.
    /// Both transports report the peer as timed out.
    pub fn sever(&mut self, peer: PeerId) {
        let mut hub = self.network.lock();
        if let Some(link) = hub.unlink(self.id, peer) {
            hub.unlink(link.remote_endpoint, link.remote_peer);
            hub.push(link.remote_endpoint, TransportEvent::Disconnected {
                peer: link.remote_peer,
                reason: DisconnectReason::Timeout,
            });
            hub.push(self.id, TransportEvent::Disconnected {
                peer,
                reason: DisconnectReason::Timeout,
            });
        }
    }

    pub fn report_latency(&mut self, peer: PeerId, millis: u32) {
        let mut hub = self.network.lock();
        hub.push(self.id, TransportEvent::LatencyUpdate { peer, millis });
    }

    pub fn report_error(&mut self, addr: &str, message: &str) {
        let mut hub = self.network.lock();
        hub.push(self.id, TransportEvent::NetworkError {
            addr: addr.to_string(),
            message: message.to_string(),
        });
    }
}

impl Transport for MemoryTransport {
    fn listen(&mut self, port: u16) -> Result<()> {
        let mut hub = self.network.lock();
        if let Some(owner) = hub.listeners.get(&port) {
            if *owner != self.id {
                return Err(SyncError::TransportStartFailure(format!("port {} already in use", port)));
            }
        }

        hub.listeners.insert(port, self.id);
        let endpoint = hub.endpoint(self.id);
        endpoint.listening = Some(port);
        endpoint.running = true;
        Ok(())
    }

    fn connect(&mut self, host: &str, port: u16, key: &str) -> Result<PeerId> {
        let mut hub = self.network.lock();
        let server = *hub
            .listeners
            .get(&port)
            .ok_or_else(|| SyncError::Transport(format!("connection refused by {}:{}", host, port)))?;

        let client = self.id;
        let client_peer = hub.endpoint(client).allocate_peer();
        let server_peer = hub.endpoint(server).allocate_peer();

        let client_endpoint = hub.endpoint(client);
        client_endpoint.running = true;
        client_endpoint.links.insert(client_peer, Link {
            remote_endpoint: server,
            remote_peer: server_peer,
            established: false,
            addr: Self::addr(server),
        });
        hub.endpoint(server).links.insert(server_peer, Link {
            remote_endpoint: client,
            remote_peer: client_peer,
            established: false,
            addr: Self::addr(client),
        });

        hub.push(server, TransportEvent::ConnectionRequest {
            peer: server_peer,
            addr: Self::addr(client),
            key: key.to_string(),
        });

        Ok(client_peer)
    }

    fn accept(&mut self, peer: PeerId) -> Result<()> {
        let mut hub = self.network.lock();
        let (remote_endpoint, remote_peer, addr) = {
            let link = hub
                .endpoint(self.id)
                .links
                .get_mut(&peer)
                .ok_or(SyncError::PeerDisconnected(peer.0))?;
            link.established = true;
            (link.remote_endpoint, link.remote_peer, link.addr.clone())
        };

        let remote_addr = Self::addr(self.id);
        if let Some(remote) = hub.endpoint(remote_endpoint).links.get_mut(&remote_peer) {
            remote.established = true;
        }

        hub.push(self.id, TransportEvent::Connected { peer, addr });
        hub.push(remote_endpoint, TransportEvent::Connected {
            peer: remote_peer,
            addr: remote_addr,
        });
        Ok(())
    }

    fn reject(&mut self, peer: PeerId) -> Result<()> {
        let mut hub = self.network.lock();
        if let Some(link) = hub.unlink(self.id, peer) {
            hub.unlink(link.remote_endpoint, link.remote_peer);
            hub.push(link.remote_endpoint, TransportEvent::Disconnected {
                peer: link.remote_peer,
                reason: DisconnectReason::ConnectionRejected,
            });
        }
        Ok(())
    }

    fn send_to(&mut self, peer: PeerId, data: Bytes, method: DeliveryMethod) -> Result<()> {
        let mut hub = self.network.lock();
        let (remote_endpoint, remote_peer) = match hub.endpoint(self.id).links.get(&peer) {
            Some(link) if link.established => (link.remote_endpoint, link.remote_peer),
            _ => return Err(SyncError::PeerDisconnected(peer.0)),
        };

        hub.push(remote_endpoint, TransportEvent::Receive {
            peer: remote_peer,
            data,
            method,
        });
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId, notice: Option<Bytes>) -> Result<()> {
        let mut hub = self.network.lock();
        let Some(link) = hub.unlink(self.id, peer) else {
            return Ok(());
        };

        if hub.unlink(link.remote_endpoint, link.remote_peer).is_some() {
            if let Some(data) = notice {
                hub.push(link.remote_endpoint, TransportEvent::Receive {
                    peer: link.remote_peer,
                    data,
                    method: DeliveryMethod::ReliableOrdered,
                });
            }
            hub.push(link.remote_endpoint, TransportEvent::Disconnected {
                peer: link.remote_peer,
                reason: DisconnectReason::RemoteClose,
            });
        }

        hub.push(self.id, TransportEvent::Disconnected {
            peer,
            reason: DisconnectReason::LocalClose,
        });
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<TransportEvent> {
        let mut hub = self.network.lock();
        hub.endpoint(self.id).inbox.drain(..).collect()
    }

    fn has_pending_events(&self) -> bool {
        let hub = self.network.lock();
        hub.endpoints
            .get(&self.id)
            .map(|e| !e.inbox.is_empty())
            .unwrap_or(false)
    }

    fn peers(&self) -> Vec<PeerId> {
        let hub = self.network.lock();
        hub.endpoints
            .get(&self.id)
            .map(|e| {
                e.links
                    .iter()
                    .filter(|(_, link)| link.established)
                    .map(|(peer, _)| *peer)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn peer_addr(&self, peer: PeerId) -> Option<String> {
        let hub = self.network.lock();
        hub.endpoints.get(&self.id)?.links.get(&peer).map(|l| l.addr.clone())
    }

    fn stop(&mut self) {
        let peers: Vec<PeerId> = {
            let mut hub = self.network.lock();
            hub.endpoint(self.id).links.keys().copied().collect()
        };

        for peer in peers {
            let _ = self.disconnect(peer, None);
        }

        let mut hub = self.network.lock();
        let port = {
            let endpoint = hub.endpoint(self.id);
            endpoint.running = false;
            endpoint.listening.take()
        };
        if let Some(port) = port {
            hub.listeners.remove(&port);
        }
    }

    fn is_running(&self) -> bool {
        let hub = self.network.lock();
        hub.endpoints.get(&self.id).map(|e| e.running).unwrap_or(false)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.stop();
        self.network.lock().endpoints.remove(&self.id);
    }
}
