use super::{DeliveryMethod, DisconnectReason, PeerId, Transport, TransportEvent};
use crate::error::{Result, SyncError};
use crate::serialization::{FrameReader, FrameWriter};
use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};

const FRAME_CONNECT: u8 = 1;
const FRAME_ACCEPT: u8 = 2;
const FRAME_REJECT: u8 = 3;
const FRAME_DATA: u8 = 4;
const FRAME_CLOSE: u8 = 5;

/// An inbound socket that sends no `CONNECT` frame within this window is
/// closed without ever being reported.
pub const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

const IO_THREADS: usize = 2;
const READ_BUFFER: usize = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    /// Server side: waiting for the owner to accept. Client side: waiting for
    /// the server's answer.
    Pending,
    Connected,
}

struct PeerLink {
    outbound: mpsc::UnboundedSender<Bytes>,
    addr: String,
    state: PeerState,
    // Dropped with the link, which stops the reader task.
    _alive: watch::Sender<()>,
}

type PeerMap = Arc<Mutex<AHashMap<PeerId, PeerLink>>>;

/// Event queue shared with socket tasks. The counter mirrors the channel
/// length so [`Transport::has_pending_events`] does not consume anything.
#[derive(Clone)]
struct EventQueue {
    tx: mpsc::UnboundedSender<TransportEvent>,
    pending: Arc<AtomicUsize>,
}

impl EventQueue {
    fn push(&self, event: TransportEvent) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(event).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[derive(Clone)]
struct Shared {
    peers: PeerMap,
    queue: EventQueue,
    greeting_timeout: Duration,
}

impl Shared {
    fn register(&self, peer: PeerId, addr: String, outbound: mpsc::UnboundedSender<Bytes>) -> watch::Receiver<()> {
        let (alive, alive_rx) = watch::channel(());
        lock(&self.peers).insert(peer, PeerLink {
            outbound,
            addr,
            state: PeerState::Pending,
            _alive: alive,
        });
        alive_rx
    }

    /// Removes the link and reports it. A link already removed elsewhere has
    /// been reported there.
    fn drop_link(&self, peer: PeerId, reason: DisconnectReason) {
        if lock(&self.peers).remove(&peer).is_some() {
            self.queue.push(TransportEvent::Disconnected { peer, reason });
        }
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        lock(&self.peers)
            .get(&peer)
            .map(|link| link.state == PeerState::Connected)
            .unwrap_or(false)
    }

    /// Returns the reason to close the link, if the frame ends it.
    fn on_frame(&self, peer: PeerId, addr: &str, frame: Bytes, server_side: bool, announced: &mut bool) -> Option<DisconnectReason> {
        let (&kind, body) = frame.split_first()?;

        match kind {
            FRAME_CONNECT if server_side && !*announced => {
                *announced = true;
                self.queue.push(TransportEvent::ConnectionRequest {
                    peer,
                    addr: addr.to_string(),
                    key: String::from_utf8_lossy(body).into_owned(),
                });
            }
            FRAME_ACCEPT if !server_side => {
                if let Some(link) = lock(&self.peers).get_mut(&peer) {
                    link.state = PeerState::Connected;
                }
                self.queue.push(TransportEvent::Connected {
                    peer,
                    addr: addr.to_string(),
                });
            }
            FRAME_REJECT if !server_side => return Some(DisconnectReason::ConnectionRejected),
            FRAME_DATA => {
                if self.is_connected(peer) {
                    self.queue.push(TransportEvent::Receive {
                        peer,
                        data: frame.slice(1..),
                        method: DeliveryMethod::ReliableOrdered,
                    });
                } else {
                    tracing::warn!("Dropping {} bytes from unaccepted {} ({})", body.len(), peer, addr);
                }
            }
            FRAME_CLOSE => {
                if !body.is_empty() {
                    self.queue.push(TransportEvent::Receive {
                        peer,
                        data: frame.slice(1..),
                        method: DeliveryMethod::ReliableOrdered,
                    });
                }
                return Some(DisconnectReason::RemoteClose);
            }
            other => {
                tracing::warn!("Unexpected frame kind {} from {} ({})", other, peer, addr);
            }
        }
        None
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn encode_frame(kind: u8, body: &[u8]) -> Result<Bytes> {
    let mut payload = BytesMut::with_capacity(1 + body.len());
    payload.put_u8(kind);
    payload.put_slice(body);

    let mut writer = FrameWriter::new();
    writer.write_frame(&payload)?;
    Ok(writer.flush())
}

async fn accept_loop(listener: TcpListener, mut alive: watch::Receiver<()>, shared: Shared, next_peer: Arc<AtomicU64>) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let peer = PeerId(next_peer.fetch_add(1, Ordering::Relaxed));
                    let (outbound, outbound_rx) = mpsc::unbounded_channel();
                    let link_alive = shared.register(peer, addr.to_string(), outbound);
                    tracing::debug!("Accepted socket {} from {}", peer, addr);
                    tokio::spawn(run_link(peer, addr.to_string(), stream, true, outbound_rx, link_alive, shared.clone()));
                }
                Err(e) => {
                    shared.queue.push(TransportEvent::NetworkError {
                        addr: "listener".to_string(),
                        message: e.to_string(),
                    });
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = alive.changed() => break,
        }
    }
    tracing::debug!("Listener task exiting");
}

async fn run_link(
    peer: PeerId,
    addr: String,
    stream: TcpStream,
    server_side: bool,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    alive: watch::Receiver<()>,
    shared: Shared,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay on {} failed: {}", peer, e);
    }
    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(peer, writer, outbound, shared.clone()));
    read_loop(peer, addr, reader, server_side, alive, shared).await;
}

/// Drains the peer's queue onto the socket. A failed write leaves a partial
/// frame behind, so the link is dropped rather than written to again.
async fn write_loop(peer: PeerId, mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>, shared: Shared) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!("Write to {} failed: {}", peer, e);
            shared.drop_link(peer, DisconnectReason::NetworkError(e.to_string()));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    peer: PeerId,
    addr: String,
    mut reader: OwnedReadHalf,
    server_side: bool,
    mut alive: watch::Receiver<()>,
    shared: Shared,
) {
    let mut frames = FrameReader::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let greeting = tokio::time::sleep(shared.greeting_timeout);
    tokio::pin!(greeting);
    let mut announced = !server_side;

    let reason = 'read: loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break 'read DisconnectReason::RemoteClose,
                Ok(n) => n,
                Err(e) => break 'read DisconnectReason::NetworkError(e.to_string()),
            },
            // Link removed locally; whoever removed it reported it.
            _ = alive.changed() => return,
            _ = &mut greeting, if !announced => break 'read DisconnectReason::Timeout,
        };
        tracing::trace!("Connection {} received {} bytes", peer, n);
        frames.feed(&buf[..n]);

        loop {
            let frame = match frames.try_read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    shared.queue.push(TransportEvent::NetworkError {
                        addr: addr.clone(),
                        message: e.to_string(),
                    });
                    break 'read DisconnectReason::NetworkError(e.to_string());
                }
            };
            if let Some(reason) = shared.on_frame(peer, &addr, frame, server_side, &mut announced) {
                break 'read reason;
            }
        }
    };

    if announced {
        shared.drop_link(peer, reason);
    } else {
        tracing::warn!("Closing socket from {} before it identified itself: {}", addr, reason);
        lock(&shared.peers).remove(&peer);
    }
}

/// Stream transport over TCP, driven by a tokio runtime it owns.
///
/// Each frame on the socket is length-prefixed and starts with a one byte
/// kind. A client's first frame is `CONNECT` carrying the connection key;
/// nothing else is delivered for that peer until the owner accepts it. Sends
/// only enqueue, so a slow peer never stalls the caller.
pub struct TcpTransport {
    runtime: Option<Runtime>,
    shared: Shared,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    next_peer: Arc<AtomicU64>,
    listener_alive: Option<watch::Sender<()>>,
    local_addr: Option<SocketAddr>,
    running: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            runtime: None,
            shared: Shared {
                peers: Arc::new(Mutex::new(AHashMap::new())),
                queue: EventQueue {
                    tx,
                    pending: Arc::new(AtomicUsize::new(0)),
                },
                greeting_timeout: GREETING_TIMEOUT,
            },
            rx,
            next_peer: Arc::new(AtomicU64::new(1)),
            listener_alive: None,
            local_addr: None,
            running: false,
        }
    }

    pub fn with_greeting_timeout(mut self, timeout: Duration) -> Self {
        self.shared.greeting_timeout = timeout;
        self
    }

    /// Address the listener is bound to, once [`Transport::listen`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn handle(&mut self) -> Result<Handle> {
        if self.runtime.is_none() {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(IO_THREADS)
                .thread_name("worldsync-tcp")
                .enable_all()
                .build()
                .map_err(|e| SyncError::TransportStartFailure(format!("I/O runtime: {}", e)))?;
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or(SyncError::NotRunning)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn listen(&mut self, port: u16) -> Result<()> {
        let handle = self.handle()?;

        // Bound synchronously so a busy port fails the call itself.
        let std_listener = std::net::TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| SyncError::TransportStartFailure(format!("bind to port {}: {}", port, e)))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| SyncError::TransportStartFailure(e.to_string()))?;
        let local_addr = std_listener.local_addr()?;
        let listener = {
            let _enter = handle.enter();
            TcpListener::from_std(std_listener).map_err(|e| SyncError::TransportStartFailure(e.to_string()))?
        };

        let (alive, alive_rx) = watch::channel(());
        handle.spawn(accept_loop(listener, alive_rx, self.shared.clone(), Arc::clone(&self.next_peer)));

        self.listener_alive = Some(alive);
        self.local_addr = Some(local_addr);
        self.running = true;
        Ok(())
    }

    /// Returns at once; a failed connect surfaces as a `Disconnected` event.
    fn connect(&mut self, host: &str, port: u16, key: &str) -> Result<PeerId> {
        let handle = self.handle()?;
        let peer = PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let target = format!("{}:{}", host, port);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        outbound
            .send(encode_frame(FRAME_CONNECT, key.as_bytes())?)
            .map_err(|_| SyncError::PeerDisconnected(peer.0))?;
        let alive = self.shared.register(peer, target.clone(), outbound);

        let shared = self.shared.clone();
        handle.spawn(async move {
            let connected = TcpStream::connect(target.as_str()).await;
            match connected {
                Ok(stream) => run_link(peer, target, stream, false, outbound_rx, alive, shared).await,
                Err(e) => {
                    tracing::warn!("Connecting to {} failed: {}", target, e);
                    shared.drop_link(peer, DisconnectReason::NetworkError(format!("connect to {}: {}", target, e)));
                }
            }
        });

        self.running = true;
        Ok(peer)
    }

    fn accept(&mut self, peer: PeerId) -> Result<()> {
        let frame = encode_frame(FRAME_ACCEPT, &[])?;
        let addr = {
            let mut peers = lock(&self.shared.peers);
            let link = peers.get_mut(&peer).ok_or(SyncError::PeerDisconnected(peer.0))?;
            link.outbound
                .send(frame)
                .map_err(|_| SyncError::PeerDisconnected(peer.0))?;
            link.state = PeerState::Connected;
            link.addr.clone()
        };

        self.shared.queue.push(TransportEvent::Connected { peer, addr });
        Ok(())
    }

    fn reject(&mut self, peer: PeerId) -> Result<()> {
        let frame = encode_frame(FRAME_REJECT, &[])?;
        if let Some(link) = lock(&self.shared.peers).remove(&peer) {
            let _ = link.outbound.send(frame);
        }
        Ok(())
    }

    fn send_to(&mut self, peer: PeerId, data: Bytes, _method: DeliveryMethod) -> Result<()> {
        let frame = encode_frame(FRAME_DATA, &data)?;
        match lock(&self.shared.peers).get(&peer) {
            Some(link) if link.state == PeerState::Connected => link
                .outbound
                .send(frame)
                .map_err(|_| SyncError::PeerDisconnected(peer.0)),
            _ => Err(SyncError::PeerDisconnected(peer.0)),
        }
    }

    fn disconnect(&mut self, peer: PeerId, notice: Option<Bytes>) -> Result<()> {
        let Some(link) = lock(&self.shared.peers).remove(&peer) else {
            return Ok(());
        };

        // The writer flushes the close frame, then shuts the socket down.
        let body = notice.unwrap_or_default();
        if let Ok(frame) = encode_frame(FRAME_CLOSE, &body) {
            let _ = link.outbound.send(frame);
        }
        drop(link);

        self.shared.queue.push(TransportEvent::Disconnected {
            peer,
            reason: DisconnectReason::LocalClose,
        });
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        self.shared.queue.pending.fetch_sub(events.len(), Ordering::AcqRel);
        events
    }

    fn has_pending_events(&self) -> bool {
        self.shared.queue.pending.load(Ordering::Acquire) > 0
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.shared.peers)
            .iter()
            .filter(|(_, link)| link.state == PeerState::Connected)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    fn peer_addr(&self, peer: PeerId) -> Option<String> {
        lock(&self.shared.peers).get(&peer).map(|link| link.addr.clone())
    }

    fn stop(&mut self) {
        self.listener_alive = None;
        let peers: Vec<PeerId> = lock(&self.shared.peers).keys().copied().collect();
        for peer in peers {
            let _ = self.disconnect(peer, None);
        }
        self.local_addr = None;
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Instant;

    fn wait_for(transport: &mut TcpTransport, mut pred: impl FnMut(&TransportEvent) -> bool) -> TransportEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            for event in transport.drain_events() {
                if pred(&event) {
                    return event;
                }
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for transport event");
    }

    fn listening() -> (TcpTransport, u16) {
        let mut server = TcpTransport::new();
        server.listen(0).unwrap();
        let port = server.local_addr().unwrap().port();
        (server, port)
    }

    /// Plain socket that greets the server and gets accepted.
    fn accepted_raw_client(server: &mut TcpTransport, port: u16) -> (std::net::TcpStream, PeerId) {
        let mut raw = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        raw.write_all(&encode_frame(FRAME_CONNECT, b"secret").unwrap()).unwrap();

        let peer = match wait_for(server, |e| matches!(e, TransportEvent::ConnectionRequest { .. })) {
            TransportEvent::ConnectionRequest { peer, .. } => peer,
            _ => unreachable!(),
        };
        server.accept(peer).unwrap();
        wait_for(server, |e| matches!(e, TransportEvent::Connected { .. }));
        (raw, peer)
    }

    #[test]
    fn test_tcp_handshake_and_data() {
        let (mut server, port) = listening();

        let mut client = TcpTransport::new();
        let server_peer = client.connect("127.0.0.1", port, "secret").unwrap();

        let request = wait_for(&mut server, |e| matches!(e, TransportEvent::ConnectionRequest { .. }));
        let client_peer = match request {
            TransportEvent::ConnectionRequest { peer, key, .. } => {
                assert_eq!(key, "secret");
                peer
            }
            _ => unreachable!(),
        };
        server.accept(client_peer).unwrap();
        wait_for(&mut client, |e| matches!(e, TransportEvent::Connected { .. }));

        client
            .send_to(server_peer, Bytes::from_static(b"payload"), DeliveryMethod::ReliableOrdered)
            .unwrap();
        let received = wait_for(&mut server, |e| matches!(e, TransportEvent::Receive { .. }));
        match received {
            TransportEvent::Receive { peer, data, .. } => {
                assert_eq!(peer, client_peer);
                assert_eq!(&data[..], b"payload");
            }
            _ => unreachable!(),
        }

        server
            .disconnect(client_peer, Some(Bytes::from_static(b"bye")))
            .unwrap();
        let notice = wait_for(&mut client, |e| matches!(e, TransportEvent::Receive { .. }));
        assert!(matches!(notice, TransportEvent::Receive { data, .. } if &data[..] == b"bye"));
        wait_for(&mut client, |e| matches!(e, TransportEvent::Disconnected { .. }));
        assert!(client.peers().is_empty());
    }

    #[test]
    fn test_tcp_reject() {
        let (mut server, port) = listening();

        let mut client = TcpTransport::new();
        client.connect("127.0.0.1", port, "wrong").unwrap();

        if let TransportEvent::ConnectionRequest { peer, .. } =
            wait_for(&mut server, |e| matches!(e, TransportEvent::ConnectionRequest { .. }))
        {
            server.reject(peer).unwrap();
        }

        let event = wait_for(&mut client, |e| matches!(e, TransportEvent::Disconnected { .. }));
        assert!(matches!(
            event,
            TransportEvent::Disconnected { reason: DisconnectReason::ConnectionRejected, .. }
        ));
    }

    #[test]
    fn test_bind_failure_is_start_failure() {
        let (_first, port) = listening();

        let mut second = TcpTransport::new();
        assert!(matches!(second.listen(port), Err(SyncError::TransportStartFailure(_))));
    }

    #[test]
    fn test_connect_failure_reported_as_event() {
        let port = {
            let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            unused.local_addr().unwrap().port()
        };

        let mut client = TcpTransport::new();
        let peer = client.connect("127.0.0.1", port, "secret").unwrap();
        let event = wait_for(&mut client, |e| matches!(e, TransportEvent::Disconnected { .. }));
        assert!(matches!(
            event,
            TransportEvent::Disconnected { peer: p, reason: DisconnectReason::NetworkError(_) } if p == peer
        ));
    }

    #[test]
    fn test_silent_socket_closed_unreported() {
        let mut server = TcpTransport::new().with_greeting_timeout(Duration::from_millis(100));
        server.listen(0).unwrap();
        let port = server.local_addr().unwrap().port();

        let mut raw = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(raw.read(&mut buf).unwrap(), 0);

        thread::sleep(Duration::from_millis(20));
        assert!(server.drain_events().is_empty());
        assert!(server.peer_addr(PeerId(1)).is_none());
    }

    #[test]
    fn test_send_to_stalled_peer_does_not_block() {
        let (mut server, port) = listening();
        let (_raw, peer) = accepted_raw_client(&mut server, port);

        let chunk = Bytes::from(vec![7u8; 64 * 1024]);
        let started = Instant::now();
        for _ in 0..256 {
            server
                .send_to(peer, chunk.clone(), DeliveryMethod::ReliableOrdered)
                .unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_reset_peer_dropped_once() {
        let (mut server, port) = listening();
        let (raw, peer) = accepted_raw_client(&mut server, port);

        server
            .send_to(peer, Bytes::from(vec![1u8; 4096]), DeliveryMethod::ReliableOrdered)
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(raw);

        let mut disconnects = 0;
        let count = |events: Vec<TransportEvent>| {
            events
                .iter()
                .filter(|e| matches!(e, TransportEvent::Disconnected { peer: p, .. } if *p == peer))
                .count()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            disconnects += count(server.drain_events());
            let sent = server.send_to(peer, Bytes::from(vec![2u8; 4096]), DeliveryMethod::ReliableOrdered);
            if sent.is_err() {
                assert!(matches!(sent, Err(SyncError::PeerDisconnected(_))));
                break;
            }
            assert!(Instant::now() < deadline, "peer never dropped");
            thread::sleep(Duration::from_millis(10));
        }

        thread::sleep(Duration::from_millis(100));
        disconnects += count(server.drain_events());
        assert_eq!(disconnects, 1);
        assert!(server.peers().is_empty());
    }
}
