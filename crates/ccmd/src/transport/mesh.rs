//! P2P TCP mesh cluster transport (`mesh`).
//!
//! Maintains a fully-connected TCP mesh between all roster nodes.
//!
//! ## Design
//!
//! - Each node listens on its cluster address and dials every roster
//!   peer whose identifier sorts below its own (exactly one side of each
//!   pair initiates, so a pair never races to build two links).
//! - The first frame on any connection is a `Hello` identifying the
//!   peer; after that, frames are protocol messages or pings.
//! - Pings are sent on a fixed interval. A peer silent past the timeout
//!   window is declared dead: the link is dropped and a status event
//!   with a bumped generation is delivered to the engine. Reconnection
//!   is retried on the same interval and produces a fresh status event.
//! - Broadcast loops back to the local event queue in addition to the
//!   peer links, matching the substrate semantics the engine expects.
//!
//! ## Wire Protocol
//!
//! All frames are length-prefixed: a 4-byte little-endian u32 giving the
//! size of the bincode-encoded [`MeshFrame`], followed by the encoded
//! bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time;
use tracing::{debug, info, warn};

use ccm_proto::defaults::{
    DEFAULT_EVENT_CHANNEL_SIZE, DEFAULT_MESH_MAX_MESSAGE_SIZE, DEFAULT_MESH_PEER_TIMEOUT_SECS,
    DEFAULT_MESH_PING_INTERVAL_SECS, DEFAULT_PEER_WRITE_CHANNEL_SIZE,
};
use ccm_proto::error::{CcmError, CcmResult};
use ccm_proto::message::CcmMessage;
use ccm_proto::node::NodeStatus;

use super::{ClusterTransport, TransportEvent};

/// Interval between keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(DEFAULT_MESH_PING_INTERVAL_SECS);

/// Silence window after which a peer is declared dead.
const PEER_TIMEOUT: Duration = Duration::from_secs(DEFAULT_MESH_PEER_TIMEOUT_SECS);

/// Maximum size of a single wire frame.
const MAX_FRAME_SIZE: u32 = DEFAULT_MESH_MAX_MESSAGE_SIZE;

/// Frames exchanged over the TCP mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum MeshFrame {
    /// First frame on every connection: who is talking.
    Hello { node: String },
    /// A protocol message.
    Ccm(CcmMessage),
    /// Keepalive.
    Ping { node: String },
}

/// Runtime state for a single connected peer.
struct PeerState {
    /// Sender half of the write channel for this peer's connection.
    write_tx: mpsc::Sender<MeshFrame>,
    /// Instant of the last frame received from this peer.
    last_seen: time::Instant,
}

struct Inner {
    /// Connected peers keyed by node identifier.
    peers: HashMap<String, PeerState>,
    /// Known cluster addresses for every roster node.
    roster: HashMap<String, SocketAddr>,
    /// Monotonic counter stamped onto status events; a node that died
    /// and came back is distinguishable by its generation.
    generation: i64,
}

/// TCP mesh cluster transport.
pub struct MeshTransport {
    my_id: String,
    state: Arc<RwLock<Inner>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    shutdown: Arc<Notify>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl MeshTransport {
    /// Create a mesh transport for `my_id` with the given roster of
    /// peer cluster addresses (this node's own entry may be present and
    /// is ignored).
    pub fn new(my_id: &str, roster: HashMap<String, SocketAddr>) -> Self {
        let (tx, rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_SIZE);
        let mut roster = roster;
        roster.remove(my_id);
        Self {
            my_id: my_id.to_string(),
            state: Arc::new(RwLock::new(Inner {
                peers: HashMap::new(),
                roster,
                generation: 0,
            })),
            event_tx: tx,
            event_rx: Mutex::new(rx),
            shutdown: Arc::new(Notify::new()),
            local_addr: RwLock::new(None),
        }
    }

    /// Bind the listener and start the background tasks.
    pub async fn start(&self, bind_addr: SocketAddr) -> CcmResult<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|_| CcmError::NetworkError)?;
        let local = listener.local_addr().map_err(|_| CcmError::NetworkError)?;
        info!("mesh: listening on {}", local);
        *self.local_addr.write().await = Some(local);

        Self::spawn_listener(
            self.my_id.clone(),
            self.state.clone(),
            self.event_tx.clone(),
            self.shutdown.clone(),
            listener,
        );
        Self::spawn_maintenance(
            self.my_id.clone(),
            self.state.clone(),
            self.event_tx.clone(),
            self.shutdown.clone(),
        );
        Ok(())
    }

    /// The address the listener is bound to (after `start`).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Stop all background tasks.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    // -------------------------------------------------------------------
    // Wire helpers
    // -------------------------------------------------------------------

    /// Write a length-prefixed, bincode-encoded frame to a stream.
    async fn write_frame(
        stream: &mut (impl AsyncWriteExt + Unpin),
        frame: &MeshFrame,
    ) -> CcmResult<()> {
        let encoded = bincode::serialize(frame).map_err(|_| CcmError::Codec)?;
        let len = encoded.len() as u32;
        if len > MAX_FRAME_SIZE {
            return Err(CcmError::MessageTooLarge);
        }
        stream
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|_| CcmError::NetworkError)?;
        stream
            .write_all(&encoded)
            .await
            .map_err(|_| CcmError::NetworkError)?;
        stream.flush().await.map_err(|_| CcmError::NetworkError)?;
        Ok(())
    }

    /// Read a length-prefixed, bincode-encoded frame from a stream.
    async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> CcmResult<MeshFrame> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|_| CcmError::NetworkError)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(CcmError::MessageTooLarge);
        }
        let mut buf = vec![0u8; len as usize];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|_| CcmError::NetworkError)?;
        bincode::deserialize(&buf).map_err(|_| CcmError::Codec)
    }

    // -------------------------------------------------------------------
    // Peer bookkeeping
    // -------------------------------------------------------------------

    /// Register a freshly identified peer and report it active. An
    /// existing link to the same peer is displaced.
    async fn register_peer(
        state: &Arc<RwLock<Inner>>,
        event_tx: &mpsc::Sender<TransportEvent>,
        peer: &str,
        write_tx: mpsc::Sender<MeshFrame>,
    ) {
        let generation = {
            let mut s = state.write().await;
            s.generation += 1;
            s.peers.insert(
                peer.to_string(),
                PeerState {
                    write_tx,
                    last_seen: time::Instant::now(),
                },
            );
            s.generation
        };
        let _ = event_tx
            .send(TransportEvent::NodeStatus {
                node: peer.to_string(),
                status: NodeStatus::Active,
                generation,
            })
            .await;
    }

    /// Drop a peer link and report it dead, if it was still registered.
    async fn drop_peer(
        state: &Arc<RwLock<Inner>>,
        event_tx: &mpsc::Sender<TransportEvent>,
        peer: &str,
    ) {
        let generation = {
            let mut s = state.write().await;
            if s.peers.remove(peer).is_none() {
                return;
            }
            s.generation += 1;
            s.generation
        };
        warn!("mesh: peer {} is gone", peer);
        let _ = event_tx
            .send(TransportEvent::NodeStatus {
                node: peer.to_string(),
                status: NodeStatus::Dead,
                generation,
            })
            .await;
    }

    // -------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------

    /// Accept inbound peer connections.
    fn spawn_listener(
        my_id: String,
        state: Arc<RwLock<Inner>>,
        event_tx: mpsc::Sender<TransportEvent>,
        shutdown: Arc<Notify>,
        listener: TcpListener,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("mesh: listener shutting down");
                        break;
                    }
                    accept = listener.accept() => {
                        match accept {
                            Ok((stream, peer_addr)) => {
                                debug!("mesh: accepted connection from {}", peer_addr);
                                let my_id = my_id.clone();
                                let state = state.clone();
                                let event_tx = event_tx.clone();
                                let shutdown = shutdown.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = Self::run_connection(
                                        my_id, state, event_tx, shutdown, stream, None,
                                    )
                                    .await
                                    {
                                        debug!("mesh: connection from {} ended: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => warn!("mesh: accept error: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Drive one established connection: exchange hellos, then split
    /// into a writer task draining the peer's write channel and a read
    /// loop feeding the event queue.
    ///
    /// `expect` is `Some(peer)` on outbound connections where the remote
    /// identity is already known from the roster.
    async fn run_connection(
        my_id: String,
        state: Arc<RwLock<Inner>>,
        event_tx: mpsc::Sender<TransportEvent>,
        shutdown: Arc<Notify>,
        stream: TcpStream,
        expect: Option<String>,
    ) -> CcmResult<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(read_half);
        let mut writer = tokio::io::BufWriter::new(write_half);

        // Identify ourselves, then the peer.
        Self::write_frame(&mut writer, &MeshFrame::Hello { node: my_id.clone() }).await?;
        let peer = match Self::read_frame(&mut reader).await? {
            MeshFrame::Hello { node } => node,
            _ => return Err(CcmError::Codec),
        };
        if let Some(expected) = expect {
            if peer != expected {
                warn!("mesh: dialed {} but {} answered", expected, peer);
                return Err(CcmError::Codec);
            }
        }

        let (write_tx, mut write_rx) =
            mpsc::channel::<MeshFrame>(DEFAULT_PEER_WRITE_CHANNEL_SIZE);
        Self::register_peer(&state, &event_tx, &peer, write_tx).await;

        // Writer task: drain the write channel onto the socket.
        let shutdown_w = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_w.notified() => break,
                    frame = write_rx.recv() => match frame {
                        Some(f) => {
                            if Self::write_frame(&mut writer, &f).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Read loop.
        let result = loop {
            tokio::select! {
                _ = shutdown.notified() => break Ok(()),
                frame = Self::read_frame(&mut reader) => match frame {
                    Ok(MeshFrame::Ccm(msg)) => {
                        Self::touch(&state, &peer).await;
                        let _ = event_tx.send(TransportEvent::Message(msg)).await;
                    }
                    Ok(MeshFrame::Ping { .. }) => Self::touch(&state, &peer).await,
                    Ok(MeshFrame::Hello { .. }) => {
                        debug!("mesh: unexpected second hello from {}", peer);
                    }
                    Err(e) => break Err(e),
                },
            }
        };
        Self::drop_peer(&state, &event_tx, &peer).await;
        result
    }

    async fn touch(state: &Arc<RwLock<Inner>>, peer: &str) {
        if let Some(p) = state.write().await.peers.get_mut(peer) {
            p.last_seen = time::Instant::now();
        }
    }

    /// Ping connected peers, sweep out the silent ones, and (re)dial
    /// roster peers we should be connected to.
    fn spawn_maintenance(
        my_id: String,
        state: Arc<RwLock<Inner>>,
        event_tx: mpsc::Sender<TransportEvent>,
        shutdown: Arc<Notify>,
    ) {
        tokio::spawn(async move {
            let mut ticker = time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {}
                }

                // Ping and sweep.
                let mut stale: Vec<String> = Vec::new();
                {
                    let s = state.read().await;
                    for (name, peer) in s.peers.iter() {
                        if peer.last_seen.elapsed() >= PEER_TIMEOUT {
                            stale.push(name.clone());
                        } else {
                            let _ = peer
                                .write_tx
                                .try_send(MeshFrame::Ping { node: my_id.clone() });
                        }
                    }
                }
                for name in stale {
                    Self::drop_peer(&state, &event_tx, &name).await;
                }

                // Dial missing peers. Only the side with the smaller
                // identifier initiates, so a pair builds one link.
                let to_dial: Vec<(String, SocketAddr)> = {
                    let s = state.read().await;
                    s.roster
                        .iter()
                        .filter(|(name, _)| {
                            my_id.as_str() < name.as_str() && !s.peers.contains_key(*name)
                        })
                        .map(|(n, a)| (n.clone(), *a))
                        .collect()
                };
                for (name, addr) in to_dial {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => {
                            debug!("mesh: dialed {} at {}", name, addr);
                            let my_id = my_id.clone();
                            let state = state.clone();
                            let event_tx = event_tx.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::run_connection(
                                    my_id,
                                    state,
                                    event_tx,
                                    shutdown,
                                    stream,
                                    Some(name.clone()),
                                )
                                .await
                                {
                                    debug!("mesh: link to {} ended: {}", name, e);
                                }
                            });
                        }
                        Err(e) => debug!("mesh: cannot reach {} at {}: {}", name, addr, e),
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ClusterTransport for MeshTransport {
    fn name(&self) -> &str {
        "mesh"
    }

    async fn broadcast(&self, msg: CcmMessage) -> CcmResult<()> {
        // Loop back to the local engine first.
        let _ = self
            .event_tx
            .send(TransportEvent::Message(msg.clone()))
            .await;
        let s = self.state.read().await;
        for (name, peer) in s.peers.iter() {
            if peer.write_tx.send(MeshFrame::Ccm(msg.clone())).await.is_err() {
                debug!("mesh: broadcast to {} failed, link closing", name);
            }
        }
        Ok(())
    }

    async fn unicast(&self, node: &str, msg: CcmMessage) -> CcmResult<()> {
        if node == self.my_id {
            let _ = self.event_tx.send(TransportEvent::Message(msg)).await;
            return Ok(());
        }
        let s = self.state.read().await;
        match s.peers.get(node) {
            Some(peer) => peer
                .write_tx
                .send(MeshFrame::Ccm(msg))
                .await
                .map_err(|_| CcmError::NetworkError),
            None => Err(CcmError::NotConnected),
        }
    }

    async fn recv(&self) -> CcmResult<TransportEvent> {
        self.event_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(CcmError::ChannelClosed)
    }

    async fn try_recv(&self) -> Option<TransportEvent> {
        self.event_rx.lock().await.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccm_proto::message::CcmPayload;

    async fn wait_for_message(t: &MeshTransport) -> CcmMessage {
        loop {
            match t.recv().await.unwrap() {
                TransportEvent::Message(m) => return m,
                TransportEvent::NodeStatus { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_two_node_mesh_delivers_broadcast() {
        let a = MeshTransport::new("nodea", HashMap::new());
        a.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let b = MeshTransport::new("nodeb", HashMap::new());
        b.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.local_addr().await.unwrap();

        // nodea < nodeb, so nodea initiates; hand it nodeb's address.
        {
            let mut s = a.state.write().await;
            s.roster.insert("nodeb".to_string(), b_addr);
        }

        // Wait until both sides report the link up.
        for t in [&a, &b] {
            loop {
                match t.recv().await.unwrap() {
                    TransportEvent::NodeStatus {
                        status: NodeStatus::Active,
                        ..
                    } => break,
                    _ => continue,
                }
            }
        }

        let msg = CcmMessage::new("nodeb", CcmPayload::ProtoVersion { version: 1 });
        b.broadcast(msg).await.unwrap();

        // nodeb sees its own loopback copy, nodea the mesh copy.
        assert_eq!(wait_for_message(&b).await.origin, "nodeb");
        assert_eq!(wait_for_message(&a).await.origin, "nodeb");

        a.stop();
        b.stop();
    }
}
