//! Local (in-process) cluster transport.
//!
//! This driver performs no real networking: a shared hub fans messages
//! out over in-process tokio mpsc channels. It backs single-node
//! deployments and, registered several times, lets tests run multiple
//! protocol engines against each other (or script one engine's inputs)
//! without sockets or timing dependence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use ccm_proto::defaults::DEFAULT_LOCAL_EVENT_CHANNEL_SIZE;
use ccm_proto::error::{CcmError, CcmResult};
use ccm_proto::message::CcmMessage;
use ccm_proto::node::NodeStatus;

use super::{ClusterTransport, TransportEvent};

/// Shared fan-out point for all [`LocalTransport`] endpoints.
pub struct LocalHub {
    peers: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a node to the hub, returning its transport endpoint.
    pub async fn register(self: &Arc<Self>, node: &str) -> LocalTransport {
        let (tx, rx) = mpsc::channel(DEFAULT_LOCAL_EVENT_CHANNEL_SIZE);
        self.peers.lock().await.insert(node.to_string(), tx);
        LocalTransport {
            node: node.to_string(),
            hub: Arc::clone(self),
            rx: Mutex::new(rx),
        }
    }

    /// Deliver a liveness change to every attached endpoint, the way a
    /// real substrate would report a peer death or return.
    pub async fn set_status(&self, node: &str, status: NodeStatus, generation: i64) {
        let peers = self.peers.lock().await;
        for tx in peers.values() {
            let _ = tx
                .send(TransportEvent::NodeStatus {
                    node: node.to_string(),
                    status,
                    generation,
                })
                .await;
        }
    }

    /// Detach a node. Messages addressed to it are dropped from then on.
    pub async fn unregister(&self, node: &str) {
        self.peers.lock().await.remove(node);
    }

    async fn fan_out(&self, msg: CcmMessage) {
        let peers = self.peers.lock().await;
        for (name, tx) in peers.iter() {
            if tx.send(TransportEvent::Message(msg.clone())).await.is_err() {
                debug!("local: dropping message for closed endpoint {}", name);
            }
        }
    }
}

/// One node's endpoint on the hub.
pub struct LocalTransport {
    node: String,
    hub: Arc<LocalHub>,
    /// Wrapped in a Mutex because `mpsc::Receiver::recv` takes `&mut self`.
    rx: Mutex<mpsc::Receiver<TransportEvent>>,
}

impl LocalTransport {
    /// Directly inject an event into this endpoint's queue (tests).
    pub async fn inject(&self, event: TransportEvent) {
        let peers = self.hub.peers.lock().await;
        if let Some(tx) = peers.get(&self.node) {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn broadcast(&self, msg: CcmMessage) -> CcmResult<()> {
        self.hub.fan_out(msg).await;
        Ok(())
    }

    async fn unicast(&self, node: &str, msg: CcmMessage) -> CcmResult<()> {
        let peers = self.hub.peers.lock().await;
        match peers.get(node) {
            Some(tx) => {
                tx.send(TransportEvent::Message(msg))
                    .await
                    .map_err(|_| CcmError::ChannelClosed)?;
                Ok(())
            }
            None => Err(CcmError::NotConnected),
        }
    }

    async fn recv(&self) -> CcmResult<TransportEvent> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(CcmError::ChannelClosed)
    }

    async fn try_recv(&self) -> Option<TransportEvent> {
        self.rx.lock().await.try_recv().ok()
    }
}
