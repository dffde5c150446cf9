//! Transport seam consumed by the orchestration core.
//!
//! The core assumes an authenticated point-to-point send, topic broadcast,
//! and peer membership from the underlying network stack. [`MemoryHub`]
//! provides an in-process implementation of the same surface, used by the
//! node's local mode and by the integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use colony_core::PeerId;

/// Capacity of a peer's inbound channel. Once full, senders block, which
/// is how backpressure propagates across the in-process hub.
const INBOUND_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer unreachable ({0})")]
    Unreachable(PeerId),
    #[error("could not reach all peers ({failed} of {total} sends failed)")]
    PartialDelivery { failed: usize, total: usize },
    #[error("transport closed")]
    Closed,
}

/// A message handed up from the transport, with its authenticated sender.
#[derive(Debug)]
pub struct Inbound {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Outbound surface of the network stack.
///
/// `send_to_many` with `reach_all` set asks the transport to treat any
/// failed delivery as an error rather than best-effort; consensus
/// dispatch uses it so every replica observes the work order.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    async fn send(&self, to: &PeerId, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn send_to_many(
        &self,
        to: &[PeerId],
        payload: Vec<u8>,
        reach_all: bool,
    ) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Peers currently known to be connected.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Public key material for an authenticated peer, when the transport
    /// can derive it (peer identities are key-derived on real networks).
    fn verifying_key(&self, peer: &PeerId) -> Option<VerifyingKey>;
}

struct HubInner {
    peers: DashMap<PeerId, mpsc::Sender<Inbound>>,
    topics: DashMap<String, DashSet<PeerId>>,
    keys: DashMap<PeerId, VerifyingKey>,
}

/// In-process message hub connecting any number of [`MemoryTransport`]
/// endpoints.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        MemoryHub {
            inner: Arc::new(HubInner {
                peers: DashMap::new(),
                topics: DashMap::new(),
                keys: DashMap::new(),
            }),
        }
    }

    /// Attach a peer to the hub, returning its transport endpoint and the
    /// inbound receiver to feed into a dispatcher.
    pub fn join(&self, peer: PeerId) -> (MemoryTransport, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        self.inner.peers.insert(peer.clone(), tx);
        (
            MemoryTransport {
                inner: Arc::clone(&self.inner),
                local: peer,
            },
            rx,
        )
    }

    /// Attach a peer along with its public key, making the key resolvable
    /// through [`Transport::verifying_key`] on every endpoint.
    pub fn join_with_key(
        &self,
        peer: PeerId,
        key: VerifyingKey,
    ) -> (MemoryTransport, mpsc::Receiver<Inbound>) {
        self.inner.keys.insert(peer.clone(), key);
        self.join(peer)
    }

    /// Detach a peer; queued messages to it are dropped.
    pub fn leave(&self, peer: &PeerId) {
        self.inner.peers.remove(peer);
        self.inner.keys.remove(peer);
        for topic in self.inner.topics.iter() {
            topic.value().remove(peer);
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryTransport {
    inner: Arc<HubInner>,
    local: PeerId,
}

impl MemoryTransport {
    async fn deliver(&self, to: &PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        let tx = match self.inner.peers.get(to) {
            Some(entry) => entry.value().clone(),
            None => return Err(TransportError::Unreachable(to.clone())),
        };
        tx.send(Inbound {
            from: self.local.clone(),
            payload,
        })
        .await
        .map_err(|_| TransportError::Unreachable(to.clone()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn send(&self, to: &PeerId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.deliver(to, payload).await
    }

    async fn send_to_many(
        &self,
        to: &[PeerId],
        payload: Vec<u8>,
        reach_all: bool,
    ) -> Result<(), TransportError> {
        let mut failed = 0;
        for peer in to {
            if let Err(err) = self.deliver(peer, payload.clone()).await {
                debug!(%peer, %err, "could not deliver to peer");
                failed += 1;
            }
        }
        if failed > 0 && reach_all {
            return Err(TransportError::PartialDelivery {
                failed,
                total: to.len(),
            });
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let subscribers: Vec<PeerId> = match self.inner.topics.get(topic) {
            Some(subs) => subs.iter().map(|peer| peer.key().clone()).collect(),
            None => return Ok(()),
        };

        for peer in subscribers {
            if peer == self.local {
                continue;
            }
            if let Err(err) = self.deliver(&peer, payload.clone()).await {
                debug!(%peer, %err, topic, "could not publish to subscriber");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(self.local.clone());
        Ok(())
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .peers
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|peer| *peer != self.local)
            .collect()
    }

    fn verifying_key(&self, peer: &PeerId) -> Option<VerifyingKey> {
        self.inner.keys.get(peer).map(|entry| *entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn point_to_point_delivery_carries_sender() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.join(PeerId::new("a"));
        let (_b, mut rx_b) = hub.join(PeerId::new("b"));

        a.send(&PeerId::new("b"), b"hello".to_vec()).await.unwrap();

        let inbound = rx_b.recv().await.unwrap();
        assert_eq!(inbound.from, PeerId::new("a"));
        assert_eq!(inbound.payload, b"hello");
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_but_not_the_sender() {
        let hub = MemoryHub::new();
        let (a, mut rx_a) = hub.join(PeerId::new("a"));
        let (b, mut rx_b) = hub.join(PeerId::new("b"));
        let (_c, mut rx_c) = hub.join(PeerId::new("c"));

        a.subscribe("jobs").await.unwrap();
        b.subscribe("jobs").await.unwrap();

        a.publish("jobs", b"ping".to_vec()).await.unwrap();

        assert_eq!(rx_b.recv().await.unwrap().payload, b"ping");
        assert!(rx_c.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn reach_all_surfaces_partial_delivery() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.join(PeerId::new("a"));
        let (_b, _rx_b) = hub.join(PeerId::new("b"));

        let peers = vec![PeerId::new("b"), PeerId::new("ghost")];

        // Best effort tolerates the unreachable peer.
        a.send_to_many(&peers, b"x".to_vec(), false).await.unwrap();

        let err = a.send_to_many(&peers, b"x".to_vec(), true).await;
        assert!(matches!(
            err,
            Err(TransportError::PartialDelivery { failed: 1, total: 2 })
        ));
    }
}
