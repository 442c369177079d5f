//! In-memory network for tests and single-process demos.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::message::Envelope;
use crate::transport::{PeerDirectory, Transport};
use peersync_common::{Error, PeerAddress, PeerRef, Result};

/// Receiving end of a device's connection to the network.
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

/// Hook run on every envelope in flight. Returning `false` drops it.
pub type Interceptor = Arc<dyn Fn(&mut Envelope) -> bool + Send + Sync>;

struct Node {
    peer: PeerRef,
    inbox: mpsc::UnboundedSender<Envelope>,
    connected: bool,
}

/// Shared broker routing envelopes between `MemoryTransport`s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<RwLock<HashMap<PeerAddress, Node>>>,
    interceptor: Arc<RwLock<Option<Interceptor>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device at its address.
    pub async fn join(&self, peer: PeerRef) -> (MemoryTransport, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let address = peer.address.clone();
        self.nodes.write().await.insert(
            address.clone(),
            Node {
                peer,
                inbox: tx,
                connected: true,
            },
        );

        let transport = MemoryTransport {
            address,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Take a device offline. Sends to and from it fail until reconnected.
    pub async fn disconnect(&self, address: &PeerAddress) {
        if let Some(node) = self.nodes.write().await.get_mut(address) {
            node.connected = false;
        }
    }

    pub async fn reconnect(&self, address: &PeerAddress) {
        if let Some(node) = self.nodes.write().await.get_mut(address) {
            node.connected = true;
        }
    }

    /// Install or clear the in-flight hook.
    pub async fn set_interceptor(&self, interceptor: Option<Interceptor>) {
        *self.interceptor.write().await = interceptor;
    }

    async fn is_connected(&self, address: &PeerAddress) -> bool {
        self.nodes
            .read()
            .await
            .get(address)
            .map(|n| n.connected)
            .unwrap_or(false)
    }

    async fn deliver(&self, from: &PeerAddress, to: &PeerAddress, mut envelope: Envelope) -> Result<()> {
        if !self.is_connected(from).await {
            return Err(Error::Network(format!("{} is offline", from)));
        }

        if let Some(interceptor) = self.interceptor.read().await.clone() {
            if !interceptor(&mut envelope) {
                debug!("Interceptor dropped {} to {}", envelope.body.kind(), to);
                return Ok(());
            }
        }

        let nodes = self.nodes.read().await;
        let node = nodes
            .get(to)
            .filter(|n| n.connected)
            .ok_or_else(|| Error::Network(format!("{} is unreachable", to)))?;
        node.inbox
            .send(envelope)
            .map_err(|_| Error::Network(format!("{} stopped receiving", to)))
    }
}

#[async_trait]
impl PeerDirectory for MemoryNetwork {
    async fn reachable_devices(&self, user: &str) -> Result<Vec<PeerRef>> {
        let nodes = self.nodes.read().await;
        let mut peers: Vec<PeerRef> = nodes
            .values()
            .filter(|n| n.connected && n.peer.user == user)
            .map(|n| n.peer.clone())
            .collect();
        peers.sort_by(|a, b| a.device.cmp(&b.device));
        Ok(peers)
    }
}

/// One device's handle on a `MemoryNetwork`.
#[derive(Clone)]
pub struct MemoryTransport {
    address: PeerAddress,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> &PeerAddress {
        &self.address
    }

    async fn send(&self, to: &PeerAddress, envelope: Envelope) -> Result<()> {
        self.network.deliver(&self.address, to, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ExchangeId, Message};
    use peersync_common::DeviceId;

    fn peer(user: &str, device: &str) -> PeerRef {
        PeerRef::new(
            user,
            DeviceId::new(device).unwrap(),
            PeerAddress::new(format!("mem://{}", device)),
        )
    }

    fn envelope(sender: &PeerRef) -> Envelope {
        Envelope {
            exchange: ExchangeId::new(),
            sequence: 0,
            sender: sender.clone(),
            receivers: vec![],
            body: Message::Ack,
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let network = MemoryNetwork::new();
        let a = peer("alice", "a");
        let (transport, _) = network.join(a.clone()).await;
        let (_, mut inbox) = network.join(peer("alice", "b")).await;

        transport
            .send(&PeerAddress::new("mem://b"), envelope(&a))
            .await
            .unwrap();
        assert_eq!(inbox.recv().await.unwrap().sender, a);
    }

    #[tokio::test]
    async fn test_disconnect_fails_sends() {
        let network = MemoryNetwork::new();
        let a = peer("alice", "a");
        let (transport, _) = network.join(a.clone()).await;
        let b = peer("alice", "b");
        let (_, _inbox) = network.join(b.clone()).await;

        network.disconnect(&b.address).await;
        assert!(transport.send(&b.address, envelope(&a)).await.is_err());

        network.reconnect(&b.address).await;
        network.disconnect(&a.address).await;
        assert!(transport.send(&b.address, envelope(&a)).await.is_err());
    }

    #[tokio::test]
    async fn test_reachable_devices_filters_user_and_status() {
        let network = MemoryNetwork::new();
        let (_, _i1) = network.join(peer("alice", "b")).await;
        let (_, _i2) = network.join(peer("alice", "a")).await;
        let (_, _i3) = network.join(peer("bob", "c")).await;
        let (_, _i4) = network.join(peer("alice", "d")).await;
        network.disconnect(&PeerAddress::new("mem://d")).await;

        let devices: Vec<String> = network
            .reachable_devices("alice")
            .await
            .unwrap()
            .iter()
            .map(|p| p.device.to_string())
            .collect();
        assert_eq!(devices, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_interceptor_can_drop() {
        let network = MemoryNetwork::new();
        let a = peer("alice", "a");
        let (transport, _) = network.join(a.clone()).await;
        let (_, mut inbox) = network.join(peer("alice", "b")).await;

        network
            .set_interceptor(Some(Arc::new(|_: &mut Envelope| false)))
            .await;
        transport
            .send(&PeerAddress::new("mem://b"), envelope(&a))
            .await
            .unwrap();
        assert!(inbox.try_recv().is_err());
    }
}
