//! Topic-based peer discovery over iroh-gossip.
//!
//! The network key is used directly as the gossip topic id; joining the
//! topic is joining the network. Neighbor events drive connection setup,
//! and a static discovery provider carries out-of-band bootstrap addresses
//! so a first mesh can form without public infrastructure.

use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::{ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{NodeError, NodeResult};
use crate::protocol::SYNC_ALPN;

/// Discovery event on the joined topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmEvent {
    NeighborUp(EndpointId),
    NeighborDown(EndpointId),
}

/// Receiver half of a joined topic. Should be polled by a single task.
pub struct TopicReceiver {
    // The sender half keeps the subscription alive; we never broadcast.
    _sender: iroh_gossip::api::GossipSender,
    receiver: iroh_gossip::api::GossipReceiver,
    topic_id: TopicId,
}

impl TopicReceiver {
    /// Next neighbor event, or `None` when the subscription closed.
    /// Payload messages on the topic are ignored.
    pub async fn recv(&mut self) -> Option<SwarmEvent> {
        use iroh_gossip::api::Event;
        use n0_future::StreamExt;

        loop {
            match self.receiver.try_next().await {
                Ok(Some(Event::NeighborUp(peer))) => {
                    info!(topic = ?self.topic_id, ?peer, "neighbor joined");
                    return Some(SwarmEvent::NeighborUp(peer));
                }
                Ok(Some(Event::NeighborDown(peer))) => {
                    info!(topic = ?self.topic_id, ?peer, "neighbor left");
                    return Some(SwarmEvent::NeighborDown(peer));
                }
                Ok(Some(Event::Received(_))) => continue,
                Ok(Some(Event::Lagged)) => {
                    warn!(topic = ?self.topic_id, "lagged behind on topic");
                    continue;
                }
                Ok(None) => {
                    debug!(topic = ?self.topic_id, "topic subscription closed");
                    return None;
                }
                Err(e) => {
                    warn!(topic = ?self.topic_id, error = ?e, "error receiving from topic");
                    return None;
                }
            }
        }
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }
}

/// The node's network stack: endpoint, gossip, router, static discovery.
#[derive(Debug)]
pub struct Swarm {
    endpoint: Endpoint,
    gossip: Gossip,
    static_provider: StaticProvider,
    router: Mutex<Option<Router>>,
    /// Out-of-band peers, used as gossip bootstrap on join
    known_peers: Mutex<Vec<EndpointId>>,
}

impl Swarm {
    /// Bind the endpoint and spawn gossip. The router is spawned separately
    /// once the protocol handlers exist.
    pub async fn bind(secret_key: SecretKey) -> NodeResult<Self> {
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![
                SYNC_ALPN.to_vec(),
                GOSSIP_ALPN.to_vec(),
                iroh_blobs::ALPN.to_vec(),
            ])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| NodeError::Network(format!("failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "endpoint bound");

        let gossip = Gossip::builder().spawn(endpoint.clone());

        Ok(Self {
            endpoint,
            gossip,
            static_provider,
            router: Mutex::new(None),
            known_peers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the router with the sync channel, gossip, and blob protocols.
    pub fn spawn_router(
        &self,
        sync_handler: impl ProtocolHandler,
        blobs: iroh_blobs::BlobsProtocol,
    ) {
        let router = Router::builder(self.endpoint.clone())
            .accept(SYNC_ALPN, sync_handler)
            .accept(GOSSIP_ALPN, self.gossip.clone())
            .accept(iroh_blobs::ALPN, blobs)
            .spawn();
        info!("router spawned");
        *self.router.lock() = Some(router);
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Full addressing info other peers can use to reach this node.
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Add a peer's address out of band. It becomes reachable immediately
    /// and is used as a gossip bootstrap peer on the next join.
    pub fn add_peer_addr(&self, addr: EndpointAddr) {
        info!(peer = %addr.id, addrs = addr.addrs.len(), "adding peer address");
        self.known_peers.lock().push(addr.id);
        self.static_provider.add_endpoint_info(addr);
    }

    /// Join the discovery topic, bootstrapping from known peers.
    pub async fn join(&self, topic_id: TopicId) -> NodeResult<TopicReceiver> {
        let bootstrap = self.known_peers.lock().clone();
        info!(?topic_id, peers = bootstrap.len(), "joining topic");

        let topic = self
            .gossip
            .subscribe(topic_id, bootstrap)
            .await
            .map_err(|e| NodeError::Gossip(format!("failed to subscribe: {}", e)))?;
        let (sender, receiver) = topic.split();

        Ok(TopicReceiver {
            _sender: sender,
            receiver,
            topic_id,
        })
    }

    /// Shut down the router, then close the endpoint.
    pub async fn shutdown(&self) {
        info!("shutting down swarm");
        let router = self.router.lock().take();
        if let Some(router) = router {
            if let Err(e) = router.shutdown().await {
                warn!(error = ?e, "failed to shutdown router cleanly");
            }
        }
        self.endpoint.close().await;
    }
}
