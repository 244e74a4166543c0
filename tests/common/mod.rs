use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use iroh::{EndpointAddr, EndpointId, SecretKey};
use tokio::sync::{Mutex, RwLock};

use meshnet::{Discovery, DhtId, MeshError, PeerInfo, PeerNetwork, RoutingTable};

/// In-memory discovery network: peers registered here answer RPCs by
/// calling straight into each other's handlers. Unregistered peers
/// and peers with an injected failure are unreachable.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_info: PeerInfo,
    failures: Arc<Mutex<HashSet<EndpointId>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_info: PeerInfo) -> Self {
        Self {
            registry,
            self_info,
            failures: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn set_failure(&self, node: EndpointId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    async fn should_fail(&self, node: &EndpointId) -> bool {
        self.failures.lock().await.contains(node)
    }

    fn unreachable(&self, node: EndpointId) -> MeshError {
        MeshError::PeerUnreachable {
            peer: node,
            reason: "injected network failure".into(),
        }
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<EndpointId, Discovery<TestNetwork>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &Discovery<TestNetwork>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.local_id(), node.clone());
    }

    pub async fn get(&self, id: &EndpointId) -> Option<Discovery<TestNetwork>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl PeerNetwork for TestNetwork {
    async fn find_node(&self, to: &PeerInfo, target: DhtId) -> meshnet::Result<Vec<PeerInfo>> {
        if self.should_fail(&to.id).await {
            return Err(self.unreachable(to.id));
        }
        match self.registry.get(&to.id).await {
            Some(peer) => Ok(peer.handle_find_node(self.self_info.clone(), target).await),
            None => Err(self.unreachable(to.id)),
        }
    }

    async fn ping(&self, to: &PeerInfo) -> meshnet::Result<()> {
        if self.should_fail(&to.id).await {
            return Err(self.unreachable(to.id));
        }
        match self.registry.get(&to.id).await {
            Some(peer) => {
                peer.handle_ping(self.self_info.clone()).await;
                Ok(())
            }
            None => Err(self.unreachable(to.id)),
        }
    }
}

pub struct TestNode {
    pub discovery: Discovery<TestNetwork>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u8, k: usize) -> Self {
        let info = make_peer_info(index);
        let network = TestNetwork::new(registry.clone(), info.clone());
        let routing = RoutingTable::shared(info.id, k);
        let discovery = Discovery::new(info, routing, network.clone());
        registry.register(&discovery).await;
        Self { discovery, network }
    }

    pub fn info(&self) -> PeerInfo {
        make_peer_info_from_id(self.discovery.local_id())
    }
}

pub fn make_peer_id(index: u8) -> EndpointId {
    let mut bytes = [0u8; 32];
    bytes[0] = index;
    bytes[31] = 0xA5;
    SecretKey::from_bytes(&bytes).public()
}

pub fn make_peer_info(index: u8) -> PeerInfo {
    make_peer_info_from_id(make_peer_id(index))
}

pub fn make_peer_info_from_id(id: EndpointId) -> PeerInfo {
    PeerInfo {
        id,
        addr: EndpointAddr::from(id),
    }
}
