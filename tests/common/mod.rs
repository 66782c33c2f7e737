// In-process cluster harness for integration tests.
//
// Wires real coordinators (raft node, metadata store, migration
// orchestration) through a channel-based RPC mesh instead of sockets, and
// backs replica groups with shared in-memory storage servers so slot
// migrations move observable data.

use keyplane::cluster::{CommandResult, Coordinator, Group, NewGroup};
use keyplane::config::RaftSettings;
use keyplane::error::KeyplaneError;
use keyplane::group::{MemoryServer, ReplicaGroup, StorageServer};
use keyplane::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftCommand, RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
use keyplane::types::{NodeId, ServerAddr};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

type RaftHandle = mpsc::Sender<RaftCommand<CommandResult>>;

/// Channel-based raft transport connecting in-process nodes by id.
#[derive(Clone, Default)]
pub struct LocalMesh {
    routes: Arc<RwLock<HashMap<NodeId, RaftHandle>>>,
}

impl LocalMesh {
    pub fn register(&self, node_id: NodeId, handle: RaftHandle) {
        self.routes.write().insert(node_id, handle);
    }

    fn route(&self, target: NodeId) -> keyplane::Result<RaftHandle> {
        self.routes
            .read()
            .get(&target)
            .cloned()
            .ok_or_else(|| KeyplaneError::Network(format!("unknown peer {}", target)))
    }

    async fn dispatch<Reply>(
        &self,
        target: NodeId,
        make: impl FnOnce(oneshot::Sender<Reply>) -> RaftCommand<CommandResult>,
    ) -> keyplane::Result<Reply> {
        let handle = self.route(target)?;
        let (tx, rx) = oneshot::channel();
        handle
            .send(make(tx))
            .await
            .map_err(|_| KeyplaneError::Network(format!("peer {} is down", target)))?;
        rx.await
            .map_err(|_| KeyplaneError::Network(format!("peer {} dropped the request", target)))
    }
}

#[async_trait::async_trait]
impl RaftRpc for LocalMesh {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> keyplane::Result<RequestVoteResponse> {
        self.dispatch(target, |response| RaftCommand::RequestVote { request, response })
            .await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> keyplane::Result<AppendEntriesResponse> {
        self.dispatch(target, |response| RaftCommand::AppendEntries { request, response })
            .await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> keyplane::Result<InstallSnapshotResponse> {
        self.dispatch(target, |response| RaftCommand::InstallSnapshot { request, response })
            .await
    }
}

/// Storage servers shared across every node's group objects, keyed by
/// address — the in-process stand-in for the real storage fleet.
pub type ServerRegistry = Arc<Mutex<HashMap<ServerAddr, Arc<MemoryServer>>>>;

/// A group constructor building memory-backed replica groups over the
/// shared registry.
pub fn shared_memory_factory(registry: ServerRegistry) -> NewGroup {
    Arc::new(move |group_id, servers| {
        let mut registry = registry.lock();
        let replicas: Vec<Arc<dyn StorageServer>> = servers
            .into_iter()
            .map(|addr| {
                Arc::clone(
                    registry
                        .entry(addr.clone())
                        .or_insert_with(|| Arc::new(MemoryServer::new(addr))),
                ) as Arc<dyn StorageServer>
            })
            .collect();
        let quorum = replicas.len() / 2 + 1;
        Arc::new(ReplicaGroup::new(group_id, replicas, quorum)) as Arc<dyn Group>
    })
}

pub struct TestNode {
    pub id: NodeId,
    pub coordinator: Arc<Coordinator>,
    _data_dir: TempDir,
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub registry: ServerRegistry,
    mesh: LocalMesh,
}

impl TestCluster {
    /// Start `count` nodes: the first bootstraps, the rest are joined as
    /// voters. Returns once every node is a cluster member and a leader
    /// exists.
    pub async fn start(count: usize) -> Self {
        assert!(count > 0);

        let mesh = LocalMesh::default();
        let registry: ServerRegistry = Arc::new(Mutex::new(HashMap::new()));
        let mut nodes = Vec::new();

        for i in 0..count {
            let id = (i + 1) as NodeId;
            let node = Self::spawn_node(&mesh, &registry, id, id == 1);
            nodes.push(node);
        }

        let cluster = Self {
            nodes,
            registry,
            mesh,
        };

        let leader = cluster.wait_for_leader().await;
        for i in 1..count {
            let id = (i + 1) as NodeId;
            leader
                .join(id, format!("mesh://{}", id))
                .await
                .expect("join failed");
        }

        cluster
    }

    /// Start one more node and join it to the running cluster.
    pub async fn grow(&mut self) -> NodeId {
        let id = (self.nodes.len() + 1) as NodeId;
        let node = Self::spawn_node(&self.mesh, &self.registry, id, false);
        self.nodes.push(node);

        let leader = self.wait_for_leader().await;
        leader
            .join(id, format!("mesh://{}", id))
            .await
            .expect("join failed");
        id
    }

    fn spawn_node(
        mesh: &LocalMesh,
        registry: &ServerRegistry,
        id: NodeId,
        bootstrap: bool,
    ) -> TestNode {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let settings = RaftSettings {
            bind_addr: format!("127.0.0.1:{}", 9100 + id).parse().expect("addr"),
            peers: HashMap::new(),
            bootstrap,
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            snapshot_threshold: 10_000,
            propose_timeout: Duration::from_secs(10),
        };

        let coordinator = Coordinator::open(
            bootstrap,
            id,
            &settings,
            data_dir.path(),
            shared_memory_factory(Arc::clone(registry)),
            Arc::new(mesh.clone()),
            Arc::new(RwLock::new(HashMap::new())),
        )
        .expect("failed to open coordinator");
        let coordinator = Arc::new(coordinator);
        mesh.register(id, coordinator.raft_handle());

        TestNode {
            id,
            coordinator,
            _data_dir: data_dir,
        }
    }

    pub fn node(&self, id: NodeId) -> &Arc<Coordinator> {
        &self
            .nodes
            .iter()
            .find(|n| n.id == id)
            .expect("no such node")
            .coordinator
    }

    /// The current leader's coordinator.
    pub async fn wait_for_leader(&self) -> Arc<Coordinator> {
        for _ in 0..200 {
            for node in &self.nodes {
                if node.coordinator.is_leader().await {
                    return Arc::clone(&node.coordinator);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
