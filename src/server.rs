//! Node wiring and the HTTP transport.
//!
//! A keyplane node serves two surfaces:
//!
//! - the raft RPC endpoints peers use for consensus traffic, bound to
//!   `raft.bind_addr`;
//! - the coordination API the (out-of-scope) request router and operators
//!   use, bound to `api.bind_addr`.
//!
//! Both speak JSON. Errors serialize as `{"error", "category"}` with a
//! category-appropriate status code.

use crate::cluster::{validate_slot_id, Coordinator, Group, GroupView, NewGroup, SlotView};
use crate::config::{GroupSettings, KeyplaneConfig};
use crate::error::{ErrorCategory, KeyplaneError, Result};
use crate::group::{HttpServerClient, ReplicaGroup, StorageServer};
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftCommand, RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
use crate::types::{GroupId, NodeId, ServerAddr, SlotId};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

/// Connect timeout for raft RPCs between nodes.
const RAFT_RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Request timeout for raft RPCs between nodes.
const RAFT_RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Raft transport over HTTP. The peer map is shared with the raft node,
/// so voter additions take effect without restarting the transport.
pub struct NetworkRpc {
    peers: Arc<RwLock<HashMap<NodeId, String>>>,
    client: reqwest::Client,
}

impl NetworkRpc {
    pub fn new(peers: Arc<RwLock<HashMap<NodeId, String>>>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(RAFT_RPC_CONNECT_TIMEOUT)
            .timeout(RAFT_RPC_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { peers, client }
    }

    fn peer_url(&self, target: NodeId, endpoint: &str) -> Result<String> {
        self.peers
            .read()
            .get(&target)
            .map(|addr| format!("http://{}/raft/{}", addr, endpoint))
            .ok_or_else(|| KeyplaneError::Network(format!("unknown peer {}", target)))
    }

    async fn post<Req: Serialize, Reply: for<'de> Deserialize<'de>>(
        &self,
        target: NodeId,
        endpoint: &str,
        request: &Req,
    ) -> Result<Reply> {
        let url = self.peer_url(target, endpoint)?;
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| KeyplaneError::Network(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| KeyplaneError::Serialization(e.to_string()))
    }
}

#[async_trait::async_trait]
impl RaftRpc for NetworkRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.post(target, "request_vote", &request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.post(target, "append_entries", &request).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.post(target, "install_snapshot", &request).await
    }
}

/// The default group constructor: HTTP-backed replica groups with a
/// majority write quorum unless configured otherwise.
pub fn http_group_factory(settings: GroupSettings) -> NewGroup {
    Arc::new(move |group_id, servers| {
        let replicas: Vec<Arc<dyn StorageServer>> = servers
            .into_iter()
            .map(|addr| {
                Arc::new(HttpServerClient::new(addr, settings.request_timeout))
                    as Arc<dyn StorageServer>
            })
            .collect();
        let quorum = settings
            .write_quorum
            .unwrap_or(replicas.len() / 2 + 1)
            .clamp(1, replicas.len().max(1));
        Arc::new(ReplicaGroup::new(group_id, replicas, quorum)) as Arc<dyn Group>
    })
}

/// Run a keyplane node until one of its listeners fails.
pub async fn run(config: KeyplaneConfig) -> Result<()> {
    config.validate()?;
    info!(node_id = config.node.id, name = %config.node.name, "starting keyplane node");

    std::fs::create_dir_all(&config.storage.data_dir)?;

    let peer_addrs = Arc::new(RwLock::new(HashMap::new()));
    let rpc = Arc::new(NetworkRpc::new(Arc::clone(&peer_addrs)));
    let coordinator = Arc::new(Coordinator::open(
        config.raft.bootstrap,
        config.node.id,
        &config.raft,
        &config.storage.data_dir,
        http_group_factory(config.group.clone()),
        rpc,
        peer_addrs,
    )?);

    let raft_listener = TcpListener::bind(config.raft.bind_addr).await?;
    let api_listener = TcpListener::bind(config.api.bind_addr).await?;
    info!(
        raft_addr = %config.raft.bind_addr,
        api_addr = %config.api.bind_addr,
        "listening"
    );

    let raft_app = raft_router(Arc::clone(&coordinator));
    let api_app = api_router(Arc::clone(&coordinator));

    tokio::try_join!(
        async {
            axum::serve(raft_listener, raft_app)
                .await
                .map_err(|e| KeyplaneError::Network(e.to_string()))
        },
        async {
            axum::serve(api_listener, api_app)
                .await
                .map_err(|e| KeyplaneError::Network(e.to_string()))
        },
    )?;

    Ok(())
}

/// The raft RPC surface served to peers.
pub fn raft_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(raft_request_vote))
        .route("/raft/append_entries", post(raft_append_entries))
        .route("/raft/install_snapshot", post(raft_install_snapshot))
        .with_state(coordinator)
}

/// The coordination API surface.
pub fn api_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/groups", post(add_group).get(list_groups))
        .route("/groups/:id", delete(del_group))
        .route("/slots", get(list_slots))
        .route("/slots/assign", post(assign_slots))
        .route("/slots/migrate", post(migrate_slots))
        .route("/route/:key", get(route_key))
        .route("/join", post(join))
        .route("/status", get(status))
        .with_state(coordinator)
}

/// A [`KeyplaneError`] rendered over HTTP.
struct ApiError(KeyplaneError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    category: ErrorCategory,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.0.category();
        let status = match category {
            ErrorCategory::NotLeader => StatusCode::MISDIRECTED_REQUEST,
            ErrorCategory::InvalidArg => StatusCode::BAD_REQUEST,
            ErrorCategory::StateTransitionDenied => StatusCode::CONFLICT,
            ErrorCategory::GroupNotFound => StatusCode::NOT_FOUND,
            ErrorCategory::NoQuorum => StatusCode::BAD_GATEWAY,
            ErrorCategory::SlotNotRoutable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            category,
        };
        (status, Json(body)).into_response()
    }
}

impl From<KeyplaneError> for ApiError {
    fn from(e: KeyplaneError) -> Self {
        Self(e)
    }
}

async fn forward_raft<Req, Reply>(
    coordinator: &Coordinator,
    make: impl FnOnce(Req, oneshot::Sender<Reply>) -> RaftCommand<crate::cluster::CommandResult>,
    request: Req,
) -> std::result::Result<Json<Reply>, ApiError> {
    let (tx, rx) = oneshot::channel();
    coordinator
        .raft_handle()
        .send(make(request, tx))
        .await
        .map_err(|_| KeyplaneError::Consensus("raft node unavailable".into()))?;
    let reply = rx
        .await
        .map_err(|_| KeyplaneError::Consensus("raft node unavailable".into()))?;
    Ok(Json(reply))
}

async fn raft_request_vote(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<RequestVoteRequest>,
) -> std::result::Result<Json<RequestVoteResponse>, ApiError> {
    forward_raft(
        &coordinator,
        |request, response| RaftCommand::RequestVote { request, response },
        request,
    )
    .await
}

async fn raft_append_entries(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<AppendEntriesRequest>,
) -> std::result::Result<Json<AppendEntriesResponse>, ApiError> {
    forward_raft(
        &coordinator,
        |request, response| RaftCommand::AppendEntries { request, response },
        request,
    )
    .await
}

async fn raft_install_snapshot(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<InstallSnapshotRequest>,
) -> std::result::Result<Json<InstallSnapshotResponse>, ApiError> {
    forward_raft(
        &coordinator,
        |request, response| RaftCommand::InstallSnapshot { request, response },
        request,
    )
    .await
}

#[derive(Serialize)]
struct Ack {
    ok: bool,
}

#[derive(Deserialize)]
struct AddGroupRequest {
    group_id: GroupId,
    servers: Vec<ServerAddr>,
}

async fn add_group(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<AddGroupRequest>,
) -> std::result::Result<Json<Ack>, ApiError> {
    coordinator
        .add_group(request.group_id, request.servers)
        .await?;
    Ok(Json(Ack { ok: true }))
}

async fn del_group(
    State(coordinator): State<Arc<Coordinator>>,
    Path(group_id): Path<GroupId>,
) -> std::result::Result<Json<Ack>, ApiError> {
    coordinator.del_group(group_id).await?;
    Ok(Json(Ack { ok: true }))
}

#[derive(Deserialize)]
struct SlotRangeRequest {
    group_id: GroupId,
    start_slot_id: i64,
    stop_slot_id: i64,
}

impl SlotRangeRequest {
    fn validated(&self) -> std::result::Result<(GroupId, SlotId, SlotId), ApiError> {
        let start = validate_slot_id(self.start_slot_id)?;
        let stop = validate_slot_id(self.stop_slot_id)?;
        Ok((self.group_id, start, stop))
    }
}

async fn assign_slots(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<SlotRangeRequest>,
) -> std::result::Result<Json<Ack>, ApiError> {
    let (group_id, start, stop) = request.validated()?;
    coordinator.assign_slots(group_id, start, stop).await?;
    Ok(Json(Ack { ok: true }))
}

async fn migrate_slots(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<SlotRangeRequest>,
) -> std::result::Result<Json<Ack>, ApiError> {
    let (group_id, start, stop) = request.validated()?;
    coordinator.migrate_slots(group_id, start, stop).await?;
    Ok(Json(Ack { ok: true }))
}

#[derive(Deserialize)]
struct IdsQuery {
    /// Comma-separated ids; absent means all.
    ids: Option<String>,
}

impl IdsQuery {
    fn parse<T: std::str::FromStr>(&self) -> std::result::Result<Vec<T>, ApiError> {
        let Some(ids) = &self.ids else {
            return Ok(Vec::new());
        };
        ids.split(',')
            .map(|part| {
                part.trim().parse::<T>().map_err(|_| {
                    ApiError(KeyplaneError::InvalidArgument(format!(
                        "bad id '{}'",
                        part
                    )))
                })
            })
            .collect()
    }
}

async fn list_slots(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<IdsQuery>,
) -> std::result::Result<Json<Vec<SlotView>>, ApiError> {
    let ids: Vec<SlotId> = query.parse()?;
    Ok(Json(coordinator.slots(&ids)))
}

async fn list_groups(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<IdsQuery>,
) -> std::result::Result<Json<Vec<GroupView>>, ApiError> {
    let ids: Vec<GroupId> = query.parse()?;
    Ok(Json(coordinator.groups(&ids)))
}

#[derive(Serialize)]
struct RouteReply {
    slot_id: SlotId,
    group_id: GroupId,
    servers: Vec<ServerAddr>,
}

async fn route_key(
    State(coordinator): State<Arc<Coordinator>>,
    Path(key): Path<String>,
) -> std::result::Result<Json<RouteReply>, ApiError> {
    let group = coordinator.get_group_by_key(&key).await?;
    Ok(Json(RouteReply {
        slot_id: crate::cluster::slot_id_for_key(&key),
        group_id: group.id(),
        servers: group.servers(),
    }))
}

#[derive(Deserialize)]
struct JoinRequest {
    node_id: NodeId,
    addr: String,
}

async fn join(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<JoinRequest>,
) -> std::result::Result<Json<Ack>, ApiError> {
    coordinator.join(request.node_id, request.addr).await?;
    Ok(Json(Ack { ok: true }))
}

#[derive(Serialize)]
struct StatusReply {
    node_id: NodeId,
    is_leader: bool,
    leader_id: Option<NodeId>,
    term: u64,
    last_applied: u64,
}

async fn status(
    State(coordinator): State<Arc<Coordinator>>,
) -> std::result::Result<Json<StatusReply>, ApiError> {
    let status = coordinator.status().await?;
    Ok(Json(StatusReply {
        node_id: coordinator.node_id(),
        is_leader: status.is_leader,
        leader_id: status.leader_id,
        term: status.term,
        last_applied: status.last_applied,
    }))
}
