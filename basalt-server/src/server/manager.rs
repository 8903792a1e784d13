use super::ServerState;
use axum::{Json, Router, extract::State, response::Response, routing::post};
use basalt_core::cluster::rpc::*;
use basalt_core::{LogEntry, Result};
use std::sync::Arc;

pub(super) fn routes() -> Router<Arc<ServerState>> {
    Router::new()
        .route(URI_ALLOCATE_NODE, post(allocate_node))
        .route(URI_REGISTER_BLOCK_SERVER, post(register_block_server))
        .route(URI_DEREGISTER_BLOCK_SERVER, post(deregister_block_server))
        .route(URI_KV_PROPOSAL, post(kv_proposal))
        .route(URI_KV_COMPLETE, post(kv_complete))
        .route(URI_BS_PROPOSAL, post(bs_proposal))
        .route(URI_BS_COMPLETE, post(bs_complete))
        .route(URI_FETCH_LOG_BUNDLE, post(fetch_log_bundle))
        .route(URI_ADD_BLOCK_SERVER_MAPPING, post(add_block_server_mapping))
        .route(URI_REMOVE_BLOCK_SERVER_MAPPING, post(remove_block_server_mapping))
        .route(URI_SERVER_LIST, post(server_list))
        .route(URI_SERVER_LIST_FOR_BLOCK, post(server_list_for_block))
        .route(URI_NOTIFY_BLOCK_SERVER_FAILURE, post(notify_block_server_failure))
        .route(URI_NOTIFY_BLOCK_CORRUPTION, post(notify_block_corruption))
}

async fn allocate_node(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<AllocateNodeRequest>,
) -> Response {
    let result: Result<_> = async {
        let address = state.manager()?.allocator.allocate_node(request.size).await?;
        Ok(AllocateNodeResponse { address })
    }
    .await;
    state.respond(result)
}

async fn register_block_server(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RegisterBlockServerRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .manager()?
            .allocator
            .register_block_server(&request.address, request.server_guid)
            .await
    }
    .await;
    state.ack(result)
}

async fn deregister_block_server(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeregisterBlockServerRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .manager()?
            .allocator
            .deregister_block_server(&request.address)
            .await
    }
    .await;
    state.ack(result)
}

fn handle_proposal(state: &ServerState, entry: LogEntry) -> Result<()> {
    state.manager()?.value_store.handle_proposal(&entry)
}

fn handle_complete(state: &ServerState, entry: LogEntry) -> Result<()> {
    let applied = state.manager()?.value_store.handle_complete(&entry)?;
    if !applied {
        tracing::debug!("complete already applied uid={}", entry.uid());
    }
    Ok(())
}

async fn kv_proposal(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<KeyValueMessage>,
) -> Response {
    state.ack(handle_proposal(&state, message.into()))
}

async fn kv_complete(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<KeyValueMessage>,
) -> Response {
    state.ack(handle_complete(&state, message.into()))
}

async fn bs_proposal(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<BlockServersMessage>,
) -> Response {
    state.ack(handle_proposal(&state, message.into()))
}

async fn bs_complete(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<BlockServersMessage>,
) -> Response {
    state.ack(handle_complete(&state, message.into()))
}

async fn fetch_log_bundle(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<FetchLogBundleRequest>,
) -> Response {
    let result = state.manager().and_then(|manager| {
        let entries = manager
            .value_store
            .fetch_log_bundle(request.from_uid, request.initial)?;
        Ok(FetchLogBundleResponse { entries })
    });
    state.respond(result)
}

async fn add_block_server_mapping(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BlockServerMappingRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .manager()?
            .allocator
            .internal_add_block_server_mapping(request.block_id, &request.server_guids)
            .await
    }
    .await;
    state.ack(result)
}

async fn remove_block_server_mapping(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BlockServerMappingRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .manager()?
            .allocator
            .internal_remove_block_server_mapping(request.block_id, &request.server_guids)
            .await
    }
    .await;
    state.ack(result)
}

async fn server_list(State(state): State<Arc<ServerState>>) -> Response {
    let result: Result<_> = async {
        let servers = state.manager()?.allocator.get_server_list().await?;
        Ok(ServerListResponse { servers })
    }
    .await;
    state.respond(result)
}

async fn server_list_for_block(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BlockIdRequest>,
) -> Response {
    let result: Result<_> = async {
        let servers = state
            .manager()?
            .allocator
            .get_server_list_for_block(request.block_id)
            .await?;
        Ok(ServerListResponse { servers })
    }
    .await;
    state.respond(result)
}

async fn notify_block_server_failure(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<NotifyBlockServerFailureRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .manager()?
            .allocator
            .notify_block_server_failure(&request.address)
            .await
    }
    .await;
    state.ack(result)
}

async fn notify_block_corruption(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<NotifyBlockCorruptionRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .manager()?
            .allocator
            .notify_block_id_corruption(&request.address, request.block_id, &request.kind)
            .await
    }
    .await;
    state.ack(result)
}
