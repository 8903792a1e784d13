use super::ServerState;
use axum::{Json, Router, extract::State, response::Response, routing::post};
use basalt_core::cluster::rpc::*;
use basalt_core::Result;
use basalt_core::operations::{
    InternalReadBlockOperationRequest, InternalWriteBlockOperationRequest,
    TransferBlockOperationRequest,
};
use std::sync::Arc;

pub(super) fn routes() -> Router<Arc<ServerState>> {
    Router::new()
        .route(URI_WRITE_TO_BLOCK, post(write_to_block))
        .route(URI_READ_FROM_BLOCK, post(read_from_block))
        .route(URI_ROLLBACK_NODES, post(rollback_nodes))
        .route(URI_BLOCK_CHECKSUM, post(block_checksum))
        .route(URI_NOTIFY_CURRENT_BLOCK, post(notify_current_block))
        .route(URI_SEND_BLOCK_TO, post(send_block_to))
        .route(URI_SEND_BLOCK_PART, post(send_block_part))
        .route(URI_SEND_BLOCK_COMPLETE, post(send_block_complete))
}

async fn write_to_block(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<WriteToBlockRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .block()?
            .internal
            .run_write(InternalWriteBlockOperationRequest {
                block_id: request.block_id,
                nodes: request.nodes,
            })
            .await
    }
    .await;
    state.ack(result)
}

async fn read_from_block(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ReadFromBlockRequest>,
) -> Response {
    let result: Result<_> = async {
        let nodes = state
            .block()?
            .internal
            .run_read(InternalReadBlockOperationRequest {
                block_id: request.block_id,
                addresses: request.addresses,
            })
            .await?;
        Ok(ReadFromBlockResponse { nodes })
    }
    .await;
    state.respond(result)
}

async fn rollback_nodes(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<RollbackNodesRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .block()?
            .internal
            .run_rollback(request.addresses)
            .await?;
        Ok(())
    }
    .await;
    state.ack(result)
}

async fn block_checksum(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BlockIdRequest>,
) -> Response {
    let result: Result<_> = async {
        let checksum = state
            .block()?
            .internal
            .run_checksum(request.block_id)
            .await?;
        Ok(BlockChecksumResponse { checksum })
    }
    .await;
    state.respond(result)
}

async fn notify_current_block(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BlockIdRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .block()?
            .internal
            .run_notify_current(request.block_id)
            .await
    }
    .await;
    state.ack(result)
}

async fn send_block_to(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SendBlockToRequest>,
) -> Response {
    let result: Result<_> = async {
        let transferred = state
            .block()?
            .transfer
            .run_send(TransferBlockOperationRequest {
                block_id: request.block_id,
                destination: request.destination,
            })
            .await?;
        Ok(BlockChecksumResponse {
            checksum: transferred.checksum,
        })
    }
    .await;
    state.respond(result)
}

async fn send_block_part(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SendBlockPartRequest>,
) -> Response {
    let result: Result<_> = async {
        state
            .block()?
            .transfer
            .run_receive_part(request.block_id, request.nodes)
            .await
    }
    .await;
    state.ack(result)
}

async fn send_block_complete(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BlockIdRequest>,
) -> Response {
    let result: Result<_> = async {
        let checksum = state
            .block()?
            .transfer
            .run_receive_complete(request.block_id)
            .await?;
        Ok(BlockChecksumResponse { checksum })
    }
    .await;
    state.respond(result)
}
