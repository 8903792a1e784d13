pub mod fetch_nodes;
pub mod internal_block;
pub mod persist_nodes;
pub mod transfer_block;

pub use fetch_nodes::{FetchNodesOperation, FetchNodesOperationRequest, FetchNodesOperationResult};
pub use internal_block::{
    InternalBlockOperation, InternalReadBlockOperationRequest, InternalRollbackOperationResult,
    InternalWriteBlockOperationRequest,
};
pub use persist_nodes::{
    PersistNodesOperation, PersistNodesOperationRequest, PersistNodesOperationResult,
};
pub use transfer_block::{
    TRANSFER_PART_NODES, TransferBlockOperation, TransferBlockOperationRequest,
    TransferBlockOperationResult,
};

use crate::address::BlockId;
use crate::cluster::{AllocationService, BlockServerStatus};
use crate::error::Result;
use crate::node_store::ReplicaSetCache;
use std::sync::Arc;

/// Replica list for a block, served from the cache when possible.
pub(crate) async fn replica_set(
    allocation: &Arc<dyn AllocationService>,
    cache: &ReplicaSetCache,
    block_id: BlockId,
) -> Result<Vec<BlockServerStatus>> {
    if let Some(replicas) = cache.get(block_id) {
        return Ok(replicas);
    }

    let replicas = allocation.get_server_list_for_block(block_id).await?;
    if !replicas.is_empty() {
        cache.insert(block_id, replicas.clone());
    }
    Ok(replicas)
}
