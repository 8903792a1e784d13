use super::InternalBlockOperation;
use super::internal_block::InternalWriteBlockOperationRequest;
use crate::address::{BlockId, DataAddress};
use crate::cluster::{BlockServerRpc, StoredNode};
use crate::error::{BasaltError, Result};
use crate::storage::BlockStore;
use std::sync::Arc;

/// Nodes streamed per `send_block_part` call.
pub const TRANSFER_PART_NODES: usize = 64;

/// Copies whole blocks between block servers.
#[derive(Clone)]
pub struct TransferBlockOperation {
    store: Arc<BlockStore>,
    internal: InternalBlockOperation,
    block_rpc: Arc<dyn BlockServerRpc>,
}

#[derive(Debug, Clone)]
pub struct TransferBlockOperationRequest {
    pub block_id: BlockId,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct TransferBlockOperationResult {
    pub nodes: usize,
    pub checksum: u64,
}

impl TransferBlockOperation {
    pub fn new(
        store: Arc<BlockStore>,
        internal: InternalBlockOperation,
        block_rpc: Arc<dyn BlockServerRpc>,
    ) -> Self {
        Self {
            store,
            internal,
            block_rpc,
        }
    }

    /// Streams the local copy of a block to `destination` and checks that
    /// both sides end with the same checksum.
    pub async fn run_send(
        &self,
        request: TransferBlockOperationRequest,
    ) -> Result<TransferBlockOperationResult> {
        let TransferBlockOperationRequest {
            block_id,
            destination,
        } = request;

        self.store.flush(block_id).await?;
        let data_ids = self.store.list_nodes(block_id).await?;

        for chunk in data_ids.chunks(TRANSFER_PART_NODES) {
            let mut part = Vec::with_capacity(chunk.len());
            for data_id in chunk {
                let address = DataAddress::new(block_id, *data_id)?;
                let Some(bytes) = self.store.read_node(address).await? else {
                    continue;
                };
                part.push(StoredNode { address, bytes });
            }
            self.block_rpc
                .send_block_part(&destination, block_id, part)
                .await?;
        }

        let remote = self
            .block_rpc
            .send_block_complete(&destination, block_id)
            .await?;
        let local = self.store.checksum(block_id).await?;
        if local != remote {
            return Err(BasaltError::TransferChecksumMismatch {
                block_id,
                local,
                remote,
            });
        }

        tracing::info!(
            "transferred block block_id={} destination={} nodes={}",
            block_id,
            destination,
            data_ids.len()
        );
        Ok(TransferBlockOperationResult {
            nodes: data_ids.len(),
            checksum: local,
        })
    }

    pub async fn run_receive_part(&self, block_id: BlockId, nodes: Vec<StoredNode>) -> Result<()> {
        self.internal
            .run_write(InternalWriteBlockOperationRequest { block_id, nodes })
            .await
    }

    pub async fn run_receive_complete(&self, block_id: BlockId) -> Result<u64> {
        self.store.close_block(block_id).await?;
        self.store.checksum(block_id).await
    }
}
