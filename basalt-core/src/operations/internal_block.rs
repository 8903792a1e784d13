use crate::address::{BlockId, DataAddress};
use crate::cluster::StoredNode;
use crate::error::{BasaltError, Result};
use crate::node_store::codec;
use crate::storage::BlockStore;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Block-server side of node writes, reads and maintenance calls.
#[derive(Clone)]
pub struct InternalBlockOperation {
    store: Arc<BlockStore>,
    current_block: Arc<Mutex<Option<BlockId>>>,
}

#[derive(Debug, Clone)]
pub struct InternalWriteBlockOperationRequest {
    pub block_id: BlockId,
    pub nodes: Vec<StoredNode>,
}

#[derive(Debug, Clone)]
pub struct InternalReadBlockOperationRequest {
    pub block_id: BlockId,
    pub addresses: Vec<DataAddress>,
}

#[derive(Debug, Clone)]
pub struct InternalRollbackOperationResult {
    pub removed: usize,
}

impl InternalBlockOperation {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self {
            store,
            current_block: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn current_block(&self) -> Option<BlockId> {
        *self.current_block.lock().await
    }

    /// Stores nodes after checking they belong to the block and are intact.
    pub async fn run_write(&self, request: InternalWriteBlockOperationRequest) -> Result<()> {
        let InternalWriteBlockOperationRequest { block_id, nodes } = request;

        for node in &nodes {
            ensure_in_block(block_id, node.address)?;
            codec::verify(node.address, &node.bytes)?;
        }

        for node in nodes {
            self.store.write_node(node.address, node.bytes).await?;
        }
        Ok(())
    }

    /// Every requested node must be present; a partial answer is an error.
    pub async fn run_read(
        &self,
        request: InternalReadBlockOperationRequest,
    ) -> Result<Vec<StoredNode>> {
        let InternalReadBlockOperationRequest {
            block_id,
            addresses,
        } = request;

        let mut nodes = Vec::with_capacity(addresses.len());
        for address in addresses {
            ensure_in_block(block_id, address)?;
            let bytes = self
                .store
                .read_node(address)
                .await?
                .ok_or(BasaltError::NodeNotFound(address))?;
            nodes.push(StoredNode { address, bytes });
        }
        Ok(nodes)
    }

    pub async fn run_rollback(
        &self,
        addresses: Vec<DataAddress>,
    ) -> Result<InternalRollbackOperationResult> {
        let mut removed = 0;
        for address in addresses {
            if self.store.delete_node(address).await? {
                removed += 1;
            }
        }
        tracing::debug!("rolled back {} nodes", removed);
        Ok(InternalRollbackOperationResult { removed })
    }

    pub async fn run_checksum(&self, block_id: BlockId) -> Result<u64> {
        self.store.checksum(block_id).await
    }

    /// Records the block managers now allocate from. The previous current
    /// block is immutable from here on, so it is flushed and closed.
    pub async fn run_notify_current(&self, block_id: BlockId) -> Result<()> {
        let mut current = self.current_block.lock().await;
        if *current == Some(block_id) {
            return Ok(());
        }

        if let Some(previous) = current.replace(block_id) {
            self.store.close_block(previous).await?;
            tracing::info!("block closed block_id={} current={}", previous, block_id);
        }
        self.store.open_block(block_id).await?;
        Ok(())
    }
}

fn ensure_in_block(block_id: BlockId, address: DataAddress) -> Result<()> {
    if address.block_id() != block_id {
        return Err(BasaltError::InvalidRequest(format!(
            "node {} is not in block {}",
            address, block_id
        )));
    }
    Ok(())
}
