use super::replica_set;
use crate::address::{BlockId, DataAddress};
use crate::cluster::{AllocationService, BlockServerRpc, StoredNode};
use crate::error::{BasaltError, Result};
use crate::node_store::{NodeCache, ReplicaSetCache, TreeNode, codec};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct PersistNodesOperation {
    allocation: Arc<dyn AllocationService>,
    block_rpc: Arc<dyn BlockServerRpc>,
    replica_sets: Arc<ReplicaSetCache>,
    node_cache: Arc<NodeCache>,
}

#[derive(Debug, Clone)]
pub struct PersistNodesOperationRequest {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone)]
pub struct PersistNodesOperationResult {
    /// One address per requested node, in request order.
    pub addresses: Vec<DataAddress>,
}

/// Nodes that reached one replica during a persist attempt.
struct WrittenNodes {
    replica: String,
    addresses: Vec<DataAddress>,
}

impl PersistNodesOperation {
    pub fn new(
        allocation: Arc<dyn AllocationService>,
        block_rpc: Arc<dyn BlockServerRpc>,
        replica_sets: Arc<ReplicaSetCache>,
        node_cache: Arc<NodeCache>,
    ) -> Self {
        Self {
            allocation,
            block_rpc,
            replica_sets,
            node_cache,
        }
    }

    /// Writes every node to every replica of its block. A failed attempt is
    /// rolled back and retried once.
    pub async fn run(
        &self,
        request: PersistNodesOperationRequest,
    ) -> Result<PersistNodesOperationResult> {
        let PersistNodesOperationRequest { nodes } = request;
        if nodes.is_empty() {
            return Ok(PersistNodesOperationResult {
                addresses: Vec::new(),
            });
        }

        let addresses = match self.persist_once(&nodes).await {
            Ok(addresses) => addresses,
            Err(error) => {
                tracing::warn!("persist of {} nodes failed, retrying: {}", nodes.len(), error);
                self.persist_once(&nodes).await?
            }
        };

        for (address, node) in addresses.iter().zip(nodes) {
            self.node_cache.insert(*address, node);
        }
        Ok(PersistNodesOperationResult { addresses })
    }

    async fn persist_once(&self, nodes: &[TreeNode]) -> Result<Vec<DataAddress>> {
        let mut addresses = Vec::with_capacity(nodes.len());
        let mut by_block: BTreeMap<BlockId, Vec<StoredNode>> = BTreeMap::new();

        for node in nodes {
            let bytes = codec::encode(node)?;
            let address = self.allocation.allocate_node(bytes.len() as u32).await?;
            addresses.push(address);
            by_block
                .entry(address.block_id())
                .or_default()
                .push(StoredNode { address, bytes });
        }

        let mut written: Vec<WrittenNodes> = Vec::new();
        for (block_id, stored) in by_block {
            if let Err(error) = self.write_block(block_id, stored, &mut written).await {
                self.rollback(&written).await;
                return Err(error);
            }
        }

        Ok(addresses)
    }

    async fn write_block(
        &self,
        block_id: BlockId,
        stored: Vec<StoredNode>,
        written: &mut Vec<WrittenNodes>,
    ) -> Result<()> {
        let replicas = replica_set(&self.allocation, &self.replica_sets, block_id).await?;
        if replicas.is_empty() {
            return Err(BasaltError::BlockUnavailable(block_id));
        }

        let node_addresses: Vec<DataAddress> = stored.iter().map(|node| node.address).collect();
        let writes = replicas.iter().map(|replica| {
            let stored = stored.clone();
            async move {
                let result = self
                    .block_rpc
                    .write_to_block(&replica.address, block_id, stored)
                    .await;
                (replica.address.clone(), result)
            }
        });

        let mut first_error = None;
        for (replica, result) in join_all(writes).await {
            match result {
                Ok(()) => written.push(WrittenNodes {
                    replica,
                    addresses: node_addresses.clone(),
                }),
                Err(error) => {
                    tracing::warn!(
                        "block write failed replica={} block_id={}: {}",
                        replica,
                        block_id,
                        error
                    );
                    if let Err(report) = self.allocation.notify_block_server_failure(&replica).await
                    {
                        tracing::warn!("failure report for {} not delivered: {}", replica, report);
                    }
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => {
                self.replica_sets.invalidate(block_id);
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn rollback(&self, written: &[WrittenNodes]) {
        let rollbacks = written.iter().map(|nodes| async move {
            let result = self
                .block_rpc
                .rollback_nodes(&nodes.replica, nodes.addresses.clone())
                .await;
            (nodes, result)
        });

        for (nodes, result) in join_all(rollbacks).await {
            if let Err(error) = result {
                tracing::warn!(
                    "rollback of {} nodes failed replica={}: {}",
                    nodes.addresses.len(),
                    nodes.replica,
                    error
                );
            }
        }
    }
}
