use super::replica_set;
use crate::address::{BlockId, DataAddress, NodeId};
use crate::cluster::{AllocationService, BlockServerRpc, BlockServerStatus, StoredNode};
use crate::error::{BasaltError, Result};
use crate::node_store::{NodeCache, ReplicaSetCache, TreeNode, codec};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Minimum gap between two corruption reports for one replica and block.
pub const CORRUPTION_REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct FetchNodesOperation {
    allocation: Arc<dyn AllocationService>,
    block_rpc: Arc<dyn BlockServerRpc>,
    replica_sets: Arc<ReplicaSetCache>,
    node_cache: Arc<NodeCache>,
    /// Address prefix of replicas on the caller's network segment.
    local_segment: Option<String>,
    corruption_reports: Arc<Mutex<HashMap<(String, BlockId), Instant>>>,
}

#[derive(Debug, Clone)]
pub struct FetchNodesOperationRequest {
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct FetchNodesOperationResult {
    /// Decoded nodes in request order.
    pub nodes: Vec<TreeNode>,
}

enum ReadOutcome {
    Found(HashMap<DataAddress, TreeNode>),
    Failed,
}

impl FetchNodesOperation {
    pub fn new(
        allocation: Arc<dyn AllocationService>,
        block_rpc: Arc<dyn BlockServerRpc>,
        replica_sets: Arc<ReplicaSetCache>,
        node_cache: Arc<NodeCache>,
        local_segment: Option<String>,
    ) -> Self {
        Self {
            allocation,
            block_rpc,
            replica_sets,
            node_cache,
            local_segment,
            corruption_reports: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(
        &self,
        request: FetchNodesOperationRequest,
    ) -> Result<FetchNodesOperationResult> {
        let FetchNodesOperationRequest { node_ids } = request;

        let mut resolved: Vec<Option<TreeNode>> = vec![None; node_ids.len()];
        let mut misses: BTreeMap<BlockId, Vec<(usize, DataAddress)>> = BTreeMap::new();

        for (index, node_id) in node_ids.iter().enumerate() {
            match node_id {
                NodeId::Sparse { fill, length } => {
                    resolved[index] = Some(TreeNode::sparse(*fill, *length));
                }
                NodeId::Stored { address } => match self.node_cache.get(address) {
                    Some(node) => resolved[index] = Some(node),
                    None => misses
                        .entry(address.block_id())
                        .or_default()
                        .push((index, *address)),
                },
            }
        }

        for (block_id, wanted) in misses {
            let mut addresses: Vec<DataAddress> = wanted.iter().map(|(_, address)| *address).collect();
            addresses.sort();
            addresses.dedup();

            let found = self.fetch_block(block_id, addresses).await?;
            for (index, address) in wanted {
                let node = found
                    .get(&address)
                    .cloned()
                    .ok_or(BasaltError::NodeNotFound(address))?;
                self.node_cache.insert(address, node.clone());
                resolved[index] = Some(node);
            }
        }

        let nodes = resolved
            .into_iter()
            .map(|node| node.ok_or_else(|| BasaltError::Internal("unresolved node".to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(FetchNodesOperationResult { nodes })
    }

    async fn fetch_block(
        &self,
        block_id: BlockId,
        addresses: Vec<DataAddress>,
    ) -> Result<HashMap<DataAddress, TreeNode>> {
        let replicas = self.ordered_replicas(block_id).await?;

        for replica in replicas {
            match self.read_replica(&replica, block_id, &addresses).await {
                ReadOutcome::Found(nodes) => return Ok(nodes),
                ReadOutcome::Failed => continue,
            }
        }

        Err(BasaltError::BlockUnavailable(block_id))
    }

    async fn read_replica(
        &self,
        replica: &BlockServerStatus,
        block_id: BlockId,
        addresses: &[DataAddress],
    ) -> ReadOutcome {
        let stored = match self
            .block_rpc
            .read_from_block(&replica.address, block_id, addresses.to_vec())
            .await
        {
            Ok(stored) => stored,
            Err(error) if error.is_connection_fault() => {
                tracing::warn!("replica unreachable address={}: {}", replica.address, error);
                self.replica_sets.invalidate(block_id);
                if let Err(report) = self
                    .allocation
                    .notify_block_server_failure(&replica.address)
                    .await
                {
                    tracing::warn!("failure report not delivered: {}", report);
                }
                return ReadOutcome::Failed;
            }
            Err(error) => {
                tracing::warn!(
                    "replica read failed address={} block_id={}: {}",
                    replica.address,
                    block_id,
                    error
                );
                return ReadOutcome::Failed;
            }
        };

        match decode_all(addresses, stored) {
            Ok(nodes) => ReadOutcome::Found(nodes),
            Err(error @ BasaltError::ChecksumMismatch { .. }) => {
                tracing::warn!(
                    "corrupt node from replica address={}: {}",
                    replica.address,
                    error
                );
                self.report_corruption(&replica.address, block_id).await;
                ReadOutcome::Failed
            }
            Err(error) => {
                tracing::warn!("bad read response address={}: {}", replica.address, error);
                ReadOutcome::Failed
            }
        }
    }

    /// Local-segment replicas first, the rest shuffled, known-down last.
    async fn ordered_replicas(&self, block_id: BlockId) -> Result<Vec<BlockServerStatus>> {
        let replicas = replica_set(&self.allocation, &self.replica_sets, block_id).await?;

        let mut local = Vec::new();
        let mut remote = Vec::new();
        let mut down = Vec::new();
        for replica in replicas {
            if !replica.status.is_up() {
                down.push(replica);
            } else if self.is_local(&replica.address) {
                local.push(replica);
            } else {
                remote.push(replica);
            }
        }

        {
            let mut rng = rand::thread_rng();
            local.shuffle(&mut rng);
            remote.shuffle(&mut rng);
        }

        local.extend(remote);
        local.extend(down);
        Ok(local)
    }

    fn is_local(&self, address: &str) -> bool {
        self.local_segment
            .as_deref()
            .is_some_and(|segment| address.starts_with(segment))
    }

    async fn report_corruption(&self, address: &str, block_id: BlockId) {
        {
            let mut reports = self.corruption_reports.lock().await;
            let key = (address.to_string(), block_id);
            let now = Instant::now();
            if let Some(previous) = reports.get(&key) {
                if now.duration_since(*previous) < CORRUPTION_REPORT_INTERVAL {
                    return;
                }
            }
            reports.insert(key, now);
        }

        if let Err(error) = self
            .allocation
            .notify_block_id_corruption(address, block_id, "checksum")
            .await
        {
            tracing::warn!("corruption report not delivered: {}", error);
        }
    }
}

fn decode_all(
    addresses: &[DataAddress],
    stored: Vec<StoredNode>,
) -> Result<HashMap<DataAddress, TreeNode>> {
    let by_address: HashMap<DataAddress, _> = stored
        .into_iter()
        .map(|node| (node.address, node.bytes))
        .collect();

    let mut nodes = HashMap::with_capacity(addresses.len());
    for address in addresses {
        let bytes = by_address
            .get(address)
            .ok_or(BasaltError::NodeNotFound(*address))?;
        nodes.insert(*address, codec::decode(*address, bytes)?);
    }
    Ok(nodes)
}
