use super::codec::TreeNode;
use crate::address::{BlockId, DataAddress};
use crate::cluster::{BlockServerStatus, StatusChange};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 4096;

#[derive(Default)]
struct NodeCacheInner {
    nodes: HashMap<DataAddress, TreeNode>,
    order: VecDeque<DataAddress>,
}

/// Bounded cache of decoded nodes, evicting the oldest insert first.
/// Persisted nodes never change, so entries need no invalidation.
pub struct NodeCache {
    capacity: usize,
    inner: Mutex<NodeCacheInner>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(NodeCacheInner::default()),
        }
    }

    pub fn get(&self, address: &DataAddress) -> Option<TreeNode> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.nodes.get(address).cloned())
    }

    pub fn insert(&self, address: DataAddress, node: TreeNode) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.nodes.insert(address, node).is_some() {
            return;
        }
        inner.order.push_back(address);
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.nodes.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new(DEFAULT_NODE_CACHE_CAPACITY)
    }
}

/// Replica lists per block, dropped whenever one of their servers changes status.
pub struct ReplicaSetCache {
    sets: RwLock<HashMap<BlockId, Vec<BlockServerStatus>>>,
}

impl ReplicaSetCache {
    /// Builds the cache and starts dropping sets as `events` arrive.
    /// Must be called from within a tokio runtime.
    pub fn new(events: broadcast::Receiver<StatusChange>) -> Arc<Self> {
        let cache = Arc::new(Self {
            sets: RwLock::new(HashMap::new()),
        });
        cache.clone().spawn_invalidation(events);
        cache
    }

    pub fn get(&self, block_id: BlockId) -> Option<Vec<BlockServerStatus>> {
        self.sets
            .read()
            .ok()
            .and_then(|sets| sets.get(&block_id).cloned())
    }

    pub fn insert(&self, block_id: BlockId, replicas: Vec<BlockServerStatus>) {
        if let Ok(mut sets) = self.sets.write() {
            sets.insert(block_id, replicas);
        }
    }

    pub fn invalidate(&self, block_id: BlockId) {
        if let Ok(mut sets) = self.sets.write() {
            sets.remove(&block_id);
        }
    }

    /// Drops every cached set that lists `address`.
    pub fn invalidate_address(&self, address: &str) {
        if let Ok(mut sets) = self.sets.write() {
            sets.retain(|_, replicas| !replicas.iter().any(|replica| replica.address == address));
        }
    }

    fn spawn_invalidation(self: Arc<Self>, mut events: broadcast::Receiver<StatusChange>) {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(change) => self.invalidate_address(&change.address),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("replica set cache missed {} status changes", skipped);
                        if let Ok(mut sets) = self.sets.write() {
                            sets.clear();
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}
