//! In-process fakes shared by unit tests.

use crate::address::{BlockId, DataAddress, Uid};
use crate::allocation::{AllocatorConfig, BlockAllocator};
use crate::cluster::{
    BlockServerRpc, FailureDetector, FailureDetectorConfig, HeartbeatRpc, ManagerRpc, ServiceRole,
    StoredNode,
};
use crate::error::{BasaltError, ErrorKind, Result};
use crate::replication::{LogEntry, RETRY_QUEUE_LIMIT, ReplicatedValueStore, ValueStoreConfig};
use crate::storage::{LogStore, ManagerStateStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub struct AlwaysUp;

#[async_trait]
impl HeartbeatRpc for AlwaysUp {
    async fn poll(&self, _address: &str, _role: ServiceRole) -> Result<()> {
        Ok(())
    }
}

/// Manager transport for single-manager clusters; nothing is ever reachable.
pub struct NoPeers;

#[async_trait]
impl ManagerRpc for NoPeers {
    async fn propose(&self, address: &str, _entry: &LogEntry) -> Result<()> {
        Err(BasaltError::connection(address, "no peers"))
    }

    async fn complete(&self, address: &str, _entry: &LogEntry) -> Result<()> {
        Err(BasaltError::connection(address, "no peers"))
    }

    async fn fetch_log_bundle(
        &self,
        address: &str,
        _from_uid: Uid,
        _initial: bool,
    ) -> Result<Vec<LogEntry>> {
        Err(BasaltError::connection(address, "no peers"))
    }
}

/// Block servers kept in memory, with fault injection.
#[derive(Default)]
pub struct MemoryBlockServers {
    nodes: Mutex<HashMap<String, BTreeMap<DataAddress, Bytes>>>,
    failing_writes: Mutex<HashMap<String, usize>>,
    failing_block_writes: Mutex<HashMap<(String, BlockId), usize>>,
    down: Mutex<HashSet<String>>,
    notifications: Mutex<Vec<(String, BlockId)>>,
    reads: Mutex<Vec<String>>,
}

impl MemoryBlockServers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` writes to `address` fail with an application error.
    pub fn fail_writes(&self, address: &str, count: usize) {
        self.failing_writes
            .lock()
            .unwrap()
            .insert(address.to_string(), count);
    }

    /// Like `fail_writes`, limited to writes into `block_id`.
    pub fn fail_block_writes(&self, address: &str, block_id: BlockId, count: usize) {
        self.failing_block_writes
            .lock()
            .unwrap()
            .insert((address.to_string(), block_id), count);
    }

    pub fn set_down(&self, address: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    pub fn corrupt(&self, address: &str, node: DataAddress) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(bytes) = nodes.get_mut(address).and_then(|stored| stored.get_mut(&node)) {
            let mut damaged = bytes.to_vec();
            let last = damaged.len() - 1;
            damaged[last] ^= 0xff;
            *bytes = Bytes::from(damaged);
        }
    }

    pub fn stored(&self, address: &str, node: DataAddress) -> Option<Bytes> {
        self.nodes
            .lock()
            .unwrap()
            .get(address)
            .and_then(|stored| stored.get(&node).cloned())
    }

    pub fn node_count(&self, address: &str) -> usize {
        self.nodes
            .lock()
            .unwrap()
            .get(address)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn notifications(&self) -> Vec<(String, BlockId)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    fn check_up(&self, address: &str) -> Result<()> {
        if self.down.lock().unwrap().contains(address) {
            return Err(BasaltError::connection(address, "connection refused"));
        }
        Ok(())
    }

    fn checksum_of(&self, address: &str, block_id: BlockId) -> u64 {
        let nodes = self.nodes.lock().unwrap();
        let mut crc = 0u32;
        if let Some(stored) = nodes.get(address) {
            for (node, bytes) in stored.iter().filter(|(node, _)| node.block_id() == block_id) {
                crc = crc32c::crc32c_append(crc, &node.data_id().to_be_bytes());
                crc = crc32c::crc32c_append(crc, bytes);
            }
        }
        crc as u64
    }
}

#[async_trait]
impl BlockServerRpc for MemoryBlockServers {
    async fn write_to_block(
        &self,
        address: &str,
        block_id: BlockId,
        nodes: Vec<StoredNode>,
    ) -> Result<()> {
        self.check_up(address)?;
        {
            let mut failing = self.failing_writes.lock().unwrap();
            if let Some(remaining) = failing.get_mut(address) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BasaltError::remote(ErrorKind::Internal, "disk full"));
                }
            }
        }
        {
            let mut failing = self.failing_block_writes.lock().unwrap();
            if let Some(remaining) = failing.get_mut(&(address.to_string(), block_id)) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BasaltError::remote(ErrorKind::Internal, "disk full"));
                }
            }
        }

        let mut stored = self.nodes.lock().unwrap();
        let target = stored.entry(address.to_string()).or_default();
        for node in nodes {
            target.insert(node.address, node.bytes);
        }
        Ok(())
    }

    async fn read_from_block(
        &self,
        address: &str,
        _block_id: BlockId,
        addresses: Vec<DataAddress>,
    ) -> Result<Vec<StoredNode>> {
        self.check_up(address)?;
        self.reads.lock().unwrap().push(address.to_string());

        let stored = self.nodes.lock().unwrap();
        let mut found = Vec::with_capacity(addresses.len());
        for node in addresses {
            let bytes = stored
                .get(address)
                .and_then(|nodes| nodes.get(&node).cloned())
                .ok_or(BasaltError::NodeNotFound(node))?;
            found.push(StoredNode {
                address: node,
                bytes,
            });
        }
        Ok(found)
    }

    async fn rollback_nodes(&self, address: &str, addresses: Vec<DataAddress>) -> Result<()> {
        self.check_up(address)?;
        if let Some(stored) = self.nodes.lock().unwrap().get_mut(address) {
            for node in addresses {
                stored.remove(&node);
            }
        }
        Ok(())
    }

    async fn block_checksum(&self, address: &str, block_id: BlockId) -> Result<u64> {
        self.check_up(address)?;
        Ok(self.checksum_of(address, block_id))
    }

    async fn notify_current_block_id(&self, address: &str, block_id: BlockId) -> Result<()> {
        self.check_up(address)?;
        self.notifications
            .lock()
            .unwrap()
            .push((address.to_string(), block_id));
        Ok(())
    }

    async fn send_block_to(
        &self,
        address: &str,
        block_id: BlockId,
        destination: &str,
    ) -> Result<u64> {
        self.check_up(address)?;
        self.check_up(destination)?;
        let mut stored = self.nodes.lock().unwrap();
        let copied: Vec<(DataAddress, Bytes)> = stored
            .get(address)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|(node, _)| node.block_id() == block_id)
                    .map(|(node, bytes)| (*node, bytes.clone()))
                    .collect()
            })
            .unwrap_or_default();
        stored
            .entry(destination.to_string())
            .or_default()
            .extend(copied);
        drop(stored);
        Ok(self.checksum_of(destination, block_id))
    }

    async fn send_block_part(
        &self,
        address: &str,
        block_id: BlockId,
        nodes: Vec<StoredNode>,
    ) -> Result<()> {
        self.write_to_block(address, block_id, nodes).await
    }

    async fn send_block_complete(&self, address: &str, block_id: BlockId) -> Result<u64> {
        self.check_up(address)?;
        Ok(self.checksum_of(address, block_id))
    }
}

/// A connected single-manager allocation stack.
pub struct ManagerFixture {
    pub allocator: Arc<BlockAllocator>,
    pub value_store: Arc<ReplicatedValueStore>,
    pub detector: Arc<FailureDetector>,
    pub block_servers: Arc<MemoryBlockServers>,
    _dir: TempDir,
}

impl ManagerFixture {
    pub async fn new(unique_id: u8, block_servers: MemoryBlockServers) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let detector = Arc::new(FailureDetector::new(
            FailureDetectorConfig::default(),
            Arc::new(AlwaysUp),
        ));
        let log = Arc::new(LogStore::open(dir.path().join("log.db")).unwrap());
        let value_store = Arc::new(ReplicatedValueStore::new(
            ValueStoreConfig {
                local_address: "m0:7000".to_string(),
                members: vec!["m0:7000".to_string()],
                retry_queue_limit: RETRY_QUEUE_LIMIT,
            },
            log,
            Arc::new(NoPeers),
            detector.clone(),
        ));
        assert!(value_store.init().await.unwrap());

        let state = Arc::new(ManagerStateStore::open(dir.path().join("manager.db")).unwrap());
        let block_servers = Arc::new(block_servers);
        let allocator = Arc::new(BlockAllocator::new(
            AllocatorConfig {
                unique_id,
                ..AllocatorConfig::default()
            },
            value_store.clone(),
            detector.clone(),
            state,
            block_servers.clone(),
        ));

        Self {
            allocator,
            value_store,
            detector,
            block_servers,
            _dir: dir,
        }
    }
}
