//! Basalt Core - cluster coordination for replicated block storage
//!
//! - a quorum-replicated log of key/value and block-server mappings
//! - a heartbeat and client-report failure detector
//! - a block allocation authority that assigns replica sets
//! - node persistence and retrieval across block-server replicas

pub mod address;
pub mod allocation;
pub mod cluster;
pub mod error;
pub mod node_store;
pub mod operations;
pub mod path_info;
pub mod replication;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{BLOCK_STRIDE, BlockId, DATA_IDS_PER_BLOCK, DataAddress, NodeId, Uid};
pub use allocation::{AllocatorConfig, BlockAllocator, REPLICA_SET_SIZE};
pub use cluster::{
    AllocationRpc, AllocationService, BlockServerRpc, BlockServerStatus, BlockServiceInfo,
    ClusterClient,
    ErrorResponse, FailureDetector, FailureDetectorConfig, HeartbeatRpc, ManagerRpc,
    RemoteAllocationService, ServiceRole, ServiceStatus, StatusChange, StoredNode,
};
pub use error::{BasaltError, ErrorKind, Result};
pub use node_store::{NodeCache, ReplicaSetCache, TreeNode};
pub use path_info::{PathInfo, PathProcessor, PathTypeRegistry};
pub use replication::{
    LogEntry, LogPayload, RETRY_QUEUE_LIMIT, ReplicatedValueStore, ValueStoreConfig,
};
pub use storage::{BlockStore, LogStore, ManagerStateStore};
