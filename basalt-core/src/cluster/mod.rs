pub mod client;
pub mod failure_detector;
pub mod rpc;
pub mod types;

pub use client::{ClusterClient, RemoteAllocationService};
pub use failure_detector::{FailureDetector, FailureDetectorConfig};
pub use rpc::{
    AllocationRpc, AllocationService, BlockServerRpc, ErrorResponse, HeartbeatRpc, ManagerRpc,
    StoredNode,
};
pub use types::{
    BlockServerStatus, BlockServiceInfo, ServiceRole, ServiceStatus, StatusChange, is_majority,
};
