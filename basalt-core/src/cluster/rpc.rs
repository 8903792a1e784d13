//! Network seams of the cluster and the messages that cross them.

use super::types::{BlockServerStatus, ServiceRole};
use crate::address::{BlockId, DataAddress, Uid};
use crate::error::{ErrorKind, Result};
use crate::replication::{LogEntry, LogPayload};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const URI_POLL: &str = "/internal/v1/poll";

pub const URI_ALLOCATE_NODE: &str = "/internal/v1/manager/allocate-node";
pub const URI_REGISTER_BLOCK_SERVER: &str = "/internal/v1/manager/register-block-server";
pub const URI_DEREGISTER_BLOCK_SERVER: &str = "/internal/v1/manager/deregister-block-server";
pub const URI_KV_PROPOSAL: &str = "/internal/v1/manager/kv-proposal";
pub const URI_KV_COMPLETE: &str = "/internal/v1/manager/kv-complete";
pub const URI_BS_PROPOSAL: &str = "/internal/v1/manager/bs-proposal";
pub const URI_BS_COMPLETE: &str = "/internal/v1/manager/bs-complete";
pub const URI_FETCH_LOG_BUNDLE: &str = "/internal/v1/manager/log-bundle";
pub const URI_ADD_BLOCK_SERVER_MAPPING: &str = "/internal/v1/manager/add-block-server-mapping";
pub const URI_REMOVE_BLOCK_SERVER_MAPPING: &str =
    "/internal/v1/manager/remove-block-server-mapping";
pub const URI_SERVER_LIST: &str = "/internal/v1/manager/server-list";
pub const URI_SERVER_LIST_FOR_BLOCK: &str = "/internal/v1/manager/server-list-for-block";
pub const URI_NOTIFY_BLOCK_SERVER_FAILURE: &str = "/internal/v1/manager/notify-block-server-failure";
pub const URI_NOTIFY_BLOCK_CORRUPTION: &str = "/internal/v1/manager/notify-block-corruption";

pub const URI_WRITE_TO_BLOCK: &str = "/internal/v1/block/write";
pub const URI_READ_FROM_BLOCK: &str = "/internal/v1/block/read";
pub const URI_ROLLBACK_NODES: &str = "/internal/v1/block/rollback";
pub const URI_BLOCK_CHECKSUM: &str = "/internal/v1/block/checksum";
pub const URI_NOTIFY_CURRENT_BLOCK: &str = "/internal/v1/block/notify-current-block";
pub const URI_SEND_BLOCK_TO: &str = "/internal/v1/block/send-to";
pub const URI_SEND_BLOCK_PART: &str = "/internal/v1/block/send-part";
pub const URI_SEND_BLOCK_COMPLETE: &str = "/internal/v1/block/send-complete";

/// Liveness probe used by the failure detector.
#[async_trait]
pub trait HeartbeatRpc: Send + Sync {
    async fn poll(&self, address: &str, role: ServiceRole) -> Result<()>;
}

/// Manager-to-manager replication protocol.
#[async_trait]
pub trait ManagerRpc: Send + Sync {
    async fn propose(&self, address: &str, entry: &LogEntry) -> Result<()>;

    async fn complete(&self, address: &str, entry: &LogEntry) -> Result<()>;

    async fn fetch_log_bundle(
        &self,
        address: &str,
        from_uid: Uid,
        initial: bool,
    ) -> Result<Vec<LogEntry>>;
}

/// Calls served by block servers.
#[async_trait]
pub trait BlockServerRpc: Send + Sync {
    async fn write_to_block(
        &self,
        address: &str,
        block_id: BlockId,
        nodes: Vec<StoredNode>,
    ) -> Result<()>;

    async fn read_from_block(
        &self,
        address: &str,
        block_id: BlockId,
        addresses: Vec<DataAddress>,
    ) -> Result<Vec<StoredNode>>;

    async fn rollback_nodes(&self, address: &str, addresses: Vec<DataAddress>) -> Result<()>;

    async fn block_checksum(&self, address: &str, block_id: BlockId) -> Result<u64>;

    async fn notify_current_block_id(&self, address: &str, block_id: BlockId) -> Result<()>;

    async fn send_block_to(&self, address: &str, block_id: BlockId, destination: &str)
    -> Result<u64>;

    async fn send_block_part(
        &self,
        address: &str,
        block_id: BlockId,
        nodes: Vec<StoredNode>,
    ) -> Result<()>;

    async fn send_block_complete(&self, address: &str, block_id: BlockId) -> Result<u64>;
}

/// The allocation authority as seen by node storage clients.
#[async_trait]
pub trait AllocationService: Send + Sync {
    async fn allocate_node(&self, size: u32) -> Result<DataAddress>;

    async fn get_server_list_for_block(&self, block_id: BlockId) -> Result<Vec<BlockServerStatus>>;

    async fn notify_block_server_failure(&self, address: &str) -> Result<()>;

    async fn notify_block_id_corruption(
        &self,
        address: &str,
        block_id: BlockId,
        kind: &str,
    ) -> Result<()>;
}

/// Allocation calls addressed to one manager.
#[async_trait]
pub trait AllocationRpc: Send + Sync {
    async fn allocate_node(&self, address: &str, size: u32) -> Result<DataAddress>;

    async fn get_server_list_for_block(
        &self,
        address: &str,
        block_id: BlockId,
    ) -> Result<Vec<BlockServerStatus>>;

    async fn notify_block_server_failure(&self, address: &str, block_server: &str) -> Result<()>;

    async fn notify_block_id_corruption(
        &self,
        address: &str,
        block_server: &str,
        block_id: BlockId,
        kind: &str,
    ) -> Result<()>;
}

/// An encoded node at its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNode {
    pub address: DataAddress,
    #[serde(with = "base64_bytes")]
    pub bytes: Bytes,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateNodeRequest {
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateNodeResponse {
    pub address: DataAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBlockServerRequest {
    pub address: String,
    pub server_guid: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterBlockServerRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueMessage {
    pub uid: Uid,
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockServersMessage {
    pub uid: Uid,
    pub block_id: BlockId,
    pub server_guids: Vec<u64>,
}

impl From<KeyValueMessage> for LogEntry {
    fn from(message: KeyValueMessage) -> Self {
        LogEntry::new(
            message.uid,
            LogPayload::KeyValue {
                key: message.key,
                value: message.value,
            },
        )
    }
}

impl From<BlockServersMessage> for LogEntry {
    fn from(message: BlockServersMessage) -> Self {
        LogEntry::new(
            message.uid,
            LogPayload::BlockServers {
                block_id: message.block_id,
                server_guids: message.server_guids,
            },
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchLogBundleRequest {
    pub from_uid: Uid,
    pub initial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchLogBundleResponse {
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockServerMappingRequest {
    pub block_id: BlockId,
    pub server_guids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIdRequest {
    pub block_id: BlockId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerListResponse {
    pub servers: Vec<BlockServerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyBlockServerFailureRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyBlockCorruptionRequest {
    pub address: String,
    pub block_id: BlockId,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteToBlockRequest {
    pub block_id: BlockId,
    pub nodes: Vec<StoredNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFromBlockRequest {
    pub block_id: BlockId,
    pub addresses: Vec<DataAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFromBlockResponse {
    pub nodes: Vec<StoredNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackNodesRequest {
    pub addresses: Vec<DataAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockChecksumResponse {
    pub checksum: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendBlockToRequest {
    pub block_id: BlockId,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendBlockPartRequest {
    pub block_id: BlockId,
    pub nodes: Vec<StoredNode>,
}
