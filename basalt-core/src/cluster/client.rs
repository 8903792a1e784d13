use super::rpc::*;
use super::types::{BlockServerStatus, ServiceRole};
use crate::address::{BlockId, DataAddress, Uid};
use crate::error::{BasaltError, Result};
use crate::replication::{LogEntry, LogPayload};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP/JSON transport for every internal RPC.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| BasaltError::Http(error.to_string()))?;
        Ok(Self { client })
    }

    async fn post<B, T>(&self, address: &str, uri: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("http://{}{}", address, uri);
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|error| BasaltError::connection(address, error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|error| BasaltError::Http(error.to_string()));
        }

        let text = response
            .text()
            .await
            .map_err(|error| BasaltError::connection(address, error.to_string()))?;
        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(error) => Err(BasaltError::remote(error.kind, error.error)),
            Err(_) => Err(BasaltError::Http(format!(
                "request failed: address={} uri={} status={} body={}",
                address, uri, status, text
            ))),
        }
    }

    async fn post_ack<B: Serialize + ?Sized>(&self, address: &str, uri: &str, body: &B) -> Result<()> {
        let _: Ack = self.post(address, uri, body).await?;
        Ok(())
    }

    pub async fn register_block_server(
        &self,
        address: &str,
        block_server: &str,
        server_guid: u64,
    ) -> Result<()> {
        let request = RegisterBlockServerRequest {
            address: block_server.to_string(),
            server_guid,
        };
        self.post_ack(address, URI_REGISTER_BLOCK_SERVER, &request).await
    }

    pub async fn deregister_block_server(&self, address: &str, block_server: &str) -> Result<()> {
        let request = DeregisterBlockServerRequest {
            address: block_server.to_string(),
        };
        self.post_ack(address, URI_DEREGISTER_BLOCK_SERVER, &request).await
    }

    pub async fn get_server_list(&self, address: &str) -> Result<Vec<BlockServerStatus>> {
        let response: ServerListResponse = self
            .post(address, URI_SERVER_LIST, &serde_json::json!({}))
            .await?;
        Ok(response.servers)
    }

    pub async fn add_block_server_mapping(
        &self,
        address: &str,
        block_id: BlockId,
        server_guids: Vec<u64>,
    ) -> Result<()> {
        let request = BlockServerMappingRequest {
            block_id,
            server_guids,
        };
        self.post_ack(address, URI_ADD_BLOCK_SERVER_MAPPING, &request).await
    }

    pub async fn remove_block_server_mapping(
        &self,
        address: &str,
        block_id: BlockId,
        server_guids: Vec<u64>,
    ) -> Result<()> {
        let request = BlockServerMappingRequest {
            block_id,
            server_guids,
        };
        self.post_ack(address, URI_REMOVE_BLOCK_SERVER_MAPPING, &request)
            .await
    }
}

#[async_trait]
impl AllocationRpc for ClusterClient {
    async fn allocate_node(&self, address: &str, size: u32) -> Result<DataAddress> {
        let response: AllocateNodeResponse = self
            .post(address, URI_ALLOCATE_NODE, &AllocateNodeRequest { size })
            .await?;
        Ok(response.address)
    }

    async fn get_server_list_for_block(
        &self,
        address: &str,
        block_id: BlockId,
    ) -> Result<Vec<BlockServerStatus>> {
        let response: ServerListResponse = self
            .post(address, URI_SERVER_LIST_FOR_BLOCK, &BlockIdRequest { block_id })
            .await?;
        Ok(response.servers)
    }

    async fn notify_block_server_failure(&self, address: &str, block_server: &str) -> Result<()> {
        let request = NotifyBlockServerFailureRequest {
            address: block_server.to_string(),
        };
        self.post_ack(address, URI_NOTIFY_BLOCK_SERVER_FAILURE, &request)
            .await
    }

    async fn notify_block_id_corruption(
        &self,
        address: &str,
        block_server: &str,
        block_id: BlockId,
        kind: &str,
    ) -> Result<()> {
        let request = NotifyBlockCorruptionRequest {
            address: block_server.to_string(),
            block_id,
            kind: kind.to_string(),
        };
        self.post_ack(address, URI_NOTIFY_BLOCK_CORRUPTION, &request).await
    }
}

#[async_trait]
impl HeartbeatRpc for ClusterClient {
    async fn poll(&self, address: &str, role: ServiceRole) -> Result<()> {
        let url = format!("http://{}{}", address, URI_POLL);
        let response = self
            .client
            .get(url)
            .query(&[("tag", role.as_str())])
            .send()
            .await
            .map_err(|error| BasaltError::connection(address, error.to_string()))?;

        if !response.status().is_success() {
            return Err(BasaltError::connection(
                address,
                format!("poll returned status {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ManagerRpc for ClusterClient {
    async fn propose(&self, address: &str, entry: &LogEntry) -> Result<()> {
        match entry.payload() {
            LogPayload::KeyValue { key, value } => {
                let message = KeyValueMessage {
                    uid: entry.uid(),
                    key: key.clone(),
                    value: value.clone(),
                };
                self.post_ack(address, URI_KV_PROPOSAL, &message).await
            }
            LogPayload::BlockServers {
                block_id,
                server_guids,
            } => {
                let message = BlockServersMessage {
                    uid: entry.uid(),
                    block_id: *block_id,
                    server_guids: server_guids.clone(),
                };
                self.post_ack(address, URI_BS_PROPOSAL, &message).await
            }
        }
    }

    async fn complete(&self, address: &str, entry: &LogEntry) -> Result<()> {
        match entry.payload() {
            LogPayload::KeyValue { key, value } => {
                let message = KeyValueMessage {
                    uid: entry.uid(),
                    key: key.clone(),
                    value: value.clone(),
                };
                self.post_ack(address, URI_KV_COMPLETE, &message).await
            }
            LogPayload::BlockServers {
                block_id,
                server_guids,
            } => {
                let message = BlockServersMessage {
                    uid: entry.uid(),
                    block_id: *block_id,
                    server_guids: server_guids.clone(),
                };
                self.post_ack(address, URI_BS_COMPLETE, &message).await
            }
        }
    }

    async fn fetch_log_bundle(
        &self,
        address: &str,
        from_uid: Uid,
        initial: bool,
    ) -> Result<Vec<LogEntry>> {
        let request = FetchLogBundleRequest { from_uid, initial };
        let response: FetchLogBundleResponse =
            self.post(address, URI_FETCH_LOG_BUNDLE, &request).await?;
        Ok(response.entries)
    }
}

#[async_trait]
impl BlockServerRpc for ClusterClient {
    async fn write_to_block(
        &self,
        address: &str,
        block_id: BlockId,
        nodes: Vec<StoredNode>,
    ) -> Result<()> {
        let request = WriteToBlockRequest { block_id, nodes };
        self.post_ack(address, URI_WRITE_TO_BLOCK, &request).await
    }

    async fn read_from_block(
        &self,
        address: &str,
        block_id: BlockId,
        addresses: Vec<DataAddress>,
    ) -> Result<Vec<StoredNode>> {
        let request = ReadFromBlockRequest {
            block_id,
            addresses,
        };
        let response: ReadFromBlockResponse =
            self.post(address, URI_READ_FROM_BLOCK, &request).await?;
        Ok(response.nodes)
    }

    async fn rollback_nodes(&self, address: &str, addresses: Vec<DataAddress>) -> Result<()> {
        let request = RollbackNodesRequest { addresses };
        self.post_ack(address, URI_ROLLBACK_NODES, &request).await
    }

    async fn block_checksum(&self, address: &str, block_id: BlockId) -> Result<u64> {
        let response: BlockChecksumResponse = self
            .post(address, URI_BLOCK_CHECKSUM, &BlockIdRequest { block_id })
            .await?;
        Ok(response.checksum)
    }

    async fn notify_current_block_id(&self, address: &str, block_id: BlockId) -> Result<()> {
        self.post_ack(address, URI_NOTIFY_CURRENT_BLOCK, &BlockIdRequest { block_id })
            .await
    }

    async fn send_block_to(
        &self,
        address: &str,
        block_id: BlockId,
        destination: &str,
    ) -> Result<u64> {
        let request = SendBlockToRequest {
            block_id,
            destination: destination.to_string(),
        };
        let response: BlockChecksumResponse =
            self.post(address, URI_SEND_BLOCK_TO, &request).await?;
        Ok(response.checksum)
    }

    async fn send_block_part(
        &self,
        address: &str,
        block_id: BlockId,
        nodes: Vec<StoredNode>,
    ) -> Result<()> {
        let request = SendBlockPartRequest { block_id, nodes };
        self.post_ack(address, URI_SEND_BLOCK_PART, &request).await
    }

    async fn send_block_complete(&self, address: &str, block_id: BlockId) -> Result<u64> {
        let response: BlockChecksumResponse = self
            .post(address, URI_SEND_BLOCK_COMPLETE, &BlockIdRequest { block_id })
            .await?;
        Ok(response.checksum)
    }
}

/// Allocation service reached over the network, trying managers in order.
/// Only connection faults move on to the next manager.
#[derive(Clone)]
pub struct RemoteAllocationService {
    rpc: Arc<dyn AllocationRpc>,
    managers: Vec<String>,
}

impl RemoteAllocationService {
    pub fn new(rpc: Arc<dyn AllocationRpc>, managers: Vec<String>) -> Self {
        Self { rpc, managers }
    }

    pub fn managers(&self) -> &[String] {
        &self.managers
    }
}

macro_rules! with_any_manager {
    ($self:ident, |$manager:ident| $call:expr) => {{
        let mut last_error = BasaltError::NotConnected("no managers configured".to_string());
        for $manager in $self.managers.iter() {
            match $call.await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_connection_fault() => {
                    tracing::warn!("manager unreachable address={}: {}", $manager, error);
                    last_error = error;
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error)
    }};
}

#[async_trait]
impl AllocationService for RemoteAllocationService {
    async fn allocate_node(&self, size: u32) -> Result<DataAddress> {
        with_any_manager!(self, |manager| self.rpc.allocate_node(manager, size))
    }

    async fn get_server_list_for_block(&self, block_id: BlockId) -> Result<Vec<BlockServerStatus>> {
        with_any_manager!(self, |manager| self
            .rpc
            .get_server_list_for_block(manager, block_id))
    }

    async fn notify_block_server_failure(&self, address: &str) -> Result<()> {
        with_any_manager!(self, |manager| self
            .rpc
            .notify_block_server_failure(manager, address))
    }

    async fn notify_block_id_corruption(
        &self,
        address: &str,
        block_id: BlockId,
        kind: &str,
    ) -> Result<()> {
        with_any_manager!(self, |manager| self
            .rpc
            .notify_block_id_corruption(manager, address, block_id, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Mutex;

    /// Managers with scripted faults.
    #[derive(Default)]
    struct ScriptedManagers {
        unreachable: Vec<String>,
        rejecting: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedManagers {
        fn answer(&self, address: &str) -> Result<()> {
            self.calls.lock().unwrap().push(address.to_string());
            if self.unreachable.iter().any(|manager| manager == address) {
                return Err(BasaltError::connection(address, "connection refused"));
            }
            if self.rejecting.iter().any(|manager| manager == address) {
                return Err(BasaltError::remote(ErrorKind::Protocol, "unknown block server"));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AllocationRpc for ScriptedManagers {
        async fn allocate_node(&self, address: &str, _size: u32) -> Result<DataAddress> {
            self.answer(address)?;
            DataAddress::new(BlockId::new(0, 3), 7)
        }

        async fn get_server_list_for_block(
            &self,
            address: &str,
            _block_id: BlockId,
        ) -> Result<Vec<BlockServerStatus>> {
            self.answer(address)?;
            Ok(Vec::new())
        }

        async fn notify_block_server_failure(&self, address: &str, _: &str) -> Result<()> {
            self.answer(address)
        }

        async fn notify_block_id_corruption(
            &self,
            address: &str,
            _: &str,
            _: BlockId,
            _: &str,
        ) -> Result<()> {
            self.answer(address)
        }
    }

    fn managers() -> Vec<String> {
        vec![
            "m0:7000".to_string(),
            "m1:7000".to_string(),
            "m2:7000".to_string(),
        ]
    }

    #[tokio::test]
    async fn unreachable_manager_is_skipped() {
        let rpc = Arc::new(ScriptedManagers {
            unreachable: vec!["m0:7000".to_string()],
            ..ScriptedManagers::default()
        });
        let service = RemoteAllocationService::new(rpc.clone(), managers());

        let address = service.allocate_node(64).await.unwrap();
        assert_eq!(address, DataAddress::new(BlockId::new(0, 3), 7).unwrap());
        assert_eq!(rpc.calls(), vec!["m0:7000", "m1:7000"]);
    }

    #[tokio::test]
    async fn rejection_is_returned_without_trying_other_managers() {
        let rpc = Arc::new(ScriptedManagers {
            rejecting: vec!["m0:7000".to_string()],
            ..ScriptedManagers::default()
        });
        let service = RemoteAllocationService::new(rpc.clone(), managers());

        let result = service.notify_block_server_failure("b1:7100").await;
        assert!(matches!(
            result,
            Err(BasaltError::Remote {
                kind: ErrorKind::Protocol,
                ..
            })
        ));
        assert_eq!(rpc.calls(), vec!["m0:7000"]);
    }

    #[tokio::test]
    async fn last_connection_fault_surfaces_when_no_manager_answers() {
        let rpc = Arc::new(ScriptedManagers {
            unreachable: managers(),
            ..ScriptedManagers::default()
        });
        let service = RemoteAllocationService::new(rpc.clone(), managers());

        let result = service.get_server_list_for_block(BlockId::new(0, 3)).await;
        assert!(matches!(
            result,
            Err(BasaltError::Connection { ref address, .. }) if address == "m2:7000"
        ));
        assert_eq!(rpc.calls().len(), 3);

        let empty = RemoteAllocationService::new(rpc, Vec::new());
        let result = empty
            .notify_block_id_corruption("b1:7100", BlockId::new(0, 3), "checksum")
            .await;
        assert!(matches!(result, Err(BasaltError::NotConnected(_))));
    }
}
