use crate::address::{BLOCK_STRIDE, BlockId, DataAddress};
use crate::cluster::{
    AllocationService, BlockServerRpc, BlockServerStatus, BlockServiceInfo, FailureDetector,
    ServiceRole,
};
use crate::error::{BasaltError, Result};
use crate::replication::ReplicatedValueStore;
use crate::storage::ManagerStateStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;

/// Replicas assigned to a new block when enough servers are up.
pub const REPLICA_SET_SIZE: usize = 3;

const OPEN_BLOCK_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Small per-manager id; blocks opened here satisfy `low % 256 == unique_id`.
    pub unique_id: u8,
    pub check_interval: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            unique_id: 0,
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Issues unique data addresses and keeps the current block on healthy replicas.
pub struct BlockAllocator {
    config: AllocatorConfig,
    value_store: Arc<ReplicatedValueStore>,
    detector: Arc<FailureDetector>,
    state: Arc<ManagerStateStore>,
    block_rpc: Arc<dyn BlockServerRpc>,
    cursor: Mutex<Option<DataAddress>>,
    corruption_reports: Mutex<HashMap<BlockId, u64>>,
}

impl BlockAllocator {
    pub fn new(
        config: AllocatorConfig,
        value_store: Arc<ReplicatedValueStore>,
        detector: Arc<FailureDetector>,
        state: Arc<ManagerStateStore>,
        block_rpc: Arc<dyn BlockServerRpc>,
    ) -> Self {
        Self {
            config,
            value_store,
            detector,
            state,
            block_rpc,
            cursor: Mutex::new(None),
            corruption_reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn unique_id(&self) -> u8 {
        self.config.unique_id
    }

    /// Next address this manager would hand out, if a block is open.
    pub async fn current_address(&self) -> Option<DataAddress> {
        *self.cursor.lock().await
    }

    /// Returns the cursor, then advances it. Crossing a block boundary
    /// assigns the new block its replica set before the cursor moves.
    pub async fn allocate_node(&self, size: u32) -> Result<DataAddress> {
        let mut cursor = self.cursor.lock().await;
        let current = match *cursor {
            Some(current) => current,
            None => self.open_initial_block().await?,
        };

        let (next, crossed) = current.next(BLOCK_STRIDE);
        if crossed {
            self.allocate_new_block(next.block_id(), Some(current.block_id()))
                .await?;
        }
        *cursor = Some(next);

        tracing::debug!("allocated node address={} size={}", current, size);
        Ok(current)
    }

    async fn open_initial_block(&self) -> Result<DataAddress> {
        let unique_id = self.config.unique_id as u64;
        let mut candidate = match self.value_store.last_block_id().await? {
            Some(last) => {
                let base = last.add(1);
                let offset = (unique_id + BLOCK_STRIDE - base.low % BLOCK_STRIDE) % BLOCK_STRIDE;
                base.add(offset)
            }
            None => BlockId::new(0, unique_id),
        };

        for _ in 0..OPEN_BLOCK_ATTEMPTS {
            match self.allocate_new_block(candidate, None).await {
                Ok(()) => {
                    tracing::info!("opened first block block_id={}", candidate);
                    return Ok(DataAddress::first_in(candidate));
                }
                Err(BasaltError::BlockAlreadyAllocated(_)) => {
                    candidate = candidate.add(BLOCK_STRIDE);
                }
                Err(error) => return Err(error),
            }
        }

        Err(BasaltError::Internal(format!(
            "could not open a block after {} attempts",
            OPEN_BLOCK_ATTEMPTS
        )))
    }

    /// Assigns a replica set to a block that has none.
    pub async fn allocate_new_block(
        &self,
        block_id: BlockId,
        previous: Option<BlockId>,
    ) -> Result<()> {
        if self
            .value_store
            .get_block_id_server_map(block_id)
            .await?
            .is_some()
        {
            return Err(BasaltError::BlockAlreadyAllocated(block_id));
        }

        let candidates = self.up_block_servers().await?;
        if candidates.is_empty() {
            return Err(BasaltError::NoBlockServersAvailable);
        }

        let replicas = choose_replicas(candidates);
        let server_guids: Vec<u64> = replicas.iter().map(|server| server.server_guid).collect();
        self.value_store
            .set_block_id_server_map(block_id, server_guids.clone())
            .await?;

        tracing::info!(
            "allocated block block_id={} servers={:?}",
            block_id,
            server_guids
        );

        if let Some(previous) = previous {
            self.notify_previous_holders(previous, block_id).await;
        }
        Ok(())
    }

    async fn notify_previous_holders(&self, previous: BlockId, current: BlockId) {
        let holders = match self.get_server_list_for_block(previous).await {
            Ok(holders) => holders,
            Err(error) => {
                tracing::warn!("cannot resolve holders of block {}: {}", previous, error);
                return;
            }
        };

        let rpc = self.block_rpc.clone();
        tokio::spawn(async move {
            for holder in holders {
                if let Err(error) = rpc.notify_current_block_id(&holder.address, current).await {
                    tracing::warn!(
                        "notify current block failed address={} block_id={}: {}",
                        holder.address,
                        current,
                        error
                    );
                }
            }
        });
    }

    /// Moves the cursor past the current block when one of its replicas is
    /// not up. Returns whether the cursor moved.
    pub async fn check_and_fix_allocation_servers(&self) -> Result<bool> {
        let mut cursor = self.cursor.lock().await;
        let Some(current) = *cursor else {
            return Ok(false);
        };

        let block_id = current.block_id();
        let replicas = self.get_server_list_for_block(block_id).await?;
        let assigned = self
            .value_store
            .get_block_id_server_map(block_id)
            .await?
            .map(|guids| guids.len())
            .unwrap_or(0);
        let healthy = replicas
            .iter()
            .filter(|replica| replica.status.is_up())
            .count();

        if assigned > 0 && healthy == assigned {
            return Ok(false);
        }

        let next_block = block_id.add(BLOCK_STRIDE);
        self.allocate_new_block(next_block, Some(block_id)).await?;
        *cursor = Some(DataAddress::first_in(next_block));

        tracing::warn!(
            "moved allocation off degraded block block_id={} healthy={}/{} next={}",
            block_id,
            healthy,
            assigned,
            next_block
        );
        Ok(true)
    }

    async fn up_block_servers(&self) -> Result<Vec<BlockServiceInfo>> {
        let mut up = Vec::new();
        for server in self.state.block_servers()? {
            if self.detector.is_up(&server.address, ServiceRole::Block).await {
                up.push(server);
            }
        }
        Ok(up)
    }

    pub async fn register_block_server(&self, address: &str, server_guid: u64) -> Result<()> {
        self.state.register_block_server(&BlockServiceInfo {
            server_guid,
            address: address.to_string(),
        })?;
        self.detector.report_started(address, ServiceRole::Block).await;
        self.detector.track(address, ServiceRole::Block).await;
        tracing::info!("registered block server address={} guid={}", address, server_guid);
        Ok(())
    }

    pub async fn deregister_block_server(&self, address: &str) -> Result<()> {
        if !self.state.deregister_block_server(address)? {
            return Ok(());
        }
        self.detector.report_shutdown(address, ServiceRole::Block).await;
        tracing::info!("deregistered block server address={}", address);
        self.check_and_fix_allocation_servers().await?;
        Ok(())
    }

    pub async fn get_server_list(&self) -> Result<Vec<BlockServerStatus>> {
        let mut servers = Vec::new();
        for server in self.state.block_servers()? {
            let status = self.detector.status(&server.address, ServiceRole::Block).await;
            servers.push(BlockServerStatus {
                server_guid: server.server_guid,
                address: server.address,
                status,
            });
        }
        Ok(servers)
    }

    /// Replicas of a block with their status. Guids no longer registered
    /// are left out.
    pub async fn get_server_list_for_block(
        &self,
        block_id: BlockId,
    ) -> Result<Vec<BlockServerStatus>> {
        let Some(guids) = self.value_store.get_block_id_server_map(block_id).await? else {
            return Ok(Vec::new());
        };

        let registered = self.get_server_list().await?;
        Ok(guids
            .iter()
            .filter_map(|guid| {
                registered
                    .iter()
                    .find(|server| server.server_guid == *guid)
                    .cloned()
            })
            .collect())
    }

    pub async fn notify_block_server_failure(&self, address: &str) -> Result<()> {
        self.detector
            .report_failure(address, ServiceRole::Block)
            .await;
        self.check_and_fix_allocation_servers().await?;
        Ok(())
    }

    pub async fn notify_block_id_corruption(
        &self,
        address: &str,
        block_id: BlockId,
        kind: &str,
    ) -> Result<()> {
        let mut reports = self.corruption_reports.lock().await;
        let count = reports.entry(block_id).or_insert(0);
        *count += 1;
        tracing::warn!(
            "block corruption reported address={} block_id={} kind={} reports={}",
            address,
            block_id,
            kind,
            count
        );
        Ok(())
    }

    pub async fn corruption_reports(&self, block_id: BlockId) -> u64 {
        self.corruption_reports
            .lock()
            .await
            .get(&block_id)
            .copied()
            .unwrap_or(0)
    }

    /// Adds servers to a block's replica set, ignoring ones already present.
    pub async fn internal_add_block_server_mapping(
        &self,
        block_id: BlockId,
        server_guids: &[u64],
    ) -> Result<()> {
        let mut current = self
            .value_store
            .get_block_id_server_map(block_id)
            .await?
            .unwrap_or_default();
        for guid in server_guids {
            if !current.contains(guid) {
                current.push(*guid);
            }
        }
        self.value_store
            .set_block_id_server_map(block_id, current)
            .await
    }

    pub async fn internal_remove_block_server_mapping(
        &self,
        block_id: BlockId,
        server_guids: &[u64],
    ) -> Result<()> {
        let Some(mut current) = self.value_store.get_block_id_server_map(block_id).await? else {
            return Ok(());
        };
        current.retain(|guid| !server_guids.contains(guid));
        self.value_store
            .set_block_id_server_map(block_id, current)
            .await
    }

    /// Self-healing on every block server going down and on a timer.
    pub fn start(self: Arc<Self>) {
        let mut events = self.detector.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    event = events.recv() => match event {
                        Ok(change) if change.role == ServiceRole::Block && !change.new.is_up() => {}
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("allocator missed {} status changes", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }

                if let Err(error) = self.check_and_fix_allocation_servers().await {
                    tracing::warn!("allocation server check failed: {}", error);
                }
            }
        });
    }
}

/// All servers when there are at most `REPLICA_SET_SIZE`, otherwise a
/// uniform sample without replacement.
fn choose_replicas(mut servers: Vec<BlockServiceInfo>) -> Vec<BlockServiceInfo> {
    if servers.len() <= REPLICA_SET_SIZE {
        return servers;
    }

    let mut rng = rand::thread_rng();
    let mut picked: Vec<usize> = rand::seq::index::sample(&mut rng, servers.len(), REPLICA_SET_SIZE)
        .into_iter()
        .collect();
    picked.sort_unstable();

    let mut chosen = Vec::with_capacity(REPLICA_SET_SIZE);
    for index in picked.into_iter().rev() {
        chosen.push(servers.swap_remove(index));
    }
    chosen.reverse();
    chosen
}

#[async_trait]
impl AllocationService for BlockAllocator {
    async fn allocate_node(&self, size: u32) -> Result<DataAddress> {
        BlockAllocator::allocate_node(self, size).await
    }

    async fn get_server_list_for_block(&self, block_id: BlockId) -> Result<Vec<BlockServerStatus>> {
        BlockAllocator::get_server_list_for_block(self, block_id).await
    }

    async fn notify_block_server_failure(&self, address: &str) -> Result<()> {
        BlockAllocator::notify_block_server_failure(self, address).await
    }

    async fn notify_block_id_corruption(
        &self,
        address: &str,
        block_id: BlockId,
        kind: &str,
    ) -> Result<()> {
        BlockAllocator::notify_block_id_corruption(self, address, block_id, kind).await
    }
}
