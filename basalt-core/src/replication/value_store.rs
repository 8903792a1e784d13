//! Majority-replicated key/value and block-assignment facts.
//!
//! A write is proposed to every manager; once a strict majority (self
//! included) acknowledges, the same entry is completed everywhere and each
//! member applies it to its local log at most once. Members that missed
//! completes catch up by streaming entries from their peers.

use super::entry::{LogEntry, LogPayload};
use crate::address::{BlockId, Uid};
use crate::cluster::{FailureDetector, ManagerRpc, ServiceRole, is_majority};
use crate::error::{BasaltError, Result};
use crate::storage::LogStore;
use futures_util::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;

/// Entries returned per log bundle request.
pub const LOG_BUNDLE_SIZE: usize = 32;

/// Completes queued per unreachable member before the oldest are dropped.
pub const RETRY_QUEUE_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct ValueStoreConfig {
    pub local_address: String,
    /// Every manager of the cluster, including the local one.
    pub members: Vec<String>,
    pub retry_queue_limit: usize,
}

/// Completes owed to one member that could not be reached.
#[derive(Default)]
struct PendingCompletes {
    entries: VecDeque<LogEntry>,
    /// Lowest uid dropped on overflow. The local log is replayed from it
    /// on the next flush.
    replay_from: Option<Uid>,
}

impl PendingCompletes {
    fn push(&mut self, entry: LogEntry, limit: usize) {
        self.entries.push_back(entry);
        while self.entries.len() > limit.max(1) {
            if let Some(dropped) = self.entries.pop_front() {
                self.mark_replay(Some(dropped.uid()));
            }
        }
    }

    fn mark_replay(&mut self, from: Option<Uid>) {
        self.replay_from = match (self.replay_from, from) {
            (Some(current), Some(from)) => Some(current.min(from)),
            (current, from) => current.or(from),
        };
    }
}

pub struct ReplicatedValueStore {
    local_address: String,
    members: Vec<String>,
    log: Arc<LogStore>,
    rpc: Arc<dyn ManagerRpc>,
    detector: Arc<FailureDetector>,
    synced: AtomicBool,
    sync_lock: Mutex<()>,
    retry_queue_limit: usize,
    retry_queue: Mutex<HashMap<String, PendingCompletes>>,
}

impl ReplicatedValueStore {
    pub fn new(
        config: ValueStoreConfig,
        log: Arc<LogStore>,
        rpc: Arc<dyn ManagerRpc>,
        detector: Arc<FailureDetector>,
    ) -> Self {
        let ValueStoreConfig {
            local_address,
            mut members,
            retry_queue_limit,
        } = config;
        if !members.contains(&local_address) {
            members.push(local_address.clone());
        }
        members.sort();
        members.dedup();

        Self {
            local_address,
            members,
            log,
            rpc,
            detector,
            synced: AtomicBool::new(false),
            sync_lock: Mutex::new(()),
            retry_queue_limit,
            retry_queue: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    fn peers(&self) -> impl Iterator<Item = &String> {
        self.members
            .iter()
            .filter(move |member| **member != self.local_address)
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Connected means a past sync succeeded and a majority is reachable now.
    pub async fn check_connected(&self) -> Result<()> {
        if !self.is_synced() {
            return Err(BasaltError::NotConnected(
                "log store has not synchronized with a majority".to_string(),
            ));
        }

        let mut reachable = 1;
        for peer in self.peers() {
            if self.detector.is_up(peer, ServiceRole::Manager).await {
                reachable += 1;
            }
        }

        if !is_majority(reachable, self.members.len()) {
            return Err(BasaltError::NotConnected(format!(
                "only {} of {} managers reachable",
                reachable,
                self.members.len()
            )));
        }
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.check_connected().await?;
        self.log.get_value(key)
    }

    pub async fn get_block_id_server_map(&self, block_id: BlockId) -> Result<Option<Vec<u64>>> {
        self.check_connected().await?;
        self.log.get_block_servers(block_id)
    }

    pub async fn last_block_id(&self) -> Result<Option<BlockId>> {
        self.check_connected().await?;
        self.log.last_block_id()
    }

    /// Sets or deletes (`None`) a value. No-op if the local value is equal.
    pub async fn set_value(&self, key: &str, value: Option<String>) -> Result<()> {
        if self.log.get_value(key)? == value {
            return Ok(());
        }

        let entry = LogEntry::new(
            Uid::generate(),
            LogPayload::KeyValue {
                key: key.to_string(),
                value,
            },
        );
        self.replicate(entry).await
    }

    pub async fn set_block_id_server_map(
        &self,
        block_id: BlockId,
        server_guids: Vec<u64>,
    ) -> Result<()> {
        if self.log.get_block_servers(block_id)?.as_ref() == Some(&server_guids) {
            return Ok(());
        }

        let entry = LogEntry::new(
            Uid::generate(),
            LogPayload::BlockServers {
                block_id,
                server_guids,
            },
        );
        self.replicate(entry).await
    }

    async fn replicate(&self, entry: LogEntry) -> Result<()> {
        let proposals = self.members.iter().map(|member| {
            let entry = &entry;
            async move {
                let result = if *member == self.local_address {
                    self.handle_proposal(entry)
                } else {
                    self.rpc.propose(member, entry).await
                };
                (member, result)
            }
        });

        let mut acknowledged = 0;
        for (member, result) in join_all(proposals).await {
            match result {
                Ok(()) => acknowledged += 1,
                Err(error) => {
                    if error.is_connection_fault() {
                        self.detector
                            .report_failure(member, ServiceRole::Manager)
                            .await;
                    }
                    tracing::warn!("proposal rejected member={} uid={}: {}", member, entry.uid(), error);
                }
            }
        }

        if !is_majority(acknowledged, self.members.len()) {
            return Err(BasaltError::Quorum {
                acknowledged,
                members: self.members.len(),
            });
        }

        self.log.apply(std::slice::from_ref(&entry))?;

        let completes = self.peers().map(|peer| {
            let entry = &entry;
            async move { (peer, self.rpc.complete(peer, entry).await) }
        });
        for (peer, result) in join_all(completes).await {
            let Err(error) = result else {
                continue;
            };
            if error.is_connection_fault() {
                self.detector.report_failure(peer, ServiceRole::Manager).await;
                let mut queue = self.retry_queue.lock().await;
                let pending = queue.entry(peer.clone()).or_default();
                let replaying = pending.replay_from.is_some();
                pending.push(entry.clone(), self.retry_queue_limit);
                if !replaying && pending.replay_from.is_some() {
                    tracing::warn!(
                        "retry queue full member={}, falling back to log replay",
                        peer
                    );
                }
                tracing::warn!("complete queued for retry member={} uid={}", peer, entry.uid());
            } else {
                tracing::warn!("complete failed member={} uid={}: {}", peer, entry.uid(), error);
            }
        }

        tracing::debug!("replicated log entry uid={} acknowledged={}", entry.uid(), acknowledged);
        Ok(())
    }

    /// Acknowledges a proposal. Nothing is stored until the complete arrives.
    pub fn handle_proposal(&self, entry: &LogEntry) -> Result<()> {
        if let LogPayload::KeyValue { key, .. } = entry.payload() {
            if key.is_empty() {
                return Err(BasaltError::InvalidRequest("empty key".to_string()));
            }
        }
        tracing::debug!("accepted proposal uid={}", entry.uid());
        Ok(())
    }

    /// Applies a completed entry; returns false when it was applied before.
    pub fn handle_complete(&self, entry: &LogEntry) -> Result<bool> {
        if self.log.has_applied_uid(entry.uid())? {
            return Ok(false);
        }
        Ok(self.log.apply(std::slice::from_ref(entry))? > 0)
    }

    pub fn fetch_log_bundle(&self, from_uid: Uid, initial: bool) -> Result<Vec<LogEntry>> {
        self.log.entries_after(from_uid, initial, LOG_BUNDLE_SIZE)
    }

    /// Registers peers with the failure detector and runs the first sync.
    pub async fn init(&self) -> Result<bool> {
        for peer in self.peers() {
            self.detector.track(peer, ServiceRole::Manager).await;
        }
        self.sync().await
    }

    /// Pulls missed entries from every peer. Returns whether the store is
    /// now synchronized with a majority.
    pub async fn sync(&self) -> Result<bool> {
        let _guard = self.sync_lock.lock().await;
        let start = self.log.last_uid()?.unwrap_or(Uid::ZERO);

        let mut synced = 1;
        for peer in self.peers() {
            match self.sync_with(peer, start).await {
                Ok(applied) => {
                    synced += 1;
                    tracing::info!("synchronized log member={} applied={}", peer, applied);
                }
                Err(error) => {
                    if error.is_connection_fault() {
                        self.detector.report_failure(peer, ServiceRole::Manager).await;
                    }
                    tracing::warn!("log sync failed member={}: {}", peer, error);
                }
            }
        }

        let connected = is_majority(synced, self.members.len());
        if connected && !self.synced.swap(true, Ordering::SeqCst) {
            tracing::info!(
                "log store connected synced={} members={}",
                synced,
                self.members.len()
            );
        }
        Ok(connected)
    }

    async fn sync_with(&self, peer: &str, start: Uid) -> Result<usize> {
        let mut from = start;
        let mut initial = true;
        let mut applied = 0;

        loop {
            let bundle = self.rpc.fetch_log_bundle(peer, from, initial).await?;
            initial = false;

            let Some(last) = bundle.last() else {
                break;
            };
            from = last.uid();
            applied += self.log.apply(&bundle)?;

            if bundle.len() < LOG_BUNDLE_SIZE {
                break;
            }
        }

        Ok(applied)
    }

    /// Resends completes that failed while `address` was unreachable.
    pub async fn flush_retry_queue(&self, address: &str) {
        let Some(mut pending) = self.retry_queue.lock().await.remove(address) else {
            return;
        };

        if let Err(error) = self.deliver_pending(address, &mut pending).await {
            tracing::warn!("retrying complete failed member={}: {}", address, error);
            let mut queue = self.retry_queue.lock().await;
            if let Some(newer) = queue.remove(address) {
                pending.mark_replay(newer.replay_from);
                for entry in newer.entries {
                    pending.push(entry, self.retry_queue_limit);
                }
            }
            queue.insert(address.to_string(), pending);
            return;
        }
        tracing::info!("flushed retry queue member={}", address);
    }

    /// Replays the local log from the overflow point, then the queued
    /// entries. Completes are idempotent.
    async fn deliver_pending(&self, address: &str, pending: &mut PendingCompletes) -> Result<()> {
        if let Some(start) = pending.replay_from {
            let mut from = start;
            let mut inclusive = true;
            loop {
                let bundle = self.log.entries_after(from, inclusive, LOG_BUNDLE_SIZE)?;
                for entry in &bundle {
                    pending.replay_from = Some(entry.uid());
                    self.rpc.complete(address, entry).await?;
                }
                let Some(last) = bundle.last() else {
                    break;
                };
                if bundle.len() < LOG_BUNDLE_SIZE {
                    break;
                }
                from = last.uid();
                inclusive = false;
            }
            pending.replay_from = None;
        }

        while let Some(entry) = pending.entries.front() {
            self.rpc.complete(address, entry).await?;
            pending.entries.pop_front();
        }
        Ok(())
    }

    pub async fn pending_completes(&self, address: &str) -> usize {
        self.retry_queue
            .lock()
            .await
            .get(address)
            .map(|pending| pending.entries.len())
            .unwrap_or(0)
    }

    /// Reacts to managers coming back: flush their queue, resync if needed.
    pub fn start(self: Arc<Self>) {
        let mut events = self.detector.subscribe();
        tokio::spawn(async move {
            loop {
                let change = match events.recv().await {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("value store missed {} status changes", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                if change.role != ServiceRole::Manager || !change.new.is_up() {
                    continue;
                }
                if !self.members.contains(&change.address) {
                    continue;
                }

                self.flush_retry_queue(&change.address).await;
                if !self.is_synced() {
                    if let Err(error) = self.sync().await {
                        tracing::warn!("log resync failed: {}", error);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FailureDetectorConfig;
    use crate::testing::AlwaysUp;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::RwLock;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Routes manager calls straight into in-process stores.
    #[derive(Default)]
    struct Router {
        stores: RwLock<HashMap<String, Arc<ReplicatedValueStore>>>,
        down: RwLock<HashSet<String>>,
    }

    impl Router {
        fn target(&self, address: &str) -> Result<Arc<ReplicatedValueStore>> {
            if self.down.read().unwrap().contains(address) {
                return Err(BasaltError::connection(address, "unreachable"));
            }
            self.stores
                .read()
                .unwrap()
                .get(address)
                .cloned()
                .ok_or_else(|| BasaltError::connection(address, "unknown"))
        }

        fn set_down(&self, address: &str, down: bool) {
            let mut set = self.down.write().unwrap();
            if down {
                set.insert(address.to_string());
            } else {
                set.remove(address);
            }
        }
    }

    #[async_trait]
    impl ManagerRpc for Router {
        async fn propose(&self, address: &str, entry: &LogEntry) -> Result<()> {
            self.target(address)?.handle_proposal(entry)
        }

        async fn complete(&self, address: &str, entry: &LogEntry) -> Result<()> {
            self.target(address)?.handle_complete(entry).map(|_| ())
        }

        async fn fetch_log_bundle(
            &self,
            address: &str,
            from_uid: Uid,
            initial: bool,
        ) -> Result<Vec<LogEntry>> {
            self.target(address)?.fetch_log_bundle(from_uid, initial)
        }
    }

    struct TestCluster {
        router: Arc<Router>,
        stores: Vec<Arc<ReplicatedValueStore>>,
        detectors: Vec<Arc<FailureDetector>>,
        logs: Vec<Arc<LogStore>>,
        _dirs: Vec<TempDir>,
    }

    fn cluster(size: usize) -> TestCluster {
        cluster_with_queue_limit(size, RETRY_QUEUE_LIMIT)
    }

    fn cluster_with_queue_limit(size: usize, retry_queue_limit: usize) -> TestCluster {
        let router = Arc::new(Router::default());
        let members: Vec<String> = (0..size).map(|i| format!("m{}:7000", i)).collect();

        let mut stores = Vec::new();
        let mut detectors = Vec::new();
        let mut logs = Vec::new();
        let mut dirs = Vec::new();
        for member in &members {
            let dir = tempfile::tempdir().unwrap();
            let log = Arc::new(LogStore::open(dir.path().join("log.db")).unwrap());
            let detector = Arc::new(FailureDetector::new(
                FailureDetectorConfig::default(),
                Arc::new(AlwaysUp),
            ));
            let store = Arc::new(ReplicatedValueStore::new(
                ValueStoreConfig {
                    local_address: member.clone(),
                    members: members.clone(),
                    retry_queue_limit,
                },
                log.clone(),
                router.clone(),
                detector.clone(),
            ));
            router
                .stores
                .write()
                .unwrap()
                .insert(member.clone(), store.clone());
            stores.push(store);
            detectors.push(detector);
            logs.push(log);
            dirs.push(dir);
        }

        TestCluster {
            router,
            stores,
            detectors,
            logs,
            _dirs: dirs,
        }
    }

    #[tokio::test]
    async fn write_succeeds_with_majority_and_queues_unreachable_member() {
        let cluster = cluster(3);
        for store in &cluster.stores {
            assert!(store.init().await.unwrap());
        }
        cluster.router.set_down("m2:7000", true);

        cluster.stores[0]
            .set_value("alpha", Some("one".to_string()))
            .await
            .unwrap();

        assert_eq!(
            cluster.stores[0].get_value("alpha").await.unwrap().as_deref(),
            Some("one")
        );
        assert_eq!(
            cluster.stores[1].get_value("alpha").await.unwrap().as_deref(),
            Some("one")
        );
        assert_eq!(cluster.logs[2].entry_count().unwrap(), 0);
        assert_eq!(cluster.stores[0].pending_completes("m2:7000").await, 1);

        cluster.router.set_down("m2:7000", false);
        cluster.stores[0].flush_retry_queue("m2:7000").await;
        assert_eq!(cluster.stores[0].pending_completes("m2:7000").await, 0);
        assert_eq!(
            cluster.logs[2].get_value("alpha").unwrap().as_deref(),
            Some("one")
        );
    }

    #[tokio::test]
    async fn member_seen_up_again_receives_queued_completes() {
        let cluster = cluster(3);
        for store in &cluster.stores {
            assert!(store.init().await.unwrap());
        }
        cluster.stores[0].clone().start();
        cluster.router.set_down("m2:7000", true);

        cluster.stores[0]
            .set_value("alpha", Some("one".to_string()))
            .await
            .unwrap();
        assert_eq!(cluster.stores[0].pending_completes("m2:7000").await, 1);
        assert!(
            !cluster.detectors[0]
                .is_up("m2:7000", ServiceRole::Manager)
                .await
        );

        cluster.router.set_down("m2:7000", false);
        cluster.detectors[0].poll_once().await;

        for _ in 0..100 {
            if cluster.logs[2].get_value("alpha").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            cluster.logs[2].get_value("alpha").unwrap().as_deref(),
            Some("one")
        );
        assert_eq!(cluster.stores[0].pending_completes("m2:7000").await, 0);
    }

    #[tokio::test]
    async fn overflowing_retry_queue_replays_from_the_log() {
        let cluster = cluster_with_queue_limit(3, 2);
        for store in &cluster.stores {
            assert!(store.init().await.unwrap());
        }
        cluster.router.set_down("m2:7000", true);

        for i in 0..5 {
            cluster.stores[0]
                .set_value(&format!("key{}", i), Some(i.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(cluster.stores[0].pending_completes("m2:7000").await, 2);

        cluster.router.set_down("m2:7000", false);
        cluster.stores[0].flush_retry_queue("m2:7000").await;

        assert_eq!(cluster.stores[0].pending_completes("m2:7000").await, 0);
        assert_eq!(cluster.logs[2].entry_count().unwrap(), 5);
        assert_eq!(
            cluster.logs[2].get_value("key0").unwrap().as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn write_without_majority_fails_and_applies_nothing() {
        let cluster = cluster(3);
        for store in &cluster.stores {
            store.init().await.unwrap();
        }
        cluster.router.set_down("m1:7000", true);
        cluster.router.set_down("m2:7000", true);

        let result = cluster.stores[0]
            .set_block_id_server_map(BlockId::new(0, 1), vec![1, 2, 3])
            .await;
        assert!(matches!(
            result,
            Err(BasaltError::Quorum {
                acknowledged: 1,
                members: 3
            })
        ));

        for log in &cluster.logs {
            assert_eq!(log.entry_count().unwrap(), 0);
        }
        assert!(cluster.stores[0].check_connected().await.is_err());
    }

    #[tokio::test]
    async fn equal_value_is_a_no_op() {
        let cluster = cluster(1);
        let store = &cluster.stores[0];
        assert!(store.init().await.unwrap());

        store.set_value("k", Some("v".to_string())).await.unwrap();
        store.set_value("k", Some("v".to_string())).await.unwrap();
        assert_eq!(cluster.logs[0].entry_count().unwrap(), 1);

        store.set_value("k", None).await.unwrap();
        assert_eq!(store.get_value("k").await.unwrap(), None);
        assert_eq!(cluster.logs[0].entry_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_complete_is_ignored() {
        let cluster = cluster(1);
        let store = &cluster.stores[0];
        let entry = LogEntry::new(
            Uid::generate(),
            LogPayload::KeyValue {
                key: "k".to_string(),
                value: Some("v".to_string()),
            },
        );

        assert!(store.handle_complete(&entry).unwrap());
        assert!(!store.handle_complete(&entry).unwrap());
        assert_eq!(cluster.logs[0].entry_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn reads_require_a_sync() {
        let cluster = cluster(3);
        let result = cluster.stores[0].get_value("k").await;
        assert!(matches!(result, Err(BasaltError::NotConnected(_))));
    }

    #[tokio::test]
    async fn lagging_member_catches_up_in_bundles() {
        let cluster = cluster(3);
        for store in &cluster.stores {
            store.init().await.unwrap();
        }
        cluster.router.set_down("m2:7000", true);

        for i in 0..(LOG_BUNDLE_SIZE + 8) {
            cluster.stores[0]
                .set_value(&format!("key{}", i), Some(i.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(cluster.logs[2].entry_count().unwrap(), 0);

        cluster.router.set_down("m2:7000", false);
        assert!(cluster.stores[2].sync().await.unwrap());

        assert_eq!(
            cluster.logs[2].entry_count().unwrap(),
            (LOG_BUNDLE_SIZE + 8) as u64
        );
        assert_eq!(
            cluster.stores[2].get_value("key39").await.unwrap().as_deref(),
            Some("39")
        );
    }
}
