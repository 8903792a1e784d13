use super::rpc::HeartbeatRpc;
use super::types::{ServiceRole, ServiceStatus, StatusChange};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, broadcast};

type Target = (String, ServiceRole);

#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    pub poll_interval: Duration,
    /// Duplicate client reports for one target inside this window are ignored.
    pub report_throttle: Duration,
    pub event_capacity: usize,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            report_throttle: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}

/// Per-(address, role) health table fed by heartbeat polls and client reports.
pub struct FailureDetector {
    config: FailureDetectorConfig,
    heartbeat: Arc<dyn HeartbeatRpc>,
    statuses: RwLock<HashMap<Target, ServiceStatus>>,
    tracked: RwLock<HashSet<Target>>,
    last_reports: Mutex<HashMap<Target, Instant>>,
    events: broadcast::Sender<StatusChange>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig, heartbeat: Arc<dyn HeartbeatRpc>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            heartbeat,
            statuses: RwLock::new(HashMap::new()),
            tracked: RwLock::new(HashSet::new()),
            last_reports: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    /// Status of a target; targets never seen are assumed up.
    pub async fn status(&self, address: &str, role: ServiceRole) -> ServiceStatus {
        self.statuses
            .read()
            .await
            .get(&(address.to_string(), role))
            .copied()
            .unwrap_or(ServiceStatus::Up)
    }

    pub async fn is_up(&self, address: &str, role: ServiceRole) -> bool {
        self.status(address, role).await.is_up()
    }

    pub async fn track(&self, address: &str, role: ServiceRole) {
        self.tracked.write().await.insert((address.to_string(), role));
    }

    /// A caller saw a transport failure talking to the target.
    pub async fn report_failure(&self, address: &str, role: ServiceRole) {
        let target = (address.to_string(), role);
        {
            let mut last_reports = self.last_reports.lock().await;
            let now = Instant::now();
            if let Some(previous) = last_reports.get(&target) {
                if now.duration_since(*previous) < self.config.report_throttle {
                    return;
                }
            }
            last_reports.insert(target.clone(), now);
        }

        self.transition(target, |status| match status {
            ServiceStatus::Up => Some(ServiceStatus::DownClientReport),
            _ => None,
        })
        .await;
    }

    /// The target announced a graceful stop; polling never revives it.
    pub async fn report_shutdown(&self, address: &str, role: ServiceRole) {
        self.transition((address.to_string(), role), |status| match status {
            ServiceStatus::DownShutdown => None,
            _ => Some(ServiceStatus::DownShutdown),
        })
        .await;
    }

    /// Clears a shutdown record, used when a stopped service registers again.
    pub async fn report_started(&self, address: &str, role: ServiceRole) {
        self.transition((address.to_string(), role), |status| match status {
            ServiceStatus::Up => None,
            _ => Some(ServiceStatus::Up),
        })
        .await;
    }

    /// Polls every tracked target and every target with a record once.
    pub async fn poll_once(&self) {
        let mut targets: HashSet<Target> = self.tracked.read().await.clone();
        targets.extend(self.statuses.read().await.keys().cloned());

        for (address, role) in targets {
            let healthy = match self.heartbeat.poll(&address, role).await {
                Ok(()) => true,
                Err(error) => {
                    tracing::debug!("heartbeat failed address={} role={}: {}", address, role, error);
                    false
                }
            };
            self.apply_poll((address, role), healthy).await;
        }
    }

    async fn apply_poll(&self, target: Target, healthy: bool) {
        self.transition(target, |status| match (status, healthy) {
            (ServiceStatus::DownClientReport | ServiceStatus::DownHeartbeat, true) => {
                Some(ServiceStatus::Up)
            }
            (ServiceStatus::Up | ServiceStatus::DownClientReport, false) => {
                Some(ServiceStatus::DownHeartbeat)
            }
            _ => None,
        })
        .await;
    }

    async fn transition<F>(&self, target: Target, next: F)
    where
        F: FnOnce(ServiceStatus) -> Option<ServiceStatus>,
    {
        let change = {
            let mut statuses = self.statuses.write().await;
            let old = statuses.get(&target).copied().unwrap_or(ServiceStatus::Up);
            let Some(new) = next(old) else {
                return;
            };
            if new == old {
                return;
            }
            statuses.insert(target.clone(), new);
            StatusChange {
                address: target.0,
                role: target.1,
                old,
                new,
                at: chrono::Utc::now(),
            }
        };

        tracing::info!(
            "service status changed address={} role={} old={} new={}",
            change.address,
            change.role,
            change.old,
            change.new
        );
        // no subscribers is fine
        let _ = self.events.send(change);
    }

    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.poll_once().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BasaltError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SwitchHeartbeat {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl HeartbeatRpc for SwitchHeartbeat {
        async fn poll(&self, address: &str, _role: ServiceRole) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BasaltError::connection(address, "refused"))
            }
        }
    }

    fn detector(healthy: bool) -> (Arc<SwitchHeartbeat>, FailureDetector) {
        let heartbeat = Arc::new(SwitchHeartbeat {
            healthy: AtomicBool::new(healthy),
        });
        let config = FailureDetectorConfig {
            report_throttle: Duration::from_secs(60),
            ..FailureDetectorConfig::default()
        };
        let detector = FailureDetector::new(config, heartbeat.clone());
        (heartbeat, detector)
    }

    #[tokio::test]
    async fn client_report_then_heartbeat_recovers_with_one_event() {
        let (_heartbeat, detector) = detector(true);
        let mut events = detector.subscribe();

        assert_eq!(detector.status("b1:7000", ServiceRole::Block).await, ServiceStatus::Up);

        detector.report_failure("b1:7000", ServiceRole::Block).await;
        assert_eq!(
            detector.status("b1:7000", ServiceRole::Block).await,
            ServiceStatus::DownClientReport
        );
        let down = events.try_recv().unwrap();
        assert_eq!(down.new, ServiceStatus::DownClientReport);

        detector.poll_once().await;
        assert!(detector.is_up("b1:7000", ServiceRole::Block).await);

        let up = events.try_recv().unwrap();
        assert_eq!(up.old, ServiceStatus::DownClientReport);
        assert_eq!(up.new, ServiceStatus::Up);
        assert!(events.try_recv().is_err());

        detector.poll_once().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_reports_are_throttled() {
        let (heartbeat, detector) = detector(true);
        let mut events = detector.subscribe();

        detector.report_failure("m2:7000", ServiceRole::Manager).await;
        events.try_recv().unwrap();

        heartbeat.healthy.store(true, Ordering::SeqCst);
        detector.poll_once().await;
        events.try_recv().unwrap();

        // inside the throttle window: ignored
        detector.report_failure("m2:7000", ServiceRole::Manager).await;
        assert!(detector.is_up("m2:7000", ServiceRole::Manager).await);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_poll_marks_tracked_targets_down() {
        let (heartbeat, detector) = detector(false);
        detector.track("b2:7000", ServiceRole::Block).await;

        detector.poll_once().await;
        assert_eq!(
            detector.status("b2:7000", ServiceRole::Block).await,
            ServiceStatus::DownHeartbeat
        );

        heartbeat.healthy.store(true, Ordering::SeqCst);
        detector.poll_once().await;
        assert!(detector.is_up("b2:7000", ServiceRole::Block).await);
    }

    #[tokio::test]
    async fn shutdown_is_not_reverted_by_polling() {
        let (_heartbeat, detector) = detector(true);
        detector.report_shutdown("r1:7000", ServiceRole::Root).await;

        detector.poll_once().await;
        assert_eq!(
            detector.status("r1:7000", ServiceRole::Root).await,
            ServiceStatus::DownShutdown
        );

        detector.report_started("r1:7000", ServiceRole::Root).await;
        assert!(detector.is_up("r1:7000", ServiceRole::Root).await);
    }
}
