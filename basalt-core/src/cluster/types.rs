use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Manager,
    Root,
    Block,
}

impl ServiceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Manager => "manager",
            ServiceRole::Root => "root",
            ServiceRole::Block => "block",
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Up,
    DownClientReport,
    DownHeartbeat,
    DownShutdown,
}

impl ServiceStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, ServiceStatus::Up)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Up => "up",
            ServiceStatus::DownClientReport => "down_client_report",
            ServiceStatus::DownHeartbeat => "down_heartbeat",
            ServiceStatus::DownShutdown => "down_shutdown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted once for every actual status transition of a tracked service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub address: String,
    pub role: ServiceRole,
    pub old: ServiceStatus,
    pub new: ServiceStatus,
    pub at: DateTime<Utc>,
}

/// A registered block server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockServiceInfo {
    pub server_guid: u64,
    pub address: String,
}

/// A replica of a block together with its last known health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockServerStatus {
    pub server_guid: u64,
    pub address: String,
    pub status: ServiceStatus,
}

/// Strict majority of `members`, counting the local node.
pub fn is_majority(count: usize, members: usize) -> bool {
    count * 2 > members
}
