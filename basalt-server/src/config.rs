use basalt_core::{BasaltError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    /// Present when this process acts as an allocation manager.
    #[serde(default)]
    pub manager: Option<ManagerConfig>,
    /// Present when this process stores blocks.
    #[serde(default)]
    pub block: Option<BlockConfig>,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub bind_addr: String,
    #[serde(default)]
    pub advertise_addr: Option<String>,
    pub data_dir: PathBuf,
}

impl NodeConfig {
    pub fn effective_address(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub unique_id: u8,
    /// Every manager of the cluster, this one included.
    pub members: Vec<String>,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    pub server_guid: u64,
    pub managers: Vec<String>,
    #[serde(default = "default_register_retry_secs")]
    pub register_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_report_throttle_ms")]
    pub report_throttle_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            report_throttle_ms: default_report_throttle_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn report_throttle(&self) -> Duration {
        Duration::from_millis(self.report_throttle_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_register_retry_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_report_throttle_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("BASALT").separator("__"))
            .build()
            .map_err(|e| BasaltError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BasaltError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.manager.is_none() && self.block.is_none() {
            return Err(BasaltError::Config(
                "at least one of manager or block must be configured".to_string(),
            ));
        }

        if let Some(manager) = &self.manager {
            let address = self.node.effective_address();
            if !manager.members.contains(&address) {
                return Err(BasaltError::Config(format!(
                    "manager members must include this node's address '{}'",
                    address
                )));
            }
        }

        if let Some(block) = &self.block {
            if block.managers.is_empty() {
                return Err(BasaltError::Config(
                    "block server needs at least one manager address".to_string(),
                ));
            }
        }

        Ok(())
    }
}
