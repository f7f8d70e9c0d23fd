//! Agent configuration
//!
//! Loaded from an optional config file (`AGENT_CONFIG_FILE`) overlaid with
//! `AGENT_*` environment variables. Map- and list-valued fields (exclude
//! list, state directories) come from the file.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use topology_agent_lib::events::RateLimitConfig;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from the Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Kubelet pod-resources socket path
    #[serde(default = "default_podresources_socket")]
    pub podresources_socket: PathBuf,

    /// Sysfs mount point for NUMA discovery
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Only account pods from this namespace
    #[serde(default)]
    pub namespace: Option<String>,

    /// Re-query allocatable resources before every scan
    #[serde(default)]
    pub refresh_node_resources: bool,

    /// Per-node (or `*`) resource names to omit from published zones
    #[serde(default)]
    pub exclude_list: HashMap<String, Vec<String>>,

    /// Attach the pod-set fingerprint annotation
    #[serde(default = "default_true")]
    pub pods_fingerprint: bool,

    /// Periodic trigger interval in seconds; zero disables the timer
    #[serde(default = "default_sleep_interval")]
    pub sleep_interval_secs: u64,

    /// File external writers touch to request a re-scan
    #[serde(default)]
    pub notify_file: Option<PathBuf>,

    /// Kubelet state directories watched for checkpoint-file creation
    #[serde(default)]
    pub kubelet_state_dirs: Vec<PathBuf>,

    /// Maximum trigger events forwarded per time unit; zero disables rate
    /// limiting
    #[serde(default)]
    pub max_events_per_time_unit: u64,

    /// Length of the rate-limiting time unit in seconds
    #[serde(default = "default_time_unit")]
    pub time_unit_secs: u64,

    /// Publish exactly one topology update, then stop the updater
    #[serde(default)]
    pub one_shot: bool,

    /// Skip all writes to the cluster API (dry run)
    #[serde(default)]
    pub no_publish: bool,

    /// Kubelet topology-manager policy, published as an attribute
    #[serde(default)]
    pub topology_manager_policy: Option<String>,

    /// Kubelet topology-manager scope, published as an attribute
    #[serde(default)]
    pub topology_manager_scope: Option<String>,

    /// Timeout for each pod-resources call in seconds
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_podresources_socket() -> PathBuf {
    PathBuf::from(topology_agent_lib::scanner::DEFAULT_POD_RESOURCES_SOCKET)
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_true() -> bool {
    true
}

fn default_sleep_interval() -> u64 {
    60
}

fn default_time_unit() -> u64 {
    1
}

fn default_scan_timeout() -> u64 {
    30
}

impl AgentConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Ok(path) = std::env::var("AGENT_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()?;

        let config: AgentConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_events_per_time_unit > 0 && self.time_unit_secs == 0 {
            bail!("max_events_per_time_unit requires a non-zero time_unit_secs");
        }
        Ok(())
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Rate-limiter settings, when rate limiting is enabled at all.
    pub fn rate_limit(&self) -> Option<RateLimitConfig> {
        if self.max_events_per_time_unit == 0 {
            return None;
        }
        Some(RateLimitConfig::new(
            self.max_events_per_time_unit,
            Duration::from_secs(self.time_unit_secs),
        ))
    }
}
