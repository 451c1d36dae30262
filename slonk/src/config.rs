//! Configuration module for Slonk
//!
//! Handles loading and validating configuration from YAML files and environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use slonk_core::settings::ProbeSettings;

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint runs next to continuous checks
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Prefix of metrics pushed by jobs
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            prefix: default_metrics_prefix(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node name (from K8s downward API)
    #[serde(default)]
    pub node_name: Option<String>,

    /// Dry run mode - log actions but don't execute
    #[serde(default)]
    pub dry_run: bool,

    /// Report failures without mitigating them
    #[serde(default)]
    pub no_mitigation: bool,

    /// Pause between continuous check cycles
    #[serde(with = "humantime_serde", default = "default_continuous_interval")]
    pub continuous_interval: Duration,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Probe thresholds and paths
    #[serde(default)]
    pub probes: ProbeSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: None,
            dry_run: false,
            no_mitigation: false,
            continuous_interval: default_continuous_interval(),
            metrics: MetricsConfig::default(),
            probes: ProbeSettings::default(),
        }
    }
}

fn comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let probes = &self.probes;
        if probes.accelerator.idle_memory_attempts == 0 {
            anyhow::bail!("probes.accelerator.idle_memory_attempts must be > 0");
        }
        if probes.interface.toggle_attempts == 0 {
            anyhow::bail!("probes.interface.toggle_attempts must be > 0");
        }
        if probes.control_plane.attempts == 0 {
            anyhow::bail!("probes.control_plane.attempts must be > 0");
        }
        if !(probes.fabric.failure_threshold > 0.0 && probes.fabric.failure_threshold <= 1.0) {
            anyhow::bail!("probes.fabric.failure_threshold must be in (0, 1]");
        }
        if probes.disk.max_used_percent > 100 {
            anyhow::bail!("probes.disk.max_used_percent must be <= 100");
        }
        if self.continuous_interval.is_zero() {
            anyhow::bail!("continuous_interval must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        Ok(())
    }

    /// Apply environment overrides on top of the file
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if self.node_name.is_none() {
            self.node_name = var("NODE_NAME").or_else(|| var("K8S_NODE_NAME"));
        }
        if let Some(hosts) = var("CONTROL_PLANE_HOSTS") {
            self.probes.control_plane.hosts = comma_list(&hosts);
        }
        if let Some(ips) = var("CEPH_CLUSTER_IPS") {
            self.probes.storage.ceph_ips = comma_list(&ips);
        }
        if let Some(ip) = var("WEKA_CLUSTER_IP") {
            self.probes.storage.weka_ip = Some(ip);
        }
        if let Some(endpoint) = var("BLOB_STORAGE_ENDPOINT") {
            self.probes.storage.blob_endpoint = Some(endpoint);
        }
        self
    }
}

// Default value functions
fn default_continuous_interval() -> Duration {
    slonk_core::orchestrator::CONTINUOUS_INTERVAL
}

fn default_metrics_port() -> u16 {
    7080
}

fn default_metrics_prefix() -> String {
    "jobmetrics".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.continuous_interval, Duration::from_secs(60));
        assert_eq!(config.metrics.port, 7080);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.probes.accelerator.expected_gpu_count, 8);
        assert_eq!(config.probes.disk.max_used_percent, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
node_name: cluster-tcpx-node-7
no_mitigation: true
continuous_interval: 2m

metrics:
  port: 9100
  prefix: training

probes:
  command_timeout: 30s
  accelerator:
    idle_memory_mib: 20
    idle_memory_backoff: 1s
  kernel:
    fatal_xids: [48, 79]
  disk:
    mounts: ["/"]
    max_used_percent: 95
  serial:
    denylist: ["ABC123"]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.node_name.as_deref(), Some("cluster-tcpx-node-7"));
        assert!(config.no_mitigation);
        assert_eq!(config.continuous_interval, Duration::from_secs(120));
        assert_eq!(config.metrics.prefix, "training");
        assert!(config.metrics.enabled);
        assert_eq!(config.probes.command_timeout, Duration::from_secs(30));
        assert_eq!(config.probes.accelerator.idle_memory_mib, 20);
        assert_eq!(config.probes.accelerator.idle_memory_mib_tcpx, 4700);
        assert_eq!(config.probes.kernel.fatal_xids, vec![48, 79]);
        assert_eq!(config.probes.serial.denylist, vec!["ABC123"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.probes.fabric.failure_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probes.accelerator.idle_memory_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probes.disk.max_used_percent = 101;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.continuous_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("K8S_NODE_NAME", "node-3"),
            ("CONTROL_PLANE_HOSTS", "cp-1, cp-2,"),
            ("CEPH_CLUSTER_IPS", "10.0.0.1,10.0.0.2"),
            ("WEKA_CLUSTER_IP", "10.0.0.9"),
        ]
        .into_iter()
        .collect();
        let config = Config::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.node_name.as_deref(), Some("node-3"));
        assert_eq!(config.probes.control_plane.hosts, vec!["cp-1", "cp-2"]);
        assert_eq!(config.probes.storage.ceph_ips.len(), 2);
        assert_eq!(config.probes.storage.weka_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(config.probes.storage.blob_endpoint, None);
    }

    #[test]
    fn test_file_node_name_wins() {
        let mut config = Config::default();
        config.node_name = Some("from-file".into());
        let config = config.with_overrides(|_| Some("from-env".into()));
        assert_eq!(config.node_name.as_deref(), Some("from-file"));
    }
}
