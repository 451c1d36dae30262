//! Probe tunables
//!
//! Thresholds, paths and retry budgets for every probe. All fields have
//! defaults matching production clusters, so an empty YAML section is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for all probes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Timeout for quick introspection commands
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    pub accelerator: AcceleratorSettings,
    pub kernel: KernelSettings,
    pub interface: InterfaceSettings,
    pub fabric: FabricSettings,
    pub control_plane: ControlPlaneSettings,
    pub storage: StorageSettings,
    pub pci: PciSettings,
    pub disk: DiskSettings,
    pub cpu: CpuSettings,
    pub serial: SerialSettings,
    pub maintenance: MaintenanceSettings,
    pub diag: DiagSettings,
    pub burn: BurnSettings,
    pub bandwidth: BandwidthSettings,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(120),
            accelerator: AcceleratorSettings::default(),
            kernel: KernelSettings::default(),
            interface: InterfaceSettings::default(),
            fabric: FabricSettings::default(),
            control_plane: ControlPlaneSettings::default(),
            storage: StorageSettings::default(),
            pci: PciSettings::default(),
            disk: DiskSettings::default(),
            cpu: CpuSettings::default(),
            serial: SerialSettings::default(),
            maintenance: MaintenanceSettings::default(),
            diag: DiagSettings::default(),
            burn: BurnSettings::default(),
            bandwidth: BandwidthSettings::default(),
        }
    }
}

impl ProbeSettings {
    /// Settings with every wait shortened to zero
    pub fn without_waits() -> Self {
        let mut settings = Self::default();
        settings.accelerator.idle_memory_backoff = Duration::ZERO;
        settings.interface.link_down_wait = Duration::ZERO;
        settings.interface.link_up_wait = Duration::ZERO;
        settings
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorSettings {
    /// Candidate nvidia-smi locations, first existing one wins
    pub nvidia_smi_paths: Vec<PathBuf>,
    /// Devices to expect when CUDA_VISIBLE_DEVICES selects none
    pub expected_gpu_count: usize,
    /// Idle framebuffer usage allowed on TCPX nodes (the receive-datapath daemon holds memory)
    pub idle_memory_mib_tcpx: u64,
    pub idle_memory_mib: u64,
    pub idle_memory_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub idle_memory_backoff: Duration,
    pub max_correctable_ecc: u64,
    pub max_uncorrectable_ecc: u64,
}

impl Default for AcceleratorSettings {
    fn default() -> Self {
        Self {
            nvidia_smi_paths: vec![PathBuf::from("/usr/local/nvidia/bin/nvidia-smi")],
            expected_gpu_count: 8,
            idle_memory_mib_tcpx: 4700,
            idle_memory_mib: 10,
            idle_memory_attempts: 3,
            idle_memory_backoff: Duration::from_secs(5),
            max_correctable_ecc: 25_000,
            max_uncorrectable_ecc: 0,
        }
    }
}

impl AcceleratorSettings {
    /// nvidia-smi command to invoke
    pub fn nvidia_smi(&self) -> String {
        self.nvidia_smi_paths
            .iter()
            .find(|p| p.exists())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "nvidia-smi".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Driver fault codes that flag the node for manual intervention
    pub fatal_xids: Vec<u32>,
    /// Recoverable fault code that is only counted
    pub counted_xid: u32,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            fatal_xids: vec![
                48, 56, 57, 58, 62, 63, 64, 65, 68, 69, 73, 74, 79, 80, 81, 92, 109, 119, 120,
            ],
            counted_xid: 13,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    pub toggle_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub link_down_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub link_up_wait: Duration,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            toggle_attempts: 5,
            link_down_wait: Duration::from_secs(1),
            link_up_wait: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricSettings {
    /// Data-path adapters probed by the reachability check
    pub adapters: Vec<String>,
    pub sample_size: usize,
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Fraction of failed pings above which the node is power cycled
    pub failure_threshold: f64,
    /// InfiniBand devices whose port state is inspected, per cluster
    pub infiniband_devices: BTreeMap<String, Vec<String>>,
}

fn mlx5(indices: &[u32]) -> Vec<String> {
    indices.iter().map(|i| format!("mlx5_{}", i)).collect()
}

impl Default for FabricSettings {
    fn default() -> Self {
        let mut infiniband_devices = BTreeMap::new();
        infiniband_devices.insert("cluster-a100".to_string(), mlx5(&[0, 1, 2, 3, 4, 5, 6, 7]));
        infiniband_devices.insert("cluster1".to_string(), mlx5(&[0, 1, 2, 3, 5, 6, 7, 8, 11]));
        infiniband_devices.insert("cluster2".to_string(), mlx5(&[0, 3, 4, 5, 6, 9, 10, 11]));

        Self {
            adapters: ["eth1", "eth2", "eth3", "eth4"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sample_size: 10,
            ping_timeout: Duration::from_millis(100),
            failure_threshold: 0.5,
            infiniband_devices,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneSettings {
    /// Hosts to ping; the check is skipped when empty
    pub hosts: Vec<String>,
    pub attempts: u32,
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Clusters with the shared filesystem
    pub clusters: Vec<String>,
    pub home_mount: PathBuf,
    pub ceph_ips: Vec<String>,
    pub weka_ip: Option<String>,
    pub blob_endpoint: Option<String>,
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            clusters: vec!["cluster1".to_string()],
            home_mount: PathBuf::from("/home/common/git-sync"),
            ceph_ips: Vec::new(),
            weka_ip: None,
            blob_endpoint: None,
            ping_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PciSettings {
    pub clusters: Vec<String>,
    /// Bridge addresses that must have ACS source validation disabled
    pub tracked_buses: Vec<String>,
}

impl Default for PciSettings {
    fn default() -> Self {
        let tracked_buses = [
            "18:00.0", "18:01.0", "18:02.0", "18:1f.0", "2b:00.0", "2b:01.0", "2b:02.0",
            "3e:00.0", "3e:01.0", "3e:02.0", "3e:1f.0", "64:00.0", "64:01.0", "64:02.0",
            "9a:00.0", "9a:01.0", "9a:02.0", "9a:1f.0", "ac:00.0", "ac:01.0", "ac:02.0",
            "be:00.0", "be:01.0", "be:02.0", "be:1f.0", "e2:00.0", "e2:01.0", "e2:02.0",
        ];
        Self {
            clusters: vec!["cluster1".to_string()],
            tracked_buses: tracked_buses.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSettings {
    pub mounts: Vec<String>,
    pub max_used_percent: u32,
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            mounts: vec!["/".to_string(), "/mnt/localdisk".to_string()],
            max_used_percent: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSettings {
    /// Load average (in cores) above which a warning is logged
    pub max_load: f64,
}

impl Default for CpuSettings {
    fn default() -> Self {
        Self { max_load: 20.0 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub denylist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub metadata_url: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            metadata_url:
                "http://metadata.google.internal/computeMetadata/v1/instance/maintenance-event"
                    .to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagSettings {
    pub binary: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DiagSettings {
    fn default() -> Self {
        Self {
            binary: "dcgmi".to_string(),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BurnSettings {
    pub binary: PathBuf,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Default for BurnSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/local/bin/gpu_burn"),
            duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthSettings {
    pub htod_binary: PathBuf,
    pub nccl_binary: PathBuf,
    /// Message size for single-node collective runs
    pub nccl_message_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BandwidthSettings {
    fn default() -> Self {
        Self {
            htod_binary: PathBuf::from("/usr/local/bin/nv-bandwidthtest"),
            nccl_binary: PathBuf::from("/usr/local/bin/all_reduce_perf"),
            nccl_message_bytes: 2 * 1024 * 1024 * 1024,
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Whether a binary is installed at `path`
pub fn installed(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = ProbeSettings::default();
        assert_eq!(s.accelerator.idle_memory_attempts, 3);
        assert_eq!(s.accelerator.idle_memory_backoff, Duration::from_secs(5));
        assert!(s.kernel.fatal_xids.contains(&79));
        assert!(!s.kernel.fatal_xids.contains(&13));
        assert_eq!(s.pci.tracked_buses.len(), 28);
        assert_eq!(s.fabric.infiniband_devices["cluster1"].len(), 9);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let json = serde_json::json!({
            "accelerator": { "idle_memory_backoff": "1s" },
            "disk": { "max_used_percent": 80 }
        });
        let s: ProbeSettings = serde_json::from_value(json).unwrap();
        assert_eq!(s.accelerator.idle_memory_backoff, Duration::from_secs(1));
        assert_eq!(s.accelerator.idle_memory_attempts, 3);
        assert_eq!(s.disk.max_used_percent, 80);
        assert_eq!(s.disk.mounts.len(), 2);
    }
}
