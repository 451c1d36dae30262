//! Cluster identity
//!
//! Static facts about the node the process runs on: which cluster it belongs
//! to, the accelerator generation, network fabric and PCIe tier. These drive
//! probe applicability and thresholds.
//!
//! The derivation is a pure function of [`ProfileInputs`]; only [`ProfileInputs::from_env`]
//! touches the environment and filesystem.

use std::fmt;
use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ONPREM_CLUSTERS: &[&str] = &["cluster1", "cluster2", "cluster3"];
const A100_CLUSTER: &str = "cluster-a100";
const TCPX_CLUSTER: &str = "cluster-tcpx";
const DEFAULT_VISIBLE_DEVICES: &[u32] = &[0, 1, 2, 3, 4, 5, 6, 7];

/// Device nodes whose presence means GPUs are attached
pub const GPU_DEVICE_NODES: &[&str] = &[
    "/dev/nvidia0",
    "/dev/nvidia1",
    "/dev/nvidia2",
    "/dev/nvidia3",
    "/dev/nvidia4",
    "/dev/nvidia5",
    "/dev/nvidia6",
    "/dev/nvidia7",
];

static PROFILE: OnceCell<ClusterProfile> = OnceCell::new();

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("K8S_CLUSTER_NAME is not set")]
    MissingClusterName,
    #[error("invalid CUDA_VISIBLE_DEVICES entry: {0}")]
    InvalidVisibleDevice(String),
}

/// Accelerator generation installed on the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorFamily {
    None,
    A100,
    H100,
    Tpu,
}

impl fmt::Display for AcceleratorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorFamily::None => write!(f, "none"),
            AcceleratorFamily::A100 => write!(f, "a100"),
            AcceleratorFamily::H100 => write!(f, "h100"),
            AcceleratorFamily::Tpu => write!(f, "tpu"),
        }
    }
}

/// Node-to-node network technology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FabricType {
    Infiniband,
    Tcpx,
    None,
}

impl fmt::Display for FabricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricType::Infiniband => write!(f, "infiniband"),
            FabricType::Tcpx => write!(f, "tcpx"),
            FabricType::None => write!(f, "none"),
        }
    }
}

/// Host PCIe generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyTier {
    Pcie4,
    Pcie5,
}

/// Raw facts the profile is derived from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileInputs {
    pub cluster_name: Option<String>,
    pub node_name: Option<String>,
    pub hostname: String,
    pub visible_devices: Option<String>,
    pub gpu_device_nodes_present: bool,
}

impl ProfileInputs {
    /// Collect inputs from the process environment and device filesystem
    pub fn from_env() -> Self {
        let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|h| h.trim().to_string())
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_default();

        Self {
            cluster_name: std::env::var("K8S_CLUSTER_NAME").ok(),
            node_name: std::env::var("K8S_NODE_NAME").ok(),
            hostname,
            visible_devices: std::env::var("CUDA_VISIBLE_DEVICES").ok(),
            gpu_device_nodes_present: GPU_DEVICE_NODES.iter().any(|p| Path::new(p).exists()),
        }
    }
}

/// Immutable snapshot of the node's identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub cluster_name: String,
    /// Kubernetes node name, falls back to the hostname
    pub node_name: String,
    pub hostname: String,
    pub accelerator: AcceleratorFamily,
    pub fabric: FabricType,
    pub topology: Option<TopologyTier>,
    pub onprem: bool,
    /// GPU device nodes exist on this host
    pub gpus_present: bool,
    /// Devices selected by CUDA_VISIBLE_DEVICES, `None` when it is unset
    pub visible_devices: Option<Vec<u32>>,
}

impl ClusterProfile {
    /// Derive a profile from raw inputs
    pub fn derive(inputs: &ProfileInputs) -> Result<Self, ProfileError> {
        let cluster_name = inputs
            .cluster_name
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or(ProfileError::MissingClusterName)?;
        let node_name = inputs
            .node_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| inputs.hostname.clone());

        let tpu = cluster_name.starts_with("tpu");
        let nvidia = !tpu && !node_name.contains("-cpu");
        let accelerator = if tpu {
            AcceleratorFamily::Tpu
        } else if !nvidia {
            AcceleratorFamily::None
        } else if cluster_name == A100_CLUSTER {
            AcceleratorFamily::A100
        } else {
            AcceleratorFamily::H100
        };

        let onprem = ONPREM_CLUSTERS.contains(&cluster_name.as_str());
        let fabric = if cluster_name == TCPX_CLUSTER {
            FabricType::Tcpx
        } else if onprem || cluster_name == A100_CLUSTER {
            FabricType::Infiniband
        } else {
            FabricType::None
        };
        let topology = if onprem {
            Some(TopologyTier::Pcie5)
        } else if cluster_name == TCPX_CLUSTER {
            Some(TopologyTier::Pcie4)
        } else {
            None
        };

        let visible_devices = inputs
            .visible_devices
            .as_deref()
            .map(parse_visible_devices)
            .transpose()?;

        Ok(Self {
            cluster_name,
            node_name,
            hostname: inputs.hostname.clone(),
            accelerator,
            fabric,
            topology,
            onprem,
            gpus_present: inputs.gpu_device_nodes_present,
            visible_devices,
        })
    }

    /// Detect the profile of the current process
    pub fn detect() -> Result<Self, ProfileError> {
        Self::derive(&ProfileInputs::from_env())
    }

    /// Process-wide profile, detected on first access
    pub fn current() -> Result<&'static ClusterProfile, ProfileError> {
        PROFILE.get_or_try_init(Self::detect)
    }

    pub fn is_nvidia(&self) -> bool {
        matches!(
            self.accelerator,
            AcceleratorFamily::A100 | AcceleratorFamily::H100
        )
    }

    pub fn is_tcpx(&self) -> bool {
        self.fabric == FabricType::Tcpx
    }

    /// Devices to query, every GPU slot when CUDA_VISIBLE_DEVICES is unset
    pub fn devices(&self) -> &[u32] {
        self.visible_devices
            .as_deref()
            .unwrap_or(DEFAULT_VISIBLE_DEVICES)
    }

    /// `devices()` formatted for command lines
    pub fn visible_devices_arg(&self) -> String {
        self.devices()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn parse_visible_devices(raw: &str) -> Result<Vec<u32>, ProfileError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| ProfileError::InvalidVisibleDevice(s.to_string()))
        })
        .collect()
}
