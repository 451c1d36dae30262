//! Diagnostic probes
//!
//! A probe inspects one subsystem of the node and either returns `Ok(())` or
//! raises a [`CheckError`](crate::error::CheckError). Probes only read: they run
//! commands and query the cluster directory, but never taint, label or reboot.
//! That is left to the [`MitigationDispatcher`](crate::mitigation::MitigationDispatcher).

mod control_plane;
mod cpu_load;
mod diag;
mod disk;
mod gpu_burn;
mod goal_state;
mod htod;
mod ibv_devinfo;
mod iface;
mod lspci;
mod maintenance;
mod nccl;
mod nvidia_smi;
mod ping;
mod serial;
mod storage;
mod xid;

pub use control_plane::ControlPlaneProbe;
pub use cpu_load::CpuLoadProbe;
pub use diag::DiagProbe;
pub use disk::DiskUsageProbe;
pub use gpu_burn::BurnInProbe;
pub use goal_state::GoalStateProbe;
pub use htod::HostDeviceBandwidthProbe;
pub use ibv_devinfo::FabricDevinfoProbe;
pub use iface::InterfaceProbe;
pub use lspci::PciTopologyProbe;
pub use maintenance::MaintenanceProbe;
pub use nccl::CollectiveBandwidthProbe;
pub use nvidia_smi::AcceleratorProbe;
pub use ping::FabricReachabilityProbe;
pub use serial::SerialDenylistProbe;
pub use storage::StorageProbe;
pub use xid::DriverFaultProbe;

pub(crate) use nccl::nccl_env;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::ClusterDirectory;
use crate::error::ProbeError;
use crate::exec::{CommandOutput, CommandRunner, ExecError, ExecOptions};
use crate::profile::ClusterProfile;
use crate::settings::ProbeSettings;

/// Identifies a probe within the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeId {
    SerialDenylist,
    Interface,
    PciTopology,
    Storage,
    ControlPlane,
    FabricDevinfo,
    AcceleratorSanity,
    DriverFaults,
    DiskUsage,
    CpuLoad,
    Maintenance,
    DiagFast,
    FabricReachability,
    BurnIn,
    DiagFull,
    HostDeviceBandwidth,
    InterNodeBandwidth,
    GoalState,
}

impl ProbeId {
    pub const ALL: [ProbeId; 18] = [
        ProbeId::SerialDenylist,
        ProbeId::Interface,
        ProbeId::PciTopology,
        ProbeId::Storage,
        ProbeId::ControlPlane,
        ProbeId::FabricDevinfo,
        ProbeId::AcceleratorSanity,
        ProbeId::DriverFaults,
        ProbeId::DiskUsage,
        ProbeId::CpuLoad,
        ProbeId::Maintenance,
        ProbeId::DiagFast,
        ProbeId::FabricReachability,
        ProbeId::BurnIn,
        ProbeId::DiagFull,
        ProbeId::HostDeviceBandwidth,
        ProbeId::InterNodeBandwidth,
        ProbeId::GoalState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeId::SerialDenylist => "serial_denylist",
            ProbeId::Interface => "interface",
            ProbeId::PciTopology => "pci_topology",
            ProbeId::Storage => "storage",
            ProbeId::ControlPlane => "control_plane",
            ProbeId::FabricDevinfo => "fabric_devinfo",
            ProbeId::AcceleratorSanity => "accelerator_sanity",
            ProbeId::DriverFaults => "driver_faults",
            ProbeId::DiskUsage => "disk_usage",
            ProbeId::CpuLoad => "cpu_load",
            ProbeId::Maintenance => "maintenance",
            ProbeId::DiagFast => "diag_fast",
            ProbeId::FabricReachability => "fabric_reachability",
            ProbeId::BurnIn => "burn_in",
            ProbeId::DiagFull => "diag_full",
            ProbeId::HostDeviceBandwidth => "host_device_bandwidth",
            ProbeId::InterNodeBandwidth => "inter_node_bandwidth",
            ProbeId::GoalState => "goal_state",
        }
    }

    pub fn category(&self) -> ProbeCategory {
        match self {
            ProbeId::AcceleratorSanity
            | ProbeId::DiagFast
            | ProbeId::DiagFull
            | ProbeId::BurnIn => ProbeCategory::Accelerator,
            ProbeId::DriverFaults => ProbeCategory::Kernel,
            ProbeId::Interface
            | ProbeId::FabricDevinfo
            | ProbeId::FabricReachability
            | ProbeId::ControlPlane => ProbeCategory::Network,
            ProbeId::Storage => ProbeCategory::Storage,
            ProbeId::PciTopology => ProbeCategory::Pci,
            ProbeId::SerialDenylist | ProbeId::DiskUsage | ProbeId::CpuLoad => {
                ProbeCategory::System
            }
            ProbeId::Maintenance => ProbeCategory::Maintenance,
            ProbeId::HostDeviceBandwidth | ProbeId::InterNodeBandwidth => {
                ProbeCategory::Bandwidth
            }
            ProbeId::GoalState => ProbeCategory::Admission,
        }
    }

    /// Probes skipped entirely on non-NVIDIA nodes
    pub fn requires_accelerator(&self) -> bool {
        matches!(
            self,
            ProbeId::FabricDevinfo
                | ProbeId::AcceleratorSanity
                | ProbeId::DriverFaults
                | ProbeId::DiagFast
                | ProbeId::BurnIn
                | ProbeId::DiagFull
                | ProbeId::HostDeviceBandwidth
                | ProbeId::InterNodeBandwidth
        )
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem a probe inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeCategory {
    Accelerator,
    Kernel,
    Network,
    Storage,
    Pci,
    System,
    Maintenance,
    Bandwidth,
    Admission,
}

/// Everything a probe may use while running
#[derive(Clone)]
pub struct ProbeContext {
    pub profile: Arc<ClusterProfile>,
    pub exec: Arc<dyn CommandRunner>,
    pub cluster: Arc<dyn ClusterDirectory>,
    pub settings: Arc<ProbeSettings>,
}

impl ProbeContext {
    pub fn new(
        profile: Arc<ClusterProfile>,
        exec: Arc<dyn CommandRunner>,
        cluster: Arc<dyn ClusterDirectory>,
        settings: Arc<ProbeSettings>,
    ) -> Self {
        Self {
            profile,
            exec,
            cluster,
            settings,
        }
    }

    /// Run a command with the default timeout
    pub async fn run(&self, command: &str) -> Result<CommandOutput, ExecError> {
        self.run_with(command, self.default_options()).await
    }

    /// Run a command with sudo and the default timeout
    pub async fn run_elevated(&self, command: &str) -> Result<CommandOutput, ExecError> {
        self.run_with(command, self.default_options().elevated())
            .await
    }

    pub async fn run_with(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandOutput, ExecError> {
        self.exec.run(command, &opts).await
    }

    pub fn default_options(&self) -> ExecOptions {
        ExecOptions::new().timeout(self.settings.command_timeout)
    }
}

/// A single diagnostic
#[async_trait]
pub trait Probe: Send + Sync {
    fn id(&self) -> ProbeId;

    /// Whether the probe has anything to check on this node
    fn applies_to(&self, _profile: &ClusterProfile, _settings: &ProbeSettings) -> bool {
        true
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError>;
}

/// Probes keyed by id
pub struct ProbeRegistry {
    probes: HashMap<ProbeId, Arc<dyn Probe>>,
}

impl ProbeRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            probes: HashMap::new(),
        }
    }

    /// The production probe set
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register(SerialDenylistProbe)
            .register(InterfaceProbe)
            .register(PciTopologyProbe)
            .register(StorageProbe)
            .register(ControlPlaneProbe)
            .register(FabricDevinfoProbe)
            .register(AcceleratorProbe)
            .register(DriverFaultProbe)
            .register(DiskUsageProbe)
            .register(CpuLoadProbe)
            .register(MaintenanceProbe)
            .register(DiagProbe::fast())
            .register(FabricReachabilityProbe)
            .register(BurnInProbe)
            .register(DiagProbe::full())
            .register(HostDeviceBandwidthProbe)
            .register(CollectiveBandwidthProbe)
            .register(GoalStateProbe);
        registry
    }

    /// Add a probe, replacing any probe with the same id
    pub fn register<P: Probe + 'static>(&mut self, probe: P) -> &mut Self {
        self.probes.insert(probe.id(), Arc::new(probe));
        self
    }

    pub fn get(&self, id: ProbeId) -> Option<&Arc<dyn Probe>> {
        self.probes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Registered probes in the given category
    pub fn by_category(&self, category: ProbeCategory) -> Vec<ProbeId> {
        ProbeId::ALL
            .iter()
            .copied()
            .filter(|id| id.category() == category && self.probes.contains_key(id))
            .collect()
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capitalize the first letter and lowercase the rest, for reason codes
pub(crate) fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}
