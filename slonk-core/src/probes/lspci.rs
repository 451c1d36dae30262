//! PCIe access control services
//!
//! Peer-to-peer GPU traffic needs ACS source validation off on the bridges
//! between GPUs and NICs. A BIOS reset silently turns it back on.

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::profile::ClusterProfile;
use crate::settings::ProbeSettings;

pub struct PciTopologyProbe;

/// First tracked bus with source validation enabled
fn find_acs_violation<'a>(output: &'a str, tracked: &[String]) -> Option<&'a str> {
    let mut device: Option<&str> = None;
    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('\t') {
            device = line.split_whitespace().next();
            continue;
        }
        let Some(bus) = device else { continue };
        if !line.contains("ACSCtl:") || !tracked.iter().any(|t| t == bus) {
            continue;
        }
        if line.contains("SrcValid+") {
            return Some(bus);
        }
        debug!(bus, "ACS source validation disabled");
    }
    None
}

#[async_trait]
impl Probe for PciTopologyProbe {
    fn id(&self) -> ProbeId {
        ProbeId::PciTopology
    }

    fn applies_to(&self, profile: &ClusterProfile, settings: &ProbeSettings) -> bool {
        settings.pci.clusters.contains(&profile.cluster_name)
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let output = ctx.run_elevated("lspci -vvvv").await?;
        if let Some(bus) = find_acs_violation(&output.stdout, &ctx.settings.pci.tracked_buses) {
            let msg = format!("PCI ACS is not set on bus {}", bus);
            error!("{}", msg);
            return Err(CheckError::manual("PCICheck", "PCIACSNotOnBus", msg).into());
        }
        info!("lspci checks pass");
        Ok(())
    }
}
