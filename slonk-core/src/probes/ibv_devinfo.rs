//! InfiniBand port state
//!
//! Inactive ports are logged at error level for operators but do not fail the
//! run; flapping links recover on their own too often to act on.

use async_trait::async_trait;
use tracing::{error, info};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::ProbeError;
use crate::profile::ClusterProfile;
use crate::settings::ProbeSettings;

pub struct FabricDevinfoProbe;

/// Port states reported by `ibv_devinfo`
fn port_states(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("state:"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Probe for FabricDevinfoProbe {
    fn id(&self) -> ProbeId {
        ProbeId::FabricDevinfo
    }

    fn applies_to(&self, profile: &ClusterProfile, settings: &ProbeSettings) -> bool {
        settings
            .fabric
            .infiniband_devices
            .contains_key(&profile.cluster_name)
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let devices = ctx
            .settings
            .fabric
            .infiniband_devices
            .get(&ctx.profile.cluster_name)
            .cloned()
            .unwrap_or_default();

        info!(count = devices.len(), "Checking ibv_devinfo");
        for device in devices {
            let output = ctx.run(&format!("ibv_devinfo -d {}", device)).await?;
            for state in port_states(&output.stdout) {
                if state != "PORT_ACTIVE" {
                    error!(device = %device, state = %state, "Invalid port state");
                }
            }
        }
        Ok(())
    }
}
