//! Chassis serial number denylist

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::profile::ClusterProfile;
use crate::settings::ProbeSettings;

/// Flags chassis known to be bad
pub struct SerialDenylistProbe;

#[async_trait]
impl Probe for SerialDenylistProbe {
    fn id(&self) -> ProbeId {
        ProbeId::SerialDenylist
    }

    fn applies_to(&self, _profile: &ClusterProfile, settings: &ProbeSettings) -> bool {
        !settings.serial.denylist.is_empty()
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let output = ctx
            .run_elevated("dmidecode -s system-serial-number")
            .await?;
        let serial = output.stdout.trim();
        debug!(serial = %serial, "Chassis serial number");

        if ctx.settings.serial.denylist.iter().any(|s| s == serial) {
            let msg = format!("Found banned serial number {}", serial);
            error!("{}", msg);
            return Err(CheckError::manual(
                "SerialCheck",
                "SerialCheckFoundBannedSerialNumber",
                msg,
            )
            .into());
        }

        info!("Serial number check passes");
        Ok(())
    }
}
