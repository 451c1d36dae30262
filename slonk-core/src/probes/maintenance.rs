//! Provider scheduled maintenance
//!
//! Reads the instance metadata maintenance-event key. Anything other than
//! `NONE` means the provider is about to migrate or terminate the VM.

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::profile::ClusterProfile;
use crate::settings::ProbeSettings;

pub struct MaintenanceProbe;

/// Split curl output written with `-w '\n%{http_code}'` into (status, body)
fn split_status(output: &str) -> anyhow::Result<(u16, String)> {
    let trimmed = output.trim_end();
    let (body, status) = trimmed
        .rsplit_once('\n')
        .unwrap_or(("", trimmed));
    let status = status
        .trim()
        .parse()
        .map_err(|_| anyhow!("no HTTP status in metadata response: {:?}", output))?;
    Ok((status, body.trim().to_string()))
}

#[async_trait]
impl Probe for MaintenanceProbe {
    fn id(&self) -> ProbeId {
        ProbeId::Maintenance
    }

    fn applies_to(&self, profile: &ClusterProfile, _settings: &ProbeSettings) -> bool {
        profile.is_tcpx()
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let settings = &ctx.settings.maintenance;
        let command = format!(
            "curl -s --max-time {} -w '\\n%{{http_code}}' -H 'Metadata-Flavor: Google' {}",
            settings.timeout.as_secs().max(1),
            settings.metadata_url
        );
        let output = ctx
            .run_with(&command, ctx.default_options().timeout(settings.timeout))
            .await?;

        let (status, body) = split_status(&output.stdout)?;
        if status == 404 {
            warn!("Maintenance metadata key not found, skipping");
            return Ok(());
        }
        if !(200..300).contains(&status) {
            return Err(anyhow!("metadata server returned {}: {}", status, body).into());
        }

        debug!(event = %body, "Maintenance event");
        if body != "NONE" {
            return Err(CheckError::maintenance(
                "GoogleScheduledMaintenanceEvent",
                format!("Node maintenance-event set to {}", body),
            )
            .into());
        }
        info!("No maintenance scheduled");
        Ok(())
    }
}
