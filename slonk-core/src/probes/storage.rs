//! Shared storage reachability
//!
//! Checks the shared home mount exists, the storage cluster answers pings and
//! the blob endpoint answers HTTP.

use async_trait::async_trait;
use tracing::{error, info};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::profile::ClusterProfile;
use crate::settings::ProbeSettings;

pub struct StorageProbe;

impl StorageProbe {
    fn check_mount(&self, ctx: &ProbeContext) -> Result<(), CheckError> {
        let mount = &ctx.settings.storage.home_mount;
        if !mount.exists() {
            let msg = format!("Missing mount {}", mount.display());
            error!("{}", msg);
            return Err(CheckError::manual(
                "WekaMountCheck",
                "WekaMountCheckMissing",
                msg,
            ));
        }
        Ok(())
    }

    async fn check_ping(&self, ctx: &ProbeContext) -> Result<(), CheckError> {
        let settings = &ctx.settings.storage;
        let timeout = settings.ping_timeout.as_secs().max(1);
        for ip in settings.ceph_ips.iter().chain(settings.weka_ip.iter()) {
            if let Err(e) = ctx.run(&format!("ping -c 1 -W {} {}", timeout, ip)).await {
                let msg = format!("Unable to ping storage host {}: {}", ip, e);
                error!("{}", msg);
                return Err(CheckError::manual("WekaPingCheck", "WekaPingCheckError", msg));
            }
        }
        Ok(())
    }

    async fn check_blob(&self, ctx: &ProbeContext) -> Result<(), CheckError> {
        let Some(endpoint) = ctx.settings.storage.blob_endpoint.as_deref() else {
            return Ok(());
        };
        let command = format!("curl -sS -I --max-time 5 http://{}:80/", endpoint);
        if let Err(e) = ctx.run(&command).await {
            let msg = format!("Unable to reach blob endpoint {}: {}", endpoint, e);
            error!("{}", msg);
            return Err(CheckError::manual("WekaBlobCheck", "WekaBlobCheckError", msg));
        }
        Ok(())
    }
}

#[async_trait]
impl Probe for StorageProbe {
    fn id(&self) -> ProbeId {
        ProbeId::Storage
    }

    fn applies_to(&self, profile: &ClusterProfile, settings: &ProbeSettings) -> bool {
        settings.storage.clusters.contains(&profile.cluster_name)
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        self.check_mount(ctx)?;
        self.check_ping(ctx).await?;
        self.check_blob(ctx).await?;
        info!("Storage checks pass");
        Ok(())
    }
}
