//! Control plane reachability

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, error, info};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::profile::ClusterProfile;
use crate::retry::{retry, RetryPolicy};
use crate::settings::ProbeSettings;

fn pick_host(hosts: &[String]) -> String {
    hosts
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_default()
}

/// Pings a random control plane host until one answers
pub struct ControlPlaneProbe;

#[async_trait]
impl Probe for ControlPlaneProbe {
    fn id(&self) -> ProbeId {
        ProbeId::ControlPlane
    }

    fn applies_to(&self, _profile: &ClusterProfile, settings: &ProbeSettings) -> bool {
        settings.control_plane.hosts.iter().any(|h| !h.is_empty())
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let settings = &ctx.settings.control_plane;
        let policy = RetryPolicy::new(settings.attempts, Duration::ZERO);

        let reached = retry(policy, |attempt| async move {
            let host = pick_host(&settings.hosts);
            debug!(host = %host, attempt = attempt.number, "Pinging control plane");
            ctx.run(&format!("ping -c 1 {}", host)).await.map(|_| host)
        })
        .await;

        match reached {
            Ok(host) => {
                info!(host = %host, "Control plane reachable");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Could not reach control plane");
                Err(CheckError::manual(
                    "PingCheck",
                    "PingCheckFailure",
                    "Could not reach control plane",
                )
                .into())
            }
        }
    }
}
