//! Host to device bandwidth
//!
//! Measures copy bandwidth in both directions for every visible GPU, pinned to
//! the NUMA node the GPU hangs off. Low readings are logged only: the test
//! gives too many false positives to act on.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::ProbeError;
use crate::profile::{AcceleratorFamily, ClusterProfile, TopologyTier};
use crate::settings::installed;

/// Transfer size whose result line is inspected
const MEASURED_SIZE: &str = "32000000";

pub struct HostDeviceBandwidthProbe;

/// NUMA lane per GPU index and the minimum acceptable GB/s
#[derive(Debug, Clone, PartialEq)]
struct LaneLayout {
    lanes: [u32; 8],
    threshold: f64,
}

fn layout(profile: &ClusterProfile) -> Option<LaneLayout> {
    match (profile.accelerator, profile.topology) {
        (AcceleratorFamily::A100, _) => Some(LaneLayout {
            lanes: [1, 1, 0, 0, 3, 3, 2, 2],
            threshold: 23.0,
        }),
        (AcceleratorFamily::H100, Some(TopologyTier::Pcie5)) => Some(LaneLayout {
            lanes: [1, 1, 1, 1, 0, 0, 0, 0],
            threshold: 53.0,
        }),
        (AcceleratorFamily::H100, Some(TopologyTier::Pcie4)) => Some(LaneLayout {
            lanes: [1, 1, 1, 1, 0, 0, 0, 0],
            threshold: 26.0,
        }),
        _ => None,
    }
}

fn parse_bandwidth(output: &str) -> Option<f64> {
    output
        .lines()
        .filter(|l| l.contains(MEASURED_SIZE))
        .find_map(|l| l.split_whitespace().nth(1)?.parse().ok())
}

#[async_trait]
impl Probe for HostDeviceBandwidthProbe {
    fn id(&self) -> ProbeId {
        ProbeId::HostDeviceBandwidth
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        if !ctx.profile.gpus_present {
            info!("Skipping htod because no GPUs exist");
            return Ok(());
        }
        let settings = &ctx.settings.bandwidth;
        if !installed(&settings.htod_binary) {
            info!("bandwidthtest not installed, skipping");
            return Ok(());
        }
        let layout = layout(&ctx.profile).ok_or_else(|| {
            anyhow!(
                "unknown hardware for bandwidth test: {} on {}",
                ctx.profile.accelerator,
                ctx.profile.cluster_name
            )
        })?;

        debug!("Checking host<->device bandwidth");
        for test in ["dtoh", "htod"] {
            for (device, lane) in layout.lanes.iter().enumerate() {
                if !ctx.profile.devices().contains(&(device as u32)) {
                    continue;
                }
                let command = format!(
                    "numactl -N {lane} -m {lane} {} --device={device} --{test}",
                    settings.htod_binary.display()
                );
                let output = match ctx
                    .run_with(&command, ctx.default_options().timeout(settings.timeout))
                    .await
                {
                    Ok(output) => output,
                    Err(e) if e.is_timeout() => {
                        warn!(device, test, "Bandwidth test timed out");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let measured = parse_bandwidth(&output.stdout)
                    .with_context(|| format!("no {} result for gpu {}", test, device))?;
                debug!(device, test, measured, "Measured memory bandwidth");
                if measured < layout.threshold {
                    error!(
                        device,
                        "Memory {} bandwidth measured {} < {}", test, measured, layout.threshold
                    );
                }
            }
        }

        info!("host<->device checks pass");
        Ok(())
    }
}
