//! CPU load average
//!
//! High load is only logged. Busy nodes are not broken nodes, so this probe
//! never raises a classified failure.

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::ProbeError;

pub struct CpuLoadProbe;

/// Highest of the 1, 5 and 15 minute load averages in `uptime` output
fn max_load(uptime: &str) -> Option<f64> {
    let (_, averages) = uptime.rsplit_once("load average:")?;
    averages
        .split(',')
        .map(|v| v.trim().parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?
        .into_iter()
        .reduce(f64::max)
}

#[async_trait]
impl Probe for CpuLoadProbe {
    fn id(&self) -> ProbeId {
        ProbeId::CpuLoad
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let output = ctx.run("uptime").await?;
        let uptime = output.stdout.trim();
        let load = max_load(uptime)
            .ok_or_else(|| anyhow!("unparseable uptime output: {}", uptime))?;

        if load > ctx.settings.cpu.max_load {
            warn!(load, threshold = ctx.settings.cpu.max_load, "CPU load is high: {}", uptime);
        } else {
            debug!(load, "CPU load");
        }
        Ok(())
    }
}
