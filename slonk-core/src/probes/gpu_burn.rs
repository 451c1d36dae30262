//! Load-test burn-in with gpu_burn

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, warn};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::exec::ExecError;
use crate::settings::installed;

static GPU_RESULT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"GPU (\d+): (OK|FAULTY)").expect("valid gpu_burn regex"));

/// Indices of devices gpu_burn reported as faulty
fn faulty_gpus(output: &str) -> Vec<u32> {
    GPU_RESULT
        .captures_iter(output)
        .filter(|c| &c[2] == "FAULTY")
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

pub struct BurnInProbe;

#[async_trait]
impl Probe for BurnInProbe {
    fn id(&self) -> ProbeId {
        ProbeId::BurnIn
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let settings = &ctx.settings.burn;
        if !installed(&settings.binary) {
            info!(binary = %settings.binary.display(), "gpu_burn not installed, skipping");
            return Ok(());
        }

        let secs = settings.duration.as_secs();
        let command = format!("{} {}", settings.binary.display(), secs);
        // allow for compilation of the kernels before the timed run
        let timeout = settings.duration * 2 + ctx.settings.command_timeout;

        info!(secs, "Starting gpu_burn");
        let (stdout, failed) = match ctx
            .run_with(&command, ctx.default_options().timeout(timeout))
            .await
        {
            Ok(output) => (output.stdout, None),
            Err(err @ ExecError::NonZeroExit { .. }) => {
                (err.stdout().unwrap_or_default().to_string(), Some(err))
            }
            Err(e) if e.is_timeout() => {
                warn!("gpu_burn timed out");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let faulty = faulty_gpus(&stdout);
        if !faulty.is_empty() {
            let msg = format!("gpu_burn reported faulty GPUs {:?}", faulty);
            error!("{}", msg);
            return Err(CheckError::manual("GpuBurnCheck", "GpuBurnFaultyGpu", msg).into());
        }
        if let Some(err) = failed {
            let msg = format!("gpu_burn failed: {}", err.output());
            error!("{}", msg);
            return Err(CheckError::manual("GpuBurnCheck", "GpuBurnCheckFailure", msg).into());
        }

        info!("gpu_burn passes");
        Ok(())
    }
}
