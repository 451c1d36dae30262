//! Accelerator sanity via nvidia-smi
//!
//! Checks, in order:
//! 1. plain `nvidia-smi` works at all
//! 2. per GPU: reset not required, no pending or failed row remaps, MIG off,
//!    ECC on and error counters under threshold
//! 3. the expected number of GPUs is visible
//! 4. idle framebuffer usage is below the cluster threshold, retried to give
//!    exiting jobs time to release memory

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::exec::ExecError;
use crate::retry::{retry_if, Attempt, RetryPolicy};

const STATUS_FIELDS: &str = "index,mig.mode.current,ecc.mode.current,\
ecc.errors.corrected.volatile.total,ecc.errors.uncorrected.volatile.total";
const REMAP_FIELDS: &str = "gpu_bus_id,remapped_rows.pending,remapped_rows.failure";
const MEMORY_FIELDS: &str = "index,memory.used";

pub struct AcceleratorProbe;

#[derive(Debug, Clone, PartialEq, Eq)]
struct GpuStatus {
    index: u32,
    mig_mode: String,
    ecc_mode: String,
    correctable: Option<u64>,
    uncorrectable: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RemapStatus {
    requires_reset: bool,
    pending: bool,
    failure: bool,
}

fn csv_fields(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

fn flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "yes" | "1" | "true")
}

fn parse_status(output: &str) -> anyhow::Result<Vec<GpuStatus>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields = csv_fields(line);
            if fields.len() < 5 {
                return Err(anyhow!("short nvidia-smi status line: {}", line));
            }
            Ok(GpuStatus {
                index: fields[0]
                    .parse()
                    .with_context(|| format!("bad GPU index in: {}", line))?,
                mig_mode: fields[1].to_string(),
                ecc_mode: fields[2].to_string(),
                correctable: fields[3].parse().ok(),
                uncorrectable: fields[4].parse().ok(),
            })
        })
        .collect()
}

fn parse_remaps(output: &str) -> Vec<RemapStatus> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields = csv_fields(line);
            RemapStatus {
                requires_reset: line.to_ascii_lowercase().contains("requires reset"),
                pending: fields.get(1).map_or(false, |v| flag(v)),
                failure: fields.get(2).map_or(false, |v| flag(v)),
            }
        })
        .collect()
}

/// (GPU index, MiB used) pairs
fn parse_memory(output: &str) -> anyhow::Result<Vec<(u32, u64)>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields = csv_fields(line);
            match fields.as_slice() {
                [index, used, ..] => Ok((
                    index.parse().with_context(|| format!("bad index: {}", line))?,
                    used.parse().with_context(|| format!("bad memory: {}", line))?,
                )),
                _ => Err(anyhow!("short nvidia-smi memory line: {}", line)),
            }
        })
        .collect()
}

fn check_gpu(
    gpu: &GpuStatus,
    remap: &RemapStatus,
    max_correctable: u64,
    max_uncorrectable: u64,
) -> Result<(), CheckError> {
    debug!(gpu = gpu.index, "Checking GPU");

    if remap.requires_reset {
        return Err(CheckError::power_cycle(
            "NvidiaSMIPlainCheck",
            "NvidiaSMIGpuRequiresResetFailure",
            format!("GPU Requires Reset on gpu {}", gpu.index),
        ));
    }
    if remap.pending {
        let msg = format!("Row remap pending on gpu {}", gpu.index);
        error!("{}", msg);
        return Err(CheckError::power_cycle(
            "NvidiaSMIRowRemapCheck",
            "NvidiaSMIRowRemapPending",
            msg,
        ));
    }
    if remap.failure {
        let msg = format!("Row remap FAILED on gpu {}. RMA!", gpu.index);
        error!("{}", msg);
        return Err(CheckError::rma(
            "NvidiaSMIRowRemapCheck",
            "NvidiaSMIRowRemapFailed",
            msg,
        ));
    }
    if gpu.mig_mode != "Disabled" && gpu.mig_mode != "[N/A]" {
        let msg = format!("MIG mode enabled for gpu {}", gpu.index);
        error!("{}", msg);
        return Err(CheckError::manual(
            "NvidiaSMIMIGCheck",
            "NvidiaSMIMIGEnabled",
            msg,
        ));
    }
    if gpu.ecc_mode != "Enabled" {
        let msg = format!("Unexpected ECC mode {} on gpu {}", gpu.ecc_mode, gpu.index);
        error!("{}", msg);
        return Err(CheckError::manual(
            "NvidiaSMIECCCheck",
            "NvidiaSMIECCModeError",
            msg,
        ));
    }
    if let Some(correctable) = gpu.correctable.filter(|c| *c > max_correctable) {
        let msg = format!(
            "Too many DRAM ECC correctables on gpu {} (Got {}, threshold {})",
            gpu.index, correctable, max_correctable
        );
        error!("{}", msg);
        return Err(CheckError::manual(
            "NvidiaSMIECCCheck",
            "NvidiaSMIECCTooManyCorrectables",
            msg,
        ));
    }
    if let Some(uncorrectable) = gpu.uncorrectable.filter(|c| *c > max_uncorrectable) {
        let msg = format!(
            "Too many DRAM ECC uncorrectables on gpu {} (Got {}, threshold {})",
            gpu.index, uncorrectable, max_uncorrectable
        );
        error!("{}", msg);
        return Err(CheckError::power_cycle(
            "NvidiaSMIECCCheck",
            "NvidiaSMIECCTooManyUncorrectables",
            msg,
        ));
    }
    Ok(())
}

impl AcceleratorProbe {
    fn devices(ctx: &ProbeContext) -> (String, usize) {
        if ctx.profile.devices().is_empty() {
            warn!("Empty CUDA_VISIBLE_DEVICES, querying all GPUs");
            let count = ctx.settings.accelerator.expected_gpu_count;
            let devices = (0..count)
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");
            (devices, count)
        } else {
            (
                ctx.profile.visible_devices_arg(),
                ctx.profile.devices().len(),
            )
        }
    }

    async fn plain(&self, ctx: &ProbeContext, smi: &str) -> Result<String, ProbeError> {
        match ctx.run(smi).await {
            Ok(output) => Ok(output.stdout),
            Err(err @ ExecError::NonZeroExit { .. }) => {
                let output = err.output();
                let msg = format!("nvidia-smi failed: {}", output);
                error!("{}", msg);
                let failure = if output.contains("Unable to determine the device handle") {
                    CheckError::power_cycle(
                        "NvidiaSMIPlainCheck",
                        "NvidiaSMIPlainCheckNoDeviceHandle",
                        msg,
                    )
                } else if output.contains("fell off the bus") {
                    CheckError::power_cycle(
                        "NvidiaSMIPlainCheck",
                        "NvidiaSMIPlainCheckFellOffBus",
                        msg,
                    )
                } else {
                    CheckError::manual("NvidiaSMIPlainCheck", "NvidiaSMIPlainCheckFailure", msg)
                };
                Err(failure.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn idle_memory(
        &self,
        ctx: &ProbeContext,
        smi: &str,
        devices: &str,
        raw: &str,
        attempt: Attempt,
    ) -> Result<(), ProbeError> {
        let threshold = if ctx.profile.is_tcpx() {
            ctx.settings.accelerator.idle_memory_mib_tcpx
        } else {
            ctx.settings.accelerator.idle_memory_mib
        };

        let output = ctx
            .run(&format!(
                "{} --query-gpu={} --format=csv,noheader,nounits -i {}",
                smi, MEMORY_FIELDS, devices
            ))
            .await?;

        for (gpu, used) in parse_memory(&output.stdout)? {
            if used <= threshold {
                continue;
            }
            if attempt.is_last() {
                error!(gpu, used, "Still unexpected memory usage, raising");
            } else {
                warn!(
                    gpu,
                    used,
                    attempt = attempt.number,
                    total = attempt.total,
                    "Found memory on idle GPU"
                );
            }
            return Err(CheckError::pod_restart(
                "NvidiaSMIIdleMemoryCheck",
                "NvidiaSMIIdleMemoryUnexpectedUsage",
                format!(
                    "Unexpected memory usage on GPU {} ({} MiB used). output: {}",
                    gpu, used, raw
                ),
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Probe for AcceleratorProbe {
    fn id(&self) -> ProbeId {
        ProbeId::AcceleratorSanity
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        if !ctx.profile.gpus_present {
            warn!("No GPU device nodes, skipping nvidia-smi checks");
            return Ok(());
        }

        let settings = &ctx.settings.accelerator;
        let smi = settings.nvidia_smi();
        let (devices, expected) = Self::devices(ctx);

        let raw = self.plain(ctx, &smi).await?;

        let status = ctx
            .run(&format!(
                "{} --query-gpu={} --format=csv,noheader,nounits -i {}",
                smi, STATUS_FIELDS, devices
            ))
            .await?;
        let gpus = parse_status(&status.stdout)?;
        let remaps = parse_remaps(
            &ctx.run(&format!(
                "{} --query-remapped-rows={} --format=csv,noheader -i {}",
                smi, REMAP_FIELDS, devices
            ))
            .await?
            .stdout,
        );

        for (i, gpu) in gpus.iter().enumerate() {
            let remap = remaps.get(i).cloned().unwrap_or_default();
            check_gpu(
                gpu,
                &remap,
                settings.max_correctable_ecc,
                settings.max_uncorrectable_ecc,
            )?;
        }

        if gpus.len() != expected {
            return Err(CheckError::power_cycle(
                "NvidiaSMIGPUCountCheck",
                "NvidiaSMIGPUMissing",
                format!("Only has {} gpus!", gpus.len()),
            )
            .into());
        }

        let policy = RetryPolicy::new(settings.idle_memory_attempts, settings.idle_memory_backoff);
        retry_if(
            policy,
            |attempt| self.idle_memory(ctx, &smi, &devices, &raw, attempt),
            |err| matches!(err, ProbeError::Check(_)),
        )
        .await?;

        info!("nvidia-smi checks pass");
        Ok(())
    }
}

/// Shorthand for building healthy `--query-gpu` status output in tests
#[cfg(test)]
pub(crate) fn healthy_status(count: u32) -> String {
    (0..count)
        .map(|i| format!("{}, Disabled, Enabled, 0, 0\n", i))
        .collect()
}

#[cfg(test)]
pub(crate) fn memory_usage(used: &[u64]) -> String {
    used.iter()
        .enumerate()
        .map(|(i, u)| format!("{}, {}\n", i, u))
        .collect()
}

#[cfg(test)]
pub(crate) fn script_healthy(exec: &crate::exec::MockExecutor) {
    use crate::exec::MockResponse;
    exec.on("nvidia-smi", MockResponse::stdout("| NVIDIA-SMI 535.104.05 |"));
    exec.on("--query-gpu=index,mig", MockResponse::stdout(healthy_status(8)));
    exec.on(
        "--query-remapped-rows",
        MockResponse::stdout("00000000:18:00.0, 0, 0\n".repeat(8)),
    );
    exec.on("--query-gpu=index,memory.used", MockResponse::stdout(memory_usage(&[0; 8])));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockResponse;
    use crate::probes::testing::harness;
    use crate::settings::ProbeSettings;

    fn classify(err: ProbeError) -> (crate::error::CheckKind, String) {
        match err {
            ProbeError::Check(c) => (c.kind(), c.reason().to_string()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_healthy() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        assert!(AcceleratorProbe.run(&h.ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_fell_off_bus() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        h.exec.on(
            "nvidia-smi",
            MockResponse::fail(15, "Unable to determine the device handle for GPU0000:18:00.0: GPU has fell off the bus"),
        );
        let (kind, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(kind, crate::error::CheckKind::PowerCycle);
        assert_eq!(reason, "NvidiaSMIPlainCheckNoDeviceHandle");
    }

    #[tokio::test]
    async fn test_row_remap_states() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        h.exec.on(
            "--query-remapped-rows",
            MockResponse::stdout("00000000:18:00.0, 0, 0\n00000000:2a:00.0, 1, 0\n"),
        );
        let (kind, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(kind, crate::error::CheckKind::PowerCycle);
        assert_eq!(reason, "NvidiaSMIRowRemapPending");

        h.exec.on(
            "--query-remapped-rows",
            MockResponse::stdout("00000000:18:00.0, 0, Yes\n"),
        );
        let (kind, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(kind, crate::error::CheckKind::Rma);
        assert_eq!(reason, "NvidiaSMIRowRemapFailed");
    }

    #[tokio::test]
    async fn test_ecc_thresholds() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        h.exec.on(
            "--query-gpu=index,mig",
            MockResponse::stdout("0, Disabled, Enabled, 30000, 0\n"),
        );
        let (kind, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(kind, crate::error::CheckKind::Manual);
        assert_eq!(reason, "NvidiaSMIECCTooManyCorrectables");

        h.exec.on(
            "--query-gpu=index,mig",
            MockResponse::stdout("0, Disabled, Enabled, 3, 1\n"),
        );
        let (kind, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(kind, crate::error::CheckKind::PowerCycle);
        assert_eq!(reason, "NvidiaSMIECCTooManyUncorrectables");

        h.exec.on(
            "--query-gpu=index,mig",
            MockResponse::stdout("0, Disabled, Disabled, [N/A], [N/A]\n"),
        );
        let (_, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(reason, "NvidiaSMIECCModeError");
    }

    #[tokio::test]
    async fn test_mig_enabled() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        h.exec.on(
            "--query-gpu=index,mig",
            MockResponse::stdout("0, Enabled, Enabled, 0, 0\n"),
        );
        let (kind, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(kind, crate::error::CheckKind::Manual);
        assert_eq!(reason, "NvidiaSMIMIGEnabled");
    }

    #[tokio::test]
    async fn test_missing_gpu() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        h.exec.on("--query-gpu=index,mig", MockResponse::stdout(healthy_status(7)));
        let (kind, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(kind, crate::error::CheckKind::PowerCycle);
        assert_eq!(reason, "NvidiaSMIGPUMissing");
    }

    #[tokio::test]
    async fn test_device_selection() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        assert!(AcceleratorProbe.run(&h.ctx).await.is_ok());
        assert_eq!(h.exec.call_count("-i 0,1,2,3,4,5,6,7"), 3);

        let mut profile = crate::probes::testing::profile("cluster1");
        profile.visible_devices = Some(vec![2, 3]);
        let h = crate::probes::testing::harness_with(profile, ProbeSettings::without_waits());
        script_healthy(&h.exec);
        h.exec.on("--query-gpu=index,mig", MockResponse::stdout(healthy_status(2)));
        h.exec.on("--query-gpu=index,memory.used", MockResponse::stdout(memory_usage(&[0; 2])));
        assert!(AcceleratorProbe.run(&h.ctx).await.is_ok());
        assert_eq!(h.exec.call_count("-i 2,3"), 3);

        let mut profile = crate::probes::testing::profile("cluster1");
        profile.visible_devices = Some(vec![]);
        let h = crate::probes::testing::harness_with(profile, ProbeSettings::without_waits());
        script_healthy(&h.exec);
        assert!(AcceleratorProbe.run(&h.ctx).await.is_ok());
        assert_eq!(h.exec.call_count("-i 0,1,2,3,4,5,6,7"), 3);
    }

    #[tokio::test]
    async fn test_idle_memory_escalates_after_all_retries() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        let busy = MockResponse::stdout(memory_usage(&[0, 0, 2048, 0, 0, 0, 0, 0]));
        h.exec.on_sequence(
            "--query-gpu=index,memory.used",
            vec![busy.clone(), busy.clone(), busy],
        );

        let (kind, reason) = classify(AcceleratorProbe.run(&h.ctx).await.unwrap_err());
        assert_eq!(kind, crate::error::CheckKind::PodRestart);
        assert_eq!(reason, "NvidiaSMIIdleMemoryUnexpectedUsage");
        assert_eq!(h.exec.call_count("--query-gpu=index,memory.used"), 3);
    }

    #[tokio::test]
    async fn test_idle_memory_recovers_on_second_attempt() {
        let h = harness("cluster1");
        script_healthy(&h.exec);
        h.exec.on_sequence(
            "--query-gpu=index,memory.used",
            vec![
                MockResponse::stdout(memory_usage(&[0, 0, 2048, 0, 0, 0, 0, 0])),
                MockResponse::stdout(memory_usage(&[0; 8])),
            ],
        );

        assert!(AcceleratorProbe.run(&h.ctx).await.is_ok());
        assert_eq!(h.exec.call_count("--query-gpu=index,memory.used"), 2);
    }

    #[tokio::test]
    async fn test_tcpx_idle_threshold() {
        let h = harness("cluster-tcpx");
        script_healthy(&h.exec);
        h.exec.on(
            "--query-gpu=index,memory.used",
            MockResponse::stdout(memory_usage(&[4616; 8])),
        );
        assert!(AcceleratorProbe.run(&h.ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_skips_without_device_nodes() {
        let mut profile = crate::probes::testing::profile("cluster1");
        profile.gpus_present = false;
        let h = crate::probes::testing::harness_with(profile, ProbeSettings::without_waits());
        assert!(AcceleratorProbe.run(&h.ctx).await.is_ok());
        assert!(h.exec.calls().is_empty());
    }

    #[test]
    fn test_parse_status() {
        let gpus = parse_status("0, Disabled, Enabled, 12, [N/A]\n").unwrap();
        assert_eq!(gpus[0].correctable, Some(12));
        assert_eq!(gpus[0].uncorrectable, None);
        assert!(parse_status("garbage\n").is_err());
    }
}
