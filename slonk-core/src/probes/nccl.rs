//! Single-node collective bandwidth
//!
//! Runs `all_reduce_perf` across all eight GPUs twice: once over NVLink and
//! once in loopback through the network stack (shared memory and P2P
//! disabled). A cluster without a threshold for a run skips it.

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{capitalize, Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::exec::{ExecError, ExecOptions};
use crate::profile::{AcceleratorFamily, ClusterProfile};
use crate::settings::installed;

/// Scheduler variables that make NCCL think it is part of a larger job
const STRIPPED_PREFIXES: [&str; 2] = ["SLURM_", "SRUN_"];

pub struct CollectiveBandwidthProbe;

fn nvlink_threshold(profile: &ClusterProfile) -> Option<f64> {
    match profile.accelerator {
        AcceleratorFamily::A100 => Some(23.0),
        AcceleratorFamily::H100 if profile.is_tcpx() => Some(300.0),
        AcceleratorFamily::H100 => Some(455.0),
        _ => None,
    }
}

fn loopback_threshold(profile: &ClusterProfile) -> Option<f64> {
    match profile.cluster_name.as_str() {
        "cluster-a100" => Some(19.0),
        "cluster1" => Some(43.0),
        _ => None,
    }
}

fn pairs(vars: &[(&str, &str)]) -> Vec<(String, String)> {
    vars.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// NCCL environment for the node's fabric
pub(crate) fn nccl_env(profile: &ClusterProfile) -> Vec<(String, String)> {
    match profile.cluster_name.as_str() {
        "cluster-a100" => pairs(&[
            ("NCCL_TOPO_FILE", "/home/common/ndv4-topo.xml"),
            ("NCCL_IB_PCI_RELAXED_ORDERING", "1"),
            ("UCX_IB_PCI_RELAXED_ORDERING", "1"),
            ("NCCL_SOCKET_IFNAME", "eth0"),
            ("UCX_NET_DEVICES", "eth0"),
            ("CUDA_DEVICE_ORDER", "PCI_BUS_ID"),
            ("OMPI_MCA_COLL_HCOLL_ENABLE", "0"),
            ("UCX_TLS", "tcp"),
            ("NCCL_IGNORE_CPU_AFFINITY", "1"),
        ]),
        "cluster-tcpx" => {
            let mut env = pairs(&[
                ("NCCL_SOCKET_IFNAME", "eth0"),
                (
                    "NCCL_GPUDIRECTTCPX_TX_BINDINGS",
                    "eth1:8-21,112-125;eth2:8-21,112-125;eth3:60-73,164-177;eth4:60-73,164-177",
                ),
                (
                    "NCCL_GPUDIRECTTCPX_RX_BINDINGS",
                    "eth1:22-35,126-139;eth2:22-35,126-139;eth3:74-87,178-191;eth4:74-87,178-191",
                ),
                ("NCCL_GPUDIRECTTCPX_SOCKET_IFNAME", "eth1,eth2,eth3,eth4"),
                ("NCCL_NET_GDR_LEVEL", "PIX"),
                ("NCCL_CROSS_NIC", "0"),
                ("NCCL_ALGO", "RING"),
                ("NCCL_PROTO", "Simple"),
                ("NCCL_DYNAMIC_CHUNK_SIZE", "524288"),
                ("NCCL_GPUDIRECTTCPX_UNIX_CLIENT_PREFIX", "/run/tcpx"),
                ("NCCL_GPUDIRECTTCPX_SCHED_ALG", "KATY"),
                ("NCCL_GPUDIRECTTCPX_PROGRAM_FLOW_STEERING_WAIT_MICROS", "1000000"),
                ("NCCL_NVLS_ENABLE", "0"),
                ("NCCL_DEBUG", "INFO"),
                ("NCCL_DEBUG_SUBSYS", "ENV"),
                ("NCCL_SOCKET_NTHREADS", "1"),
                ("NCCL_NSOCKS_PERTHREAD", "4"),
                ("NCCL_IGNORE_CPU_AFFINITY", "1"),
                ("NCCL_BUFFSIZE", "4194304"),
                ("NCCL_P2P_NET_CHUNKSIZE", "524288"),
                ("NCCL_P2P_PCI_CHUNKSIZE", "524288"),
                ("NCCL_P2P_NVL_CHUNKSIZE", "524288"),
                ("NCCL_MAX_NCHANNELS", "16"),
                ("NCCL_MIN_NCHANNELS", "16"),
            ]);
            let library_path = std::env::var("LD_LIBRARY_PATH").unwrap_or_default();
            env.push((
                "LD_LIBRARY_PATH".to_string(),
                format!("/home/common/tcpx:{}", library_path),
            ));
            env
        }
        "cluster1" => pairs(&[
            (
                "NCCL_IB_HCA",
                "mlx5_0,mlx5_1,mlx5_2,mlx5_5,mlx5_6,mlx5_7,mlx5_8,mlx5_11",
            ),
            ("OMPI_MCA_COLL_HCOLL_ENABLE", "0"),
            ("NCCL_ALGO", "NVLS"),
            ("NCCL_SOCKET_IFNAME", "eth0"),
            ("NCCL_COLLNET_ENABLE", "0"),
            ("LD_PRELOAD", "/home/common/nccl/nccl-2.19.3/libnccl.so.2.19.3"),
            ("NCCL_DEBUG", "WARN"),
        ]),
        _ => Vec::new(),
    }
}

/// Bus bandwidth from the result row for `size`
///
/// The row is the one mentioning the size that is not the `nThread` header;
/// the in-place busbw column is second to last.
fn parse_busbw(output: &str, size: &str) -> Option<f64> {
    let line = output
        .lines()
        .find(|l| l.contains(size) && !l.contains("nThread"))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens.len().checked_sub(2).and_then(|i| tokens[i].parse().ok())
}

impl CollectiveBandwidthProbe {
    async fn run_test(
        &self,
        ctx: &ProbeContext,
        name: &str,
        env: Vec<(String, String)>,
        threshold: Option<f64>,
    ) -> Result<(), ProbeError> {
        let Some(threshold) = threshold else {
            info!(test = name, "Skipping nccl test because no threshold is set");
            return Ok(());
        };
        let settings = &ctx.settings.bandwidth;
        let goal = settings.nccl_message_bytes.to_string();
        let command = format!(
            "{} -g 8 -b {goal} -e {goal}",
            settings.nccl_binary.display()
        );

        let mut opts: ExecOptions = ctx.default_options().timeout(settings.timeout);
        for prefix in STRIPPED_PREFIXES {
            opts = opts.strip_env_prefix(prefix);
        }
        debug!(test = name, env = ?env, "NCCL env");
        for (key, value) in env {
            opts = opts.env(key, value);
        }

        info!(test = name, "Starting nccl test");
        let output = match ctx.run_with(&command, opts).await {
            Ok(output) => output,
            Err(err @ ExecError::NonZeroExit { .. }) => {
                let msg = format!("{} nccl test failed: {}", name, err.output());
                error!("{}", msg);
                return Err(CheckError::manual("NCCLCheck", "NCCLCheckFailure", msg).into());
            }
            Err(e) if e.is_timeout() => {
                warn!(test = name, "nccl test timed out");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(measured) = parse_busbw(&output.stdout, &goal) else {
            warn!(test = name, "No result line in nccl output");
            return Ok(());
        };
        info!(test = name, measured, "Measured speed GB/s");
        if measured < threshold {
            let msg = format!(
                "Measured {} speed {} GB/s < {}",
                name, measured, threshold
            );
            error!("{}", msg);
            return Err(CheckError::manual(
                "NCCLCheck",
                format!("NCCLCheck{}Failure", capitalize(name)),
                msg,
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Probe for CollectiveBandwidthProbe {
    fn id(&self) -> ProbeId {
        ProbeId::InterNodeBandwidth
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        if !installed(&ctx.settings.bandwidth.nccl_binary) {
            info!("Skipping nccl tests, binary not installed");
            return Ok(());
        }
        if !ctx.profile.gpus_present {
            info!("Skipping nccl tests because no GPUs exist");
            return Ok(());
        }

        let nvlink = nvlink_threshold(&ctx.profile).ok_or_else(|| {
            anyhow!("no NVLink threshold for cluster {}", ctx.profile.cluster_name)
        })?;
        self.run_test(ctx, "NVLink", nccl_env(&ctx.profile), Some(nvlink))
            .await?;

        let mut loopback_env = nccl_env(&ctx.profile);
        loopback_env.push(("NCCL_SHM_DISABLE".to_string(), "1".to_string()));
        loopback_env.push(("NCCL_P2P_DISABLE".to_string(), "1".to_string()));
        self.run_test(ctx, "loopback", loopback_env, loopback_threshold(&ctx.profile))
            .await?;

        info!("NCCL tests pass");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockResponse;
    use crate::probes::testing::{harness_with, profile, Harness};
    use crate::settings::ProbeSettings;

    fn output(busbw: f64) -> String {
        format!(
            "#       size         count      type   redop    root     time   algbw   busbw #wrong\n\
             # nThread 1 nGpus 8 minBytes 2147483648 maxBytes 2147483648\n\
             2147483648     536870912     float     sum      -1   9000.1  238.61  417.56      0   9001.2  238.58  {busbw}      0\n"
        )
    }

    fn harness_for(cluster: &str) -> (tempfile::NamedTempFile, Harness) {
        let binary = tempfile::NamedTempFile::new().unwrap();
        let mut settings = ProbeSettings::without_waits();
        settings.bandwidth.nccl_binary = binary.path().to_path_buf();
        (binary, harness_with(profile(cluster), settings))
    }

    #[test]
    fn test_parse_busbw() {
        assert_eq!(parse_busbw(&output(460.5), "2147483648"), Some(460.5));
        assert_eq!(parse_busbw("", "2147483648"), None);
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(nvlink_threshold(&profile("cluster-tcpx")), Some(300.0));
        assert_eq!(nvlink_threshold(&profile("cluster2")), Some(455.0));
        assert_eq!(loopback_threshold(&profile("cluster1")), Some(43.0));
        assert_eq!(loopback_threshold(&profile("cluster-tcpx")), None);
    }

    #[tokio::test]
    async fn test_nvlink_below_threshold() {
        let (_bin, h) = harness_for("cluster2");
        h.exec.on("-g 8", MockResponse::stdout(output(300.0)));
        match CollectiveBandwidthProbe.run(&h.ctx).await {
            Err(ProbeError::Check(e)) => assert_eq!(e.reason(), "NCCLCheckNvlinkFailure"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_loopback_skipped_without_threshold() {
        let (_bin, h) = harness_for("cluster2");
        h.exec.on("-g 8", MockResponse::stdout(output(460.0)));
        assert!(CollectiveBandwidthProbe.run(&h.ctx).await.is_ok());
        assert_eq!(h.exec.call_count("-g 8"), 1);
    }

    #[tokio::test]
    async fn test_both_runs_on_cluster1() {
        let (_bin, h) = harness_for("cluster1");
        h.exec.on_sequence(
            "-g 8",
            vec![
                MockResponse::stdout(output(460.0)),
                MockResponse::stdout(output(40.0)),
            ],
        );
        match CollectiveBandwidthProbe.run(&h.ctx).await {
            Err(ProbeError::Check(e)) => assert_eq!(e.reason(), "NCCLCheckLoopbackFailure"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.exec.call_count("-g 8"), 2);
    }

    #[tokio::test]
    async fn test_command_failure_is_manual() {
        let (_bin, h) = harness_for("cluster1");
        h.exec.on("-g 8", MockResponse::fail(1, "NCCL WARN Net : Connect failed"));
        match CollectiveBandwidthProbe.run(&h.ctx).await {
            Err(ProbeError::Check(e)) => assert_eq!(e.reason(), "NCCLCheckFailure"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
