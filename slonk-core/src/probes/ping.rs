//! Fabric reachability
//!
//! Pings a random sample of placement-group peers on each data-path adapter.
//! Not knowing who the peers are is a soft failure: it is logged and the probe
//! passes.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use super::{Probe, ProbeContext, ProbeId};
use crate::cluster::PeerNode;
use crate::error::{CheckError, ProbeError};
use crate::profile::ClusterProfile;
use crate::settings::ProbeSettings;

pub struct FabricReachabilityProbe;

fn sample(peers: &[PeerNode], size: usize) -> Vec<PeerNode> {
    peers
        .choose_multiple(&mut rand::thread_rng(), size)
        .cloned()
        .collect()
}

impl FabricReachabilityProbe {
    async fn peers(&self, ctx: &ProbeContext) -> Option<Vec<PeerNode>> {
        match ctx.cluster.placement_peers(&ctx.profile.node_name).await {
            Ok(Some(peers)) if !peers.is_empty() => {
                info!(count = peers.len(), "Found nodes in placement group");
                Some(peers)
            }
            Ok(_) => {
                warn!("Ping test skipped: could not find placement group peers");
                None
            }
            Err(e) => {
                warn!(error = %e, "Ping test skipped: placement group lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl Probe for FabricReachabilityProbe {
    fn id(&self) -> ProbeId {
        ProbeId::FabricReachability
    }

    fn applies_to(&self, profile: &ClusterProfile, _settings: &ProbeSettings) -> bool {
        profile.is_tcpx()
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        info!("Performing ping checks");
        let settings = &ctx.settings.fabric;
        let Some(peers) = self.peers(ctx).await else {
            return Ok(());
        };
        let timeout = settings.ping_timeout.as_secs_f64();

        for adapter in &settings.adapters {
            let subset = sample(&peers, settings.sample_size);
            let total = subset.len();
            let mut fails = 0usize;

            for peer in &subset {
                let Some(ip) = peer.adapters.get(adapter) else {
                    warn!(adapter = %adapter, node = %peer.name, "Ping test skipped: adapter address unknown");
                    return Ok(());
                };
                if let Err(e) = ctx.run(&format!("ping -c 1 -W {} {}", timeout, ip)).await {
                    fails += 1;
                    debug!(adapter = %adapter, node = %peer.name, error = %e, "Ping failed");
                }

                let fail_rate = fails as f64 / total as f64;
                if fail_rate > settings.failure_threshold {
                    let msg = format!(
                        "Ping test failed on {}, fail rate {:.1}%",
                        adapter,
                        fail_rate * 100.0
                    );
                    error!("{}", msg);
                    return Err(CheckError::power_cycle(
                        "RandomPingCheck",
                        "RandomPingCheckFailure",
                        msg,
                    )
                    .into());
                }
            }
        }

        info!("Ping check passes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CheckKind;
    use crate::exec::MockResponse;
    use crate::probes::testing::harness;

    fn peer(i: usize) -> PeerNode {
        PeerNode {
            name: format!("cluster-tcpx-node-{}", i + 10),
            adapters: (1..=4)
                .map(|eth| (format!("eth{}", eth), format!("10.{}.0.{}", 120 + eth, i)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_all_reachable() {
        let h = harness("cluster-tcpx");
        h.cluster.set_peers((0..20).map(peer).collect());
        h.exec.on("ping -c 1", MockResponse::stdout("1 received"));

        assert!(FabricReachabilityProbe.run(&h.ctx).await.is_ok());
        assert_eq!(h.exec.call_count("ping -c 1 -W 0.1"), 40);
    }

    #[tokio::test]
    async fn test_majority_unreachable_power_cycles() {
        let h = harness("cluster-tcpx");
        h.cluster.set_peers((0..10).map(peer).collect());
        h.exec.on("ping -c 1", MockResponse::fail(1, "0 received"));

        match FabricReachabilityProbe.run(&h.ctx).await {
            Err(ProbeError::Check(e)) => {
                assert_eq!(e.kind(), CheckKind::PowerCycle);
                assert_eq!(e.reason(), "RandomPingCheckFailure");
            }
            other => panic!("unexpected: {other:?}"),
        }
        // 6 of 10 failures crosses the 50% threshold
        assert_eq!(h.exec.call_count("ping"), 6);
    }

    #[tokio::test]
    async fn test_unknown_peers_is_soft() {
        let h = harness("cluster-tcpx");
        assert!(FabricReachabilityProbe.run(&h.ctx).await.is_ok());

        h.cluster.fail_reads(true);
        assert!(FabricReachabilityProbe.run(&h.ctx).await.is_ok());
        assert!(h.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_adapter_is_soft() {
        let h = harness("cluster-tcpx");
        h.cluster.set_peers(vec![PeerNode {
            name: "cluster-tcpx-node-2".into(),
            adapters: Default::default(),
        }]);
        assert!(FabricReachabilityProbe.run(&h.ctx).await.is_ok());
    }
}
