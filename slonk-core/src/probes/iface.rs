//! Network interface addressing
//!
//! Every `eth*` adapter must carry exactly one IPv4 address. A missing address
//! is often fixed by bouncing the link, so the check toggles and re-checks
//! before giving up. Extra addresses fail straight away.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::retry::{retry_if, Attempt, RetryPolicy};

const MISSING_REASON: &str = "IfaceCheckFailure";
const EXTRA_REASON: &str = "IfaceCheckExtraAddress";

pub struct InterfaceProbe;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Adapter {
    name: String,
    ipv4_count: usize,
}

/// Physical adapters in `ifconfig` output
fn parse_ifconfig(output: &str) -> Vec<Adapter> {
    let mut adapters: Vec<Adapter> = Vec::new();
    let mut in_eth = false;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            let name = line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .trim_end_matches(':');
            in_eth = name.starts_with("eth");
            if in_eth {
                adapters.push(Adapter {
                    name: name.to_string(),
                    ipv4_count: 0,
                });
            }
        } else if in_eth && line.trim_start().starts_with("inet ") {
            if let Some(adapter) = adapters.last_mut() {
                adapter.ipv4_count += 1;
            }
        }
    }
    adapters
}

impl InterfaceProbe {
    async fn toggle_link(&self, ctx: &ProbeContext, adapter: &str) -> Result<(), ProbeError> {
        let settings = &ctx.settings.interface;
        ctx.run_elevated(&format!("ip link set {} down", adapter))
            .await?;
        tokio::time::sleep(settings.link_down_wait).await;
        ctx.run_elevated(&format!("ip link set {} up", adapter))
            .await?;
        tokio::time::sleep(settings.link_up_wait).await;
        Ok(())
    }

    async fn attempt(&self, ctx: &ProbeContext, attempt: Attempt) -> Result<(), ProbeError> {
        info!(attempt = attempt.number, total = attempt.total, "Starting interface check");
        let output = ctx.run("ifconfig").await?;
        let adapters = parse_ifconfig(&output.stdout);

        if let Some(adapter) = adapters.iter().find(|a| a.ipv4_count > 1) {
            let msg = format!(
                "Expected one ipv4 address on {}, found {}",
                adapter.name, adapter.ipv4_count
            );
            error!("{}", msg);
            return Err(CheckError::manual("IfaceCheck", EXTRA_REASON, msg).into());
        }

        let missing = match adapters.iter().find(|a| a.ipv4_count == 0) {
            None => return Ok(()),
            Some(adapter) => adapter.name.clone(),
        };

        if attempt.is_last() {
            let msg = format!("Missing ipv4 address on {}", missing);
            error!("{}", msg);
            return Err(CheckError::manual("IfaceCheck", MISSING_REASON, msg).into());
        }

        warn!(adapter = %missing, "Missing ipv4 address, toggling link");
        self.toggle_link(ctx, &missing).await?;
        Err(CheckError::manual(
            "IfaceCheck",
            MISSING_REASON,
            format!("Missing ipv4 address on {}", missing),
        )
        .into())
    }
}

#[async_trait]
impl Probe for InterfaceProbe {
    fn id(&self) -> ProbeId {
        ProbeId::Interface
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let policy = RetryPolicy::new(ctx.settings.interface.toggle_attempts, Duration::ZERO);
        retry_if(
            policy,
            |attempt| self.attempt(ctx, attempt),
            |err| matches!(err, ProbeError::Check(e) if e.reason() == MISSING_REASON),
        )
        .await?;

        info!("Interface checks pass");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockResponse;
    use crate::probes::testing::harness;

    const HEALTHY: &str = "\
eth0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1460
        inet 10.0.1.201  netmask 255.255.255.255  broadcast 0.0.0.0
        ether 42:01:0a:00:01:c9  txqueuelen 1000  (Ethernet)

eth1: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 8244
        inet 10.128.1.194  netmask 255.255.255.255  broadcast 0.0.0.0

lo: flags=73<UP,LOOPBACK,RUNNING>  mtu 65536
        inet 127.0.0.1  netmask 255.0.0.0
";

    const MISSING: &str = "\
eth0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1460
        inet 10.0.1.201  netmask 255.255.255.255  broadcast 0.0.0.0

eth1: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 8244
        ether 42:01:0a:80:01:c2  txqueuelen 1000  (Ethernet)
";

    #[test]
    fn test_parse_ifconfig() {
        let adapters = parse_ifconfig(HEALTHY);
        assert_eq!(adapters.len(), 2);
        assert!(adapters.iter().all(|a| a.ipv4_count == 1));

        let adapters = parse_ifconfig(MISSING);
        assert_eq!(
            adapters[1],
            Adapter {
                name: "eth1".into(),
                ipv4_count: 0
            }
        );
    }

    #[tokio::test]
    async fn test_toggle_fixes_address() {
        let h = harness("cluster1");
        h.exec.on_sequence(
            "ifconfig",
            vec![MockResponse::stdout(MISSING), MockResponse::stdout(HEALTHY)],
        );
        h.exec.on("ip link set", MockResponse::stdout(""));

        assert!(InterfaceProbe.run(&h.ctx).await.is_ok());
        assert_eq!(h.exec.call_count("ip link set eth1 down"), 1);
        assert_eq!(h.exec.call_count("ip link set eth1 up"), 1);
    }

    #[tokio::test]
    async fn test_fails_only_on_last_attempt() {
        let h = harness("cluster1");
        h.exec.on("ifconfig", MockResponse::stdout(MISSING));
        h.exec.on("ip link set", MockResponse::stdout(""));

        let err = InterfaceProbe.run(&h.ctx).await.unwrap_err();
        assert!(matches!(err, ProbeError::Check(CheckError::Manual(_))));
        assert_eq!(h.exec.call_count("ifconfig"), 5);
        // no toggle on the final attempt
        assert_eq!(h.exec.call_count("down"), 4);
    }

    const TWO_ADDRESSES: &str = "\
eth0: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 1460
        inet 10.0.1.201  netmask 255.255.255.255  broadcast 0.0.0.0
        inet 10.0.1.202  netmask 255.255.255.255  broadcast 0.0.0.0

eth1: flags=4163<UP,BROADCAST,RUNNING,MULTICAST>  mtu 8244
        inet 10.128.1.194  netmask 255.255.255.255  broadcast 0.0.0.0
";

    #[tokio::test]
    async fn test_extra_address_fails_without_toggling() {
        assert_eq!(parse_ifconfig(TWO_ADDRESSES)[0].ipv4_count, 2);

        let h = harness("cluster1");
        h.exec.on("ifconfig", MockResponse::stdout(TWO_ADDRESSES));
        h.exec.on("ip link set", MockResponse::stdout(""));

        match InterfaceProbe.run(&h.ctx).await {
            Err(ProbeError::Check(e)) => {
                assert_eq!(e.kind(), crate::error::CheckKind::Manual);
                assert_eq!(e.reason(), "IfaceCheckExtraAddress");
                assert!(e.condition().message.contains("eth0"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.exec.call_count("ifconfig"), 1);
        assert_eq!(h.exec.call_count("ip link set"), 0);
    }
}
