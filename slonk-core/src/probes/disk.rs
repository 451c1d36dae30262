//! Local disk usage

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};

/// Flags nodes running out of space on tracked mounts
pub struct DiskUsageProbe;

/// (mount, used percent) pairs from `df -h`
fn parse_df(output: &str) -> Vec<(String, u32)> {
    output
        .lines()
        .filter(|line| !line.starts_with("Filesystem"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            let used = fields[4].trim_end_matches('%').parse().ok()?;
            Some((fields[5].to_string(), used))
        })
        .collect()
}

#[async_trait]
impl Probe for DiskUsageProbe {
    fn id(&self) -> ProbeId {
        ProbeId::DiskUsage
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let settings = &ctx.settings.disk;
        let output = ctx.run("df -h").await?;

        for (mount, used) in parse_df(&output.stdout) {
            if !settings.mounts.contains(&mount) {
                continue;
            }
            debug!(mount = %mount, used, "Disk usage");
            if used > settings.max_used_percent {
                return Err(CheckError::manual(
                    "DiskCheck",
                    "DiskAlmostFull",
                    format!("Almost out of space on mount {}", mount),
                )
                .into());
            }
        }

        info!("Disk usage checks pass");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockResponse;
    use crate::probes::testing::harness;

    const DF: &str = "\
Filesystem      Size  Used Avail Use% Mounted on
overlay         2.0T  1.2T  800G  61% /
tmpfs            64M     0   64M   0% /dev
/dev/nvme0n1    7.0T  6.8T  200G  97% /mnt/localdisk
/dev/sdb        1.0T  990G   10G  99% /scratch
";

    #[test]
    fn test_parse_df() {
        let parsed = parse_df(DF);
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[0], ("/".to_string(), 61));
        assert_eq!(parsed[2], ("/mnt/localdisk".to_string(), 97));
    }

    #[tokio::test]
    async fn test_full_tracked_mount() {
        let h = harness("cluster1");
        h.exec.on("df -h", MockResponse::stdout(DF));
        let err = DiskUsageProbe.run(&h.ctx).await.unwrap_err();
        match err {
            ProbeError::Check(CheckError::Manual(c)) => {
                assert_eq!(c.reason, "DiskAlmostFull");
                assert_eq!(c.message, "Almost out of space on mount /mnt/localdisk");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_untracked_mount_ignored() {
        let h = harness("cluster1");
        h.exec.on(
            "df -h",
            MockResponse::stdout(
                "Filesystem Size Used Avail Use% Mounted on\n/dev/sdb 1T 990G 10G 99% /scratch\noverlay 2T 1T 1T 90% /\n",
            ),
        );
        assert!(DiskUsageProbe.run(&h.ctx).await.is_ok());
    }
}
