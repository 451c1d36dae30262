//! DCGM diagnostic suite
//!
//! Level 1 is the quick sanity run used by fast mode, level 2 the medium run
//! used by full mode.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::{capitalize, Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::exec::ExecError;

#[derive(Debug, Deserialize)]
struct DiagReport {
    #[serde(rename = "DCGM GPU Diagnostic")]
    diagnostic: Diagnostic,
}

#[derive(Debug, Deserialize)]
struct Diagnostic {
    test_categories: Vec<TestCategory>,
}

#[derive(Debug, Deserialize)]
struct TestCategory {
    category: String,
    tests: Vec<DiagTest>,
}

#[derive(Debug, Deserialize)]
struct DiagTest {
    name: String,
    results: Vec<serde_json::Value>,
}

/// `dcgmi diag` at a fixed run level
pub struct DiagProbe {
    id: ProbeId,
    level: u8,
}

impl DiagProbe {
    pub fn fast() -> Self {
        Self {
            id: ProbeId::DiagFast,
            level: 1,
        }
    }

    pub fn full() -> Self {
        Self {
            id: ProbeId::DiagFull,
            level: 2,
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    fn nonzero_exit(&self) -> CheckError {
        let msg = format!("dcgmi diag -r {} returned nonzero exit", self.level);
        error!("{}", msg);
        CheckError::manual("DCGMICheck", "DCGMICheckNoneZeroResult", msg)
    }

    fn first_failure(&self, report: &DiagReport) -> Option<CheckError> {
        for category in &report.diagnostic.test_categories {
            for test in &category.tests {
                for result in &test.results {
                    let status = result
                        .get("status")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default();
                    if status.contains("Pass") {
                        continue;
                    }
                    let msg = format!(
                        "Failed dcgmi -r {} test {} - {}: {}",
                        self.level, category.category, test.name, result
                    );
                    error!("{}", msg);
                    return Some(CheckError::manual(
                        "DCGMICheck",
                        format!("DCGMI{}Failure", capitalize(&category.category)),
                        msg,
                    ));
                }
            }
        }
        None
    }
}

#[async_trait]
impl Probe for DiagProbe {
    fn id(&self) -> ProbeId {
        self.id
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        if !ctx.profile.gpus_present {
            info!("No gpus found, skipping dcgmi tests");
            return Ok(());
        }
        let devices = match ctx.profile.visible_devices.as_deref() {
            Some(devices) if !devices.is_empty() => devices,
            _ => {
                info!("Skipping dcgmi, CUDA_VISIBLE_DEVICES not set");
                return Ok(());
            }
        };

        let settings = &ctx.settings.diag;
        let command = format!(
            "{} diag -r {} -j -i {}",
            settings.binary,
            self.level,
            devices
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        info!(level = self.level, "Beginning dcgmi check");

        let (stdout, failed) = match ctx
            .run_with(&command, ctx.default_options().timeout(settings.timeout))
            .await
        {
            Ok(output) => (output.stdout, false),
            Err(ExecError::NonZeroExit { stdout, .. }) => (stdout, true),
            Err(e) if e.is_timeout() => {
                warn!(level = self.level, "dcgmi timed out, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let report: DiagReport = match serde_json::from_str(&stdout) {
            Ok(report) => report,
            Err(_) if failed => {
                return Err(self.nonzero_exit().into());
            }
            Err(e) => {
                return Err(ProbeError::Unclassified(
                    anyhow::Error::new(e).context("unparseable dcgmi output"),
                ))
            }
        };

        if let Some(failure) = self.first_failure(&report) {
            return Err(failure.into());
        }
        if failed {
            return Err(self.nonzero_exit().into());
        }

        info!(level = self.level, "dcgmi tests pass");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockResponse;
    use crate::probes::testing::{harness, harness_with, profile, Harness};
    use crate::settings::ProbeSettings;

    fn with_devices(devices: Option<Vec<u32>>) -> Harness {
        let mut p = profile("cluster1");
        p.visible_devices = devices;
        harness_with(p, ProbeSettings::without_waits())
    }

    fn report(status: &str) -> String {
        serde_json::json!({
            "DCGM GPU Diagnostic": {
                "test_categories": [
                    {
                        "category": "Deployment",
                        "tests": [
                            {"name": "Denylist", "results": [{"status": "Pass"}]}
                        ]
                    },
                    {
                        "category": "Integration",
                        "tests": [
                            {"name": "PCIe", "results": [{"status": status, "gpu_id": "3"}]}
                        ]
                    }
                ]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_all_pass() {
        let h = with_devices(Some(vec![0, 1, 2, 3]));
        h.exec.on("dcgmi diag -r 1", MockResponse::stdout(report("Pass")));
        assert!(DiagProbe::fast().run(&h.ctx).await.is_ok());
        assert_eq!(h.exec.calls(), vec!["dcgmi diag -r 1 -j -i 0,1,2,3"]);
    }

    #[tokio::test]
    async fn test_failed_category() {
        let h = with_devices(Some(vec![0, 1]));
        h.exec.on("dcgmi diag -r 2", MockResponse::fail(226, report("Fail")));
        match DiagProbe::full().run(&h.ctx).await {
            Err(ProbeError::Check(e)) => {
                assert_eq!(e.reason(), "DCGMIIntegrationFailure");
                assert!(e.condition().message.contains("PCIe"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_failure() {
        let h = with_devices(Some(vec![0, 1]));
        h.exec.on("dcgmi diag", MockResponse::fail(1, report("Pass")));
        match DiagProbe::fast().run(&h.ctx).await {
            Err(ProbeError::Check(e)) => assert_eq!(e.reason(), "DCGMICheckNoneZeroResult"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_soft() {
        let h = with_devices(Some(vec![0, 1]));
        h.exec.on("dcgmi diag", MockResponse::Timeout);
        assert!(DiagProbe::full().run(&h.ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_skipped_when_visible_devices_unset() {
        let h = harness("cluster1");
        assert_eq!(h.ctx.profile.visible_devices, None);
        h.exec.on("dcgmi diag", MockResponse::fail(226, report("Fail")));
        assert!(DiagProbe::fast().run(&h.ctx).await.is_ok());
        assert!(DiagProbe::full().run(&h.ctx).await.is_ok());
        assert!(h.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_without_visible_devices() {
        let h = with_devices(Some(vec![]));
        h.exec.on("dcgmi diag", MockResponse::fail(226, report("Fail")));
        assert!(DiagProbe::fast().run(&h.ctx).await.is_ok());
        assert!(h.exec.calls().is_empty());

        let mut p = profile("cluster1");
        p.visible_devices = Some(vec![0]);
        p.gpus_present = false;
        let h = harness_with(p, ProbeSettings::without_waits());
        assert!(DiagProbe::full().run(&h.ctx).await.is_ok());
        assert!(h.exec.calls().is_empty());
    }

    #[test]
    fn test_levels() {
        assert_eq!(DiagProbe::fast().id(), ProbeId::DiagFast);
        assert_eq!(DiagProbe::full().level(), 2);
    }
}
