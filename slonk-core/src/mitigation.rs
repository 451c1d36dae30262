//! Mitigation dispatcher
//!
//! Each failure kind maps to exactly one remediation. Remediations only request
//! action (a taint the orchestration layer reacts to, a deferred slurm reboot,
//! a BMC power cycle) and return immediately; convergence happens elsewhere.
//! Every step is idempotent, so re-running checks on a flagged node is safe.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster::{NodeActuator, Taint};
use crate::error::{CheckError, CheckKind};
use crate::exec::{CommandRunner, ExecOptions};
use crate::metrics::MetricsRegistry;
use crate::profile::ClusterProfile;
use crate::slurm::Scontrol;

pub const POD_RESTART_TAINT: &str = "slonk.your-org.com/action-quit";
pub const POWER_CYCLE_TAINT: &str = "slonk.your-org.com/action-reboot";
pub const MANUAL_TAINT: &str = "slonk.your-org.com/action-manual";
pub const RMA_TAINT: &str = "slonk.your-org.com/action-rma";
/// Older tooling still watches these
pub const LEGACY_MANUAL_TAINT: &str = "needs_manual_intervention";
pub const LEGACY_RMA_TAINT: &str = "needs_rma";
pub const MAINTENANCE_LABEL: &str = "cloud.google.com/perform-maintenance";
pub const MAINTENANCE_VALUE: &str = "true";

const BMC_POWER_CYCLE: &str = "ipmitool power cycle";
const MAX_TAINT_VALUE_LEN: usize = 63;

/// Remediation bound to a failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Remediation {
    RestartWorkload,
    PowerCycle,
    FlagManual,
    FlagRma,
    AcknowledgeMaintenance,
}

impl Remediation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Remediation::RestartWorkload => "restart_workload",
            Remediation::PowerCycle => "power_cycle",
            Remediation::FlagManual => "flag_manual",
            Remediation::FlagRma => "flag_rma",
            Remediation::AcknowledgeMaintenance => "acknowledge_maintenance",
        }
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn remediation_for(kind: CheckKind) -> Remediation {
    match kind {
        CheckKind::PodRestart => Remediation::RestartWorkload,
        CheckKind::PowerCycle => Remediation::PowerCycle,
        CheckKind::Manual => Remediation::FlagManual,
        CheckKind::Rma => Remediation::FlagRma,
        CheckKind::Maintenance => Remediation::AcknowledgeMaintenance,
    }
}

/// A single external side effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MitigationStep {
    Taint(Taint),
    Label { key: String, value: String },
    /// Reboot through slurm once running jobs finish
    SlurmReboot { host: String },
    /// Out-of-band power cycle through the BMC
    BmcPowerCycle,
}

impl fmt::Display for MitigationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MitigationStep::Taint(t) => write!(f, "taint {}={}:{}", t.key, t.value, t.effect),
            MitigationStep::Label { key, value } => write!(f, "label {}={}", key, value),
            MitigationStep::SlurmReboot { host } => write!(f, "scontrol reboot asap {}", host),
            MitigationStep::BmcPowerCycle => f.write_str(BMC_POWER_CYCLE),
        }
    }
}

/// Make a failure reason usable as a taint value
///
/// Taint values are limited to 63 alphanumerics, `-`, `_` and `.`, starting
/// and ending with an alphanumeric.
pub fn taint_value(reason: &str) -> String {
    let cleaned: String = reason
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_TAINT_VALUE_LEN)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Steps that carry out the remediation for `error` on this node
pub fn plan(error: &CheckError, profile: &ClusterProfile) -> Vec<MitigationStep> {
    let value = taint_value(error.reason());
    let taint = |key: &str| MitigationStep::Taint(Taint::no_schedule(key, value.clone()));

    match remediation_for(error.kind()) {
        Remediation::RestartWorkload if profile.onprem => vec![MitigationStep::SlurmReboot {
            host: profile.hostname.clone(),
        }],
        Remediation::RestartWorkload => vec![taint(POD_RESTART_TAINT)],
        Remediation::PowerCycle if profile.onprem => vec![MitigationStep::BmcPowerCycle],
        Remediation::PowerCycle => vec![taint(POWER_CYCLE_TAINT)],
        Remediation::FlagManual => vec![taint(MANUAL_TAINT), taint(LEGACY_MANUAL_TAINT)],
        Remediation::FlagRma => vec![taint(RMA_TAINT), taint(LEGACY_RMA_TAINT)],
        Remediation::AcknowledgeMaintenance if profile.is_tcpx() => vec![
            MitigationStep::Label {
                key: MAINTENANCE_LABEL.to_string(),
                value: MAINTENANCE_VALUE.to_string(),
            },
            MitigationStep::Taint(Taint::no_schedule(MAINTENANCE_LABEL, MAINTENANCE_VALUE)),
        ],
        Remediation::AcknowledgeMaintenance => Vec::new(),
    }
}

/// Result of dispatching a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MitigationOutcome {
    pub remediation: Remediation,
    pub steps: Vec<MitigationStep>,
    /// Whether the caller must do more than exit; always false, since every
    /// remediation is fire-and-forget
    pub escalate: bool,
}

/// Carries out remediations against the orchestration layer and the host
pub struct MitigationDispatcher {
    actuator: Arc<dyn NodeActuator>,
    exec: Arc<dyn CommandRunner>,
    profile: Arc<ClusterProfile>,
    metrics: Arc<MetricsRegistry>,
    dry_run: bool,
}

impl MitigationDispatcher {
    pub fn new(
        actuator: Arc<dyn NodeActuator>,
        exec: Arc<dyn CommandRunner>,
        profile: Arc<ClusterProfile>,
        metrics: Arc<MetricsRegistry>,
        dry_run: bool,
    ) -> Self {
        Self {
            actuator,
            exec,
            profile,
            metrics,
            dry_run,
        }
    }

    /// Run the remediation bound to `error`, once
    pub async fn dispatch(&self, error: &CheckError) -> Result<MitigationOutcome> {
        let remediation = remediation_for(error.kind());
        info!(
            remediation = %remediation,
            reason = %error.reason(),
            cluster = %self.profile.cluster_name,
            onprem = self.profile.onprem,
            tcpx = self.profile.is_tcpx(),
            "Dispatching mitigation"
        );

        let steps = plan(error, &self.profile);
        if steps.is_empty() {
            warn!(remediation = %remediation, "No mitigation for this cluster");
        }
        for step in &steps {
            self.apply(step).await?;
        }
        self.metrics.inc_mitigation_action(remediation.as_str());

        Ok(MitigationOutcome {
            remediation,
            steps,
            escalate: false,
        })
    }

    async fn apply(&self, step: &MitigationStep) -> Result<()> {
        let node = &self.profile.node_name;
        match step {
            MitigationStep::Taint(taint) => {
                if self.dry_run {
                    info!(node = %node, "[DRY-RUN] Would {}", step);
                    return Ok(());
                }
                self.actuator
                    .taint_node(node, taint)
                    .await
                    .with_context(|| format!("failed to {} on {}", step, node))?;
            }
            MitigationStep::Label { key, value } => {
                if self.dry_run {
                    info!(node = %node, "[DRY-RUN] Would {}", step);
                    return Ok(());
                }
                self.actuator
                    .label_node(node, key, value)
                    .await
                    .with_context(|| format!("failed to {} on {}", step, node))?;
            }
            MitigationStep::SlurmReboot { host } => {
                info!("Directly restarting pod through scontrol");
                Scontrol::new(self.exec.clone())
                    .dry_run(self.dry_run)
                    .reboot_asap(host)
                    .await?;
            }
            MitigationStep::BmcPowerCycle => {
                info!("Directly restarting node through ipmitool");
                let opts = ExecOptions::new().elevated().dry_run(self.dry_run);
                self.exec
                    .run(BMC_POWER_CYCLE, &opts)
                    .await
                    .context("BMC power cycle failed")?;
            }
        }
        info!(node = %node, "Applied: {}", step);
        Ok(())
    }
}
