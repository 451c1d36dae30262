//! Check orchestrator
//!
//! Composes probes into run modes. Within a mode probes run strictly one after
//! another in a fixed order; the first failure aborts the rest of the run.
//! Classified failures go to the [`MitigationDispatcher`], unclassified ones
//! are only reported.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{CheckError, ProbeError};
use crate::metrics::MetricsRegistry;
use crate::mitigation::{MitigationDispatcher, MitigationOutcome};
use crate::probes::{ProbeContext, ProbeId, ProbeRegistry};
use crate::state_machine::{RunEvent, RunState, RunTracker};

/// Default pause between continuous cycles
pub const CONTINUOUS_INTERVAL: Duration = Duration::from_secs(60);

/// Named set of probes run together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Cheap checks safe to run next to workloads
    NonInvasive,
    Fast,
    /// Everything, including burn-in and bandwidth tests
    Full,
    /// Non-invasive checks in a loop
    Continuous,
    /// Admission consistency only
    Lifecycle,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::NonInvasive => "noninvasive",
            RunMode::Fast => "fast",
            RunMode::Full => "full",
            RunMode::Continuous => "continuous",
            RunMode::Lifecycle => "lifecycle",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "noninvasive" | "non-invasive" => Ok(RunMode::NonInvasive),
            "fast" => Ok(RunMode::Fast),
            "full" | "all" => Ok(RunMode::Full),
            "continuous" => Ok(RunMode::Continuous),
            "lifecycle" => Ok(RunMode::Lifecycle),
            other => Err(format!("unknown run mode: {}", other)),
        }
    }
}

/// Ordered probes of a mode
///
/// `skip_redundant` drops the level-1 diagnostic from the fast set; the full
/// set does this itself since it runs level 2 later.
pub fn plan(mode: RunMode, skip_redundant: bool) -> Vec<ProbeId> {
    match mode {
        RunMode::NonInvasive | RunMode::Continuous => vec![
            ProbeId::SerialDenylist,
            ProbeId::Interface,
            ProbeId::PciTopology,
            ProbeId::Storage,
            ProbeId::ControlPlane,
            ProbeId::FabricDevinfo,
            ProbeId::AcceleratorSanity,
            ProbeId::DriverFaults,
        ],
        RunMode::Fast => {
            let mut probes = plan(RunMode::NonInvasive, skip_redundant);
            probes.extend([ProbeId::DiskUsage, ProbeId::CpuLoad, ProbeId::Maintenance]);
            if !skip_redundant {
                probes.push(ProbeId::DiagFast);
            }
            probes
        }
        RunMode::Full => {
            let mut probes = plan(RunMode::Fast, true);
            probes.extend([
                ProbeId::FabricReachability,
                ProbeId::BurnIn,
                ProbeId::DiagFull,
                ProbeId::HostDeviceBandwidth,
                ProbeId::InterNodeBandwidth,
            ]);
            probes
        }
        RunMode::Lifecycle => vec![ProbeId::GoalState],
    }
}

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    Passed,
    Failed { probe: ProbeId, error: CheckError },
    Errored { probe: ProbeId, error: anyhow::Error },
}

impl RunOutcome {
    fn label(&self) -> &'static str {
        match self {
            RunOutcome::Passed => "passed",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Errored { .. } => "errored",
        }
    }
}

/// Outcome of a run plus what was done about it
#[derive(Debug)]
pub struct RunReport {
    pub mode: RunMode,
    pub outcome: RunOutcome,
    /// Probes that actually ran, in order
    pub executed: Vec<ProbeId>,
    /// Set when a classified failure was handed to the dispatcher
    pub mitigation: Option<MitigationOutcome>,
}

impl RunReport {
    pub fn exit_status(&self) -> ExitStatus {
        match self.outcome {
            RunOutcome::Passed => ExitStatus::Healthy,
            RunOutcome::Failed { .. } => ExitStatus::Unhealthy,
            RunOutcome::Errored { .. } => ExitStatus::Unknown,
        }
    }
}

/// Process exit status of a health run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Healthy,
    /// Checks failed; mitigation was requested or skipped
    Unhealthy,
    /// A probe failed without a classification
    Unknown,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Healthy => 0,
            ExitStatus::Unhealthy => 1,
            ExitStatus::Unknown => 240,
        }
    }
}

/// Runs probe plans and hands failures to mitigation
pub struct CheckOrchestrator {
    registry: ProbeRegistry,
    ctx: ProbeContext,
    metrics: Arc<MetricsRegistry>,
    tracker: RunTracker,
    /// `None` when mitigation is disabled
    mitigation: Option<Arc<MitigationDispatcher>>,
    skip_redundant: bool,
}

impl CheckOrchestrator {
    pub fn new(registry: ProbeRegistry, ctx: ProbeContext, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            registry,
            ctx,
            metrics,
            tracker: RunTracker::new(),
            mitigation: None,
            skip_redundant: false,
        }
    }

    pub fn with_mitigation(mut self, dispatcher: Arc<MitigationDispatcher>) -> Self {
        self.mitigation = Some(dispatcher);
        self
    }

    /// Skip the level-1 diagnostic in fast mode
    pub fn skip_redundant(mut self, skip: bool) -> Self {
        self.skip_redundant = skip;
        self
    }

    pub fn state(&self) -> RunState {
        self.tracker.state()
    }

    fn transition(&mut self, event: RunEvent) {
        self.tracker.handle(event);
        self.metrics.set_run_state(&self.tracker.state());
    }

    /// Run one pass of `mode`
    ///
    /// Continuous mode runs a single non-invasive pass here; see
    /// [`CheckOrchestrator::run_continuous`] for the loop.
    pub async fn run(&mut self, mode: RunMode) -> RunReport {
        info!(
            mode = %mode,
            host = %self.ctx.profile.hostname,
            "Beginning {} health checks",
            mode
        );
        self.transition(RunEvent::Started(mode));

        let mut executed = Vec::new();
        let mut outcome = RunOutcome::Passed;
        for id in plan(mode, self.skip_redundant) {
            let Some(probe) = self.registry.get(id).cloned() else {
                warn!(probe = %id, "Probe not registered, skipping");
                continue;
            };
            if id.requires_accelerator() && !self.ctx.profile.is_nvidia() {
                debug!(probe = %id, "Not an NVIDIA node, skipping");
                continue;
            }
            if !probe.applies_to(&self.ctx.profile, &self.ctx.settings) {
                debug!(probe = %id, "Probe does not apply, skipping");
                continue;
            }

            debug!(probe = %id, "Running probe");
            let started = Instant::now();
            let result = probe.run(&self.ctx).await;
            self.metrics
                .observe_probe_duration(id, started.elapsed().as_secs_f64());
            executed.push(id);

            match result {
                Ok(()) => {}
                Err(ProbeError::Check(error)) => {
                    self.metrics
                        .inc_probe_failure(id, error.kind(), error.reason());
                    outcome = RunOutcome::Failed { probe: id, error };
                    break;
                }
                Err(ProbeError::Unclassified(error)) => {
                    self.metrics.inc_probe_error(id);
                    outcome = RunOutcome::Errored { probe: id, error };
                    break;
                }
            }
        }

        let mitigation = match &outcome {
            RunOutcome::Passed => {
                info!(mode = %mode, "All health checks pass");
                self.transition(RunEvent::AllPassed);
                None
            }
            RunOutcome::Failed { probe, error } => {
                error!(
                    probe = %probe,
                    kind = %error.kind(),
                    condition = %error.condition().condition_type,
                    reason = %error.reason(),
                    "Failed health checks: {}",
                    error
                );
                self.transition(RunEvent::CheckFailed(error.kind()));
                self.mitigate(error).await
            }
            RunOutcome::Errored { probe, error } => {
                error!(probe = %probe, "Unknown exception: {:?}", error);
                self.transition(RunEvent::Unclassified);
                None
            }
        };
        self.metrics.inc_health_run(mode.as_str(), outcome.label());

        RunReport {
            mode,
            outcome,
            executed,
            mitigation,
        }
    }

    async fn mitigate(&self, error: &CheckError) -> Option<MitigationOutcome> {
        let Some(dispatcher) = &self.mitigation else {
            warn!("Mitigations skipped due to --no-mitigation");
            return None;
        };
        match dispatcher.dispatch(error).await {
            Ok(outcome) => {
                if !outcome.escalate {
                    warn!(
                        remediation = %outcome.remediation,
                        "Mitigation requested, node is not fit to continue"
                    );
                }
                Some(outcome)
            }
            Err(e) => {
                error!("Mitigation failed: {:#}", e);
                None
            }
        }
    }

    /// Repeat non-invasive passes until one fails or shutdown is signalled
    ///
    /// Returns the report of the last pass.
    pub async fn run_continuous(
        &mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunReport {
        loop {
            let report = self.run(RunMode::Continuous).await;
            if !matches!(report.outcome, RunOutcome::Passed) {
                return report;
            }

            debug!("Sleeping {}...", humantime::format_duration(interval));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping continuous checks");
                        return report;
                    }
                }
            }
        }
    }
}
