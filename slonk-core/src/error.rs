//! Health check failure taxonomy
//!
//! A probe that finds a problem raises a [`CheckError`]. The variant decides the
//! remediation (see [`crate::mitigation::remediation_for`]); the probe only picks
//! which bucket the failure belongs to.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::ExecError;

/// Condition type reported for provider maintenance events
pub const MAINTENANCE_CONDITION: &str = "MaintenanceEvent";

/// The five failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckKind {
    PodRestart,
    PowerCycle,
    Manual,
    Rma,
    Maintenance,
}

impl CheckKind {
    pub const ALL: [CheckKind; 5] = [
        CheckKind::PodRestart,
        CheckKind::PowerCycle,
        CheckKind::Manual,
        CheckKind::Rma,
        CheckKind::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::PodRestart => "pod_restart",
            CheckKind::PowerCycle => "power_cycle",
            CheckKind::Manual => "manual",
            CheckKind::Rma => "rma",
            CheckKind::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong, in terms an operator can search for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Which check produced the failure, e.g. `NvidiaSMIECCCheck`
    pub condition_type: String,
    /// Machine-readable cause, e.g. `NvidiaSMIECCTooManyUncorrectables`
    pub reason: String,
    pub message: String,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.condition_type, self.reason, self.message)
    }
}

/// A classified health check failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("needs pod restart: {0}")]
    PodRestart(Condition),
    #[error("needs power cycle: {0}")]
    PowerCycle(Condition),
    #[error("needs manual intervention: {0}")]
    Manual(Condition),
    #[error("needs RMA: {0}")]
    Rma(Condition),
    #[error("maintenance scheduled: {0}")]
    Maintenance(Condition),
}

fn condition(
    condition_type: impl Into<String>,
    reason: impl Into<String>,
    message: impl Into<String>,
) -> Condition {
    Condition {
        condition_type: condition_type.into(),
        reason: reason.into(),
        message: message.into(),
    }
}

impl CheckError {
    pub fn pod_restart(
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CheckError::PodRestart(condition(condition_type, reason, message))
    }

    pub fn power_cycle(
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CheckError::PowerCycle(condition(condition_type, reason, message))
    }

    pub fn manual(
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CheckError::Manual(condition(condition_type, reason, message))
    }

    pub fn rma(
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CheckError::Rma(condition(condition_type, reason, message))
    }

    /// Maintenance failures always carry the maintenance condition type
    pub fn maintenance(reason: impl Into<String>, message: impl Into<String>) -> Self {
        CheckError::Maintenance(condition(MAINTENANCE_CONDITION, reason, message))
    }

    pub fn kind(&self) -> CheckKind {
        match self {
            CheckError::PodRestart(_) => CheckKind::PodRestart,
            CheckError::PowerCycle(_) => CheckKind::PowerCycle,
            CheckError::Manual(_) => CheckKind::Manual,
            CheckError::Rma(_) => CheckKind::Rma,
            CheckError::Maintenance(_) => CheckKind::Maintenance,
        }
    }

    pub fn condition(&self) -> &Condition {
        match self {
            CheckError::PodRestart(c)
            | CheckError::PowerCycle(c)
            | CheckError::Manual(c)
            | CheckError::Rma(c)
            | CheckError::Maintenance(c) => c,
        }
    }

    pub fn reason(&self) -> &str {
        &self.condition().reason
    }
}

/// Outcome of a failed probe
///
/// `Unclassified` covers everything that is not a known hardware or software
/// fault: parse failures, missing tools, bugs. Those are reported but never
/// mitigated.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Check(#[from] CheckError),
    #[error(transparent)]
    Unclassified(#[from] anyhow::Error),
}

impl From<ExecError> for ProbeError {
    fn from(err: ExecError) -> Self {
        ProbeError::Unclassified(anyhow::Error::new(err))
    }
}
