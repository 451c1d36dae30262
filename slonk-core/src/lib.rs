//! Slonk Core Library
//!
//! Node health checks and remediation for Slurm-on-Kubernetes clusters.
//! This crate provides the diagnostic probes, the check orchestrator that
//! runs them per mode, and the mitigation dispatcher that reacts to failures.

pub mod bandwidth;
pub mod cluster;
pub mod drains;
pub mod error;
pub mod exec;
pub mod fingerprint;
pub mod lifecycle;
pub mod metrics;
pub mod mitigation;
pub mod orchestrator;
pub mod probes;
pub mod profile;
pub mod retry;
pub mod settings;
pub mod slurm;
pub mod state_machine;

// Re-export common types
pub use cluster::{ClusterDirectory, Detached, NodeActuator, PeerNode, Taint};
pub use error::{CheckError, CheckKind, ProbeError};
pub use exec::{CommandRunner, ExecError, ExecOptions, ShellExecutor};
pub use metrics::{MetricsBuffer, MetricsRegistry};
pub use mitigation::{MitigationDispatcher, MitigationOutcome, Remediation};
pub use orchestrator::{CheckOrchestrator, ExitStatus, RunMode, RunReport};
pub use probes::{ProbeContext, ProbeId, ProbeRegistry};
pub use profile::ClusterProfile;
pub use settings::ProbeSettings;
pub use state_machine::{RunState, RunTracker};
