//! Physical node fingerprint
//!
//! Kubernetes node names are reused when a VM is recreated, so physical
//! machines are identified by a hash of their GPU UUIDs instead. The
//! fingerprint names the PhysicalNode custom resource holding the node's
//! goal state.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::exec::{CommandRunner, ExecOptions};
use crate::profile::ClusterProfile;
use crate::settings::ProbeSettings;

/// Fingerprint of a node without GPUs
pub const UNKNOWN: &str = "unknown";

/// Hash of `nvidia-smi --query-gpu=uuid` output with line breaks removed
pub fn hash_uuids(output: &str) -> String {
    let concat: String = output.chars().filter(|c| *c != '\n').collect();
    hex::encode(Sha256::digest(concat.as_bytes()))
}

/// Fingerprint of the node the process runs on
pub async fn fingerprint(
    exec: &dyn CommandRunner,
    profile: &ClusterProfile,
    settings: &ProbeSettings,
) -> Result<String> {
    if !profile.gpus_present {
        return Ok(UNKNOWN.to_string());
    }
    let command = format!(
        "{} --query-gpu=uuid --format=csv,noheader",
        settings.accelerator.nvidia_smi()
    );
    let output = exec
        .run(&command, &ExecOptions::new().timeout(settings.command_timeout))
        .await
        .context("failed to query GPU UUIDs")?;
    Ok(hash_uuids(&output.stdout))
}
