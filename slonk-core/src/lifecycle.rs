//! Node lifecycle
//!
//! Operator-driven drain and undrain. The goal state lives on the node's
//! PhysicalNode record, keyed by its fingerprint, so it survives the
//! Kubernetes node being recreated.

use anyhow::{Context, Result};
use tracing::info;

use crate::cluster::NodeActuator;
use crate::fingerprint::fingerprint;
use crate::probes::ProbeContext;
use crate::slurm::Scontrol;

pub const GOAL_STATE_DRAIN: &str = "drain";
pub const GOAL_STATE_UP: &str = "up";

/// Mark this node's physical node as drained by an operator
pub async fn drain(
    ctx: &ProbeContext,
    actuator: &dyn NodeActuator,
    reason: &str,
    dry_run: bool,
) -> Result<String> {
    let physical_node = fingerprint(ctx.exec.as_ref(), &ctx.profile, &ctx.settings).await?;
    info!(
        node = %ctx.profile.hostname,
        physical_node = %physical_node,
        reason = reason,
        "Draining slurm node"
    );

    if dry_run {
        info!(physical_node = %physical_node, "[DRY-RUN] Would set goal state to {}", GOAL_STATE_DRAIN);
        return Ok(physical_node);
    }
    actuator
        .update_goal_state(&physical_node, GOAL_STATE_DRAIN, true, Some(reason))
        .await
        .context("Failed to drain physical node")?;

    info!(physical_node = %physical_node, "Drained slurm node successfully");
    Ok(physical_node)
}

/// Return this node to service, in the goal state and in slurm
pub async fn undrain(
    ctx: &ProbeContext,
    actuator: &dyn NodeActuator,
    dry_run: bool,
) -> Result<String> {
    let physical_node = fingerprint(ctx.exec.as_ref(), &ctx.profile, &ctx.settings).await?;
    let previous = ctx
        .cluster
        .read_goal_state(&physical_node)
        .await
        .context("Failed to read physical node")?
        .and_then(|record| record.reason)
        .unwrap_or_default();
    info!(
        node = %ctx.profile.hostname,
        physical_node = %physical_node,
        reason = %previous,
        "Undraining slurm node"
    );

    if dry_run {
        info!(physical_node = %physical_node, "[DRY-RUN] Would set goal state to {}", GOAL_STATE_UP);
    } else {
        actuator
            .update_goal_state(&physical_node, GOAL_STATE_UP, false, None)
            .await
            .context("Failed to undrain physical node")?;
    }
    Scontrol::new(ctx.exec.clone())
        .dry_run(dry_run)
        .resume_node(&ctx.profile.hostname)
        .await?;

    info!(physical_node = %physical_node, "Undrained slurm node successfully");
    Ok(physical_node)
}
