//! Admission consistency
//!
//! A physical node whose goal state is `down` must not be running jobs. When
//! the record cannot be read the node is assumed to be fine.

use async_trait::async_trait;
use tracing::{error, info};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};
use crate::fingerprint::fingerprint;

/// Goal state of a node excluded from scheduling
pub const GOAL_STATE_DOWN: &str = "down";

pub struct GoalStateProbe;

#[async_trait]
impl Probe for GoalStateProbe {
    fn id(&self) -> ProbeId {
        ProbeId::GoalState
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        info!("Checking for node blacklist status");
        let physical_node = fingerprint(ctx.exec.as_ref(), &ctx.profile, &ctx.settings).await?;

        let record = match ctx.cluster.read_goal_state(&physical_node).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(physical_node = %physical_node, "Physical node not found, assuming okay");
                return Ok(());
            }
            Err(e) => {
                error!(physical_node = %physical_node, error = %e, "Failed to get physical node, assuming okay");
                return Ok(());
            }
        };

        if record.goal_state == GOAL_STATE_DOWN {
            let msg = "Node should have been blacklisted but is still in job";
            error!(physical_node = %physical_node, "{}", msg);
            return Err(CheckError::manual(
                "SlurmGoalStateCheck",
                "SlurmGoalStateNotExpected",
                msg,
            )
            .into());
        }

        info!("Node is okay to be part of slurm");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::GoalStateRecord;
    use crate::exec::MockResponse;
    use crate::fingerprint::hash_uuids;
    use crate::probes::testing::harness;

    const UUIDS: &str = "GPU-aaaa\nGPU-bbbb\n";

    fn record(state: &str) -> GoalStateRecord {
        GoalStateRecord {
            goal_state: state.to_string(),
            reason: None,
            manual: true,
        }
    }

    #[tokio::test]
    async fn test_down_node_in_job() {
        let h = harness("cluster1");
        h.exec.on("--query-gpu=uuid", MockResponse::stdout(UUIDS));
        h.cluster.set_goal_state(&hash_uuids(UUIDS), record("down"));

        match GoalStateProbe.run(&h.ctx).await {
            Err(ProbeError::Check(e)) => assert_eq!(e.reason(), "SlurmGoalStateNotExpected"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_up_and_drain_pass() {
        let h = harness("cluster1");
        h.exec.on("--query-gpu=uuid", MockResponse::stdout(UUIDS));
        for state in ["up", "drain"] {
            h.cluster.set_goal_state(&hash_uuids(UUIDS), record(state));
            assert!(GoalStateProbe.run(&h.ctx).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_unreadable_record_assumed_okay() {
        let h = harness("cluster1");
        h.exec.on("--query-gpu=uuid", MockResponse::stdout(UUIDS));
        assert!(GoalStateProbe.run(&h.ctx).await.is_ok());

        h.cluster.fail_reads(true);
        assert!(GoalStateProbe.run(&h.ctx).await.is_ok());
    }
}
