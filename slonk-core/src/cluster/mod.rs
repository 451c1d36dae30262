//! Orchestration-state boundary
//!
//! Probes read cluster state through [`ClusterDirectory`]; only the mitigation
//! dispatcher writes through [`NodeActuator`]. The Kubernetes implementation
//! lives in the `slonk-k8s` crate.

mod memory;

pub use memory::InMemoryCluster;

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Taint effect used for every remediation taint
pub const NO_SCHEDULE: &str = "NoSchedule";

/// A node taint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

impl Taint {
    pub fn no_schedule(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect: NO_SCHEDULE.to_string(),
        }
    }
}

/// A node sharing our placement group
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerNode {
    pub name: String,
    /// Adapter name (eth1, ...) to its address
    pub adapters: BTreeMap<String, String>,
}

/// Admission record of a physical node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalStateRecord {
    pub goal_state: String,
    pub reason: Option<String>,
    pub manual: bool,
}

/// Read side of the orchestration layer
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// Other nodes in this node's placement group
    ///
    /// `Ok(None)` means the group could not be determined.
    async fn placement_peers(&self, node_name: &str) -> Result<Option<Vec<PeerNode>>>;

    /// Goal state of a physical node, `Ok(None)` if no record exists
    async fn read_goal_state(&self, physical_node: &str) -> Result<Option<GoalStateRecord>>;
}

/// Write side of the orchestration layer
///
/// Implementations must be idempotent: applying the same taint or label twice
/// leaves the node as applying it once.
#[async_trait]
pub trait NodeActuator: Send + Sync {
    async fn taint_node(&self, node_name: &str, taint: &Taint) -> Result<()>;

    async fn label_node(&self, node_name: &str, key: &str, value: &str) -> Result<()>;

    async fn update_goal_state(
        &self,
        physical_node: &str,
        goal_state: &str,
        manual: bool,
        reason: Option<&str>,
    ) -> Result<()>;
}

/// Stand-in used when no orchestration API is reachable
///
/// Reads report nothing; writes fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

#[async_trait]
impl ClusterDirectory for Detached {
    async fn placement_peers(&self, _node_name: &str) -> Result<Option<Vec<PeerNode>>> {
        Ok(None)
    }

    async fn read_goal_state(&self, _physical_node: &str) -> Result<Option<GoalStateRecord>> {
        Ok(None)
    }
}

#[async_trait]
impl NodeActuator for Detached {
    async fn taint_node(&self, node_name: &str, taint: &Taint) -> Result<()> {
        Err(anyhow!(
            "cannot taint {} with {}: no orchestration API",
            node_name,
            taint.key
        ))
    }

    async fn label_node(&self, node_name: &str, key: &str, _value: &str) -> Result<()> {
        Err(anyhow!(
            "cannot label {} with {}: no orchestration API",
            node_name,
            key
        ))
    }

    async fn update_goal_state(
        &self,
        physical_node: &str,
        _goal_state: &str,
        _manual: bool,
        _reason: Option<&str>,
    ) -> Result<()> {
        Err(anyhow!(
            "cannot update goal state of {}: no orchestration API",
            physical_node
        ))
    }
}
