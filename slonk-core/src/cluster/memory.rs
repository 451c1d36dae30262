//! In-memory orchestration state for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{ClusterDirectory, GoalStateRecord, NodeActuator, PeerNode, Taint};

#[derive(Default)]
struct State {
    taints: HashMap<String, Vec<Taint>>,
    labels: HashMap<String, BTreeMap<String, String>>,
    peers: Option<Vec<PeerNode>>,
    goal_states: HashMap<String, GoalStateRecord>,
    fail_reads: bool,
    writes: usize,
}

/// Orchestration fake holding taints, labels and goal states in memory
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the peers returned for any node
    pub fn set_peers(&self, peers: Vec<PeerNode>) {
        self.lock().peers = Some(peers);
    }

    pub fn set_goal_state(&self, physical_node: &str, record: GoalStateRecord) {
        self.lock()
            .goal_states
            .insert(physical_node.to_string(), record);
    }

    pub fn goal_state(&self, physical_node: &str) -> Option<GoalStateRecord> {
        self.lock().goal_states.get(physical_node).cloned()
    }

    /// Make directory reads fail
    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn taints(&self, node_name: &str) -> Vec<Taint> {
        self.lock().taints.get(node_name).cloned().unwrap_or_default()
    }

    pub fn labels(&self, node_name: &str) -> BTreeMap<String, String> {
        self.lock().labels.get(node_name).cloned().unwrap_or_default()
    }

    /// Number of write calls received
    pub fn writes(&self) -> usize {
        self.lock().writes
    }
}

#[async_trait]
impl ClusterDirectory for InMemoryCluster {
    async fn placement_peers(&self, node_name: &str) -> Result<Option<Vec<PeerNode>>> {
        let state = self.lock();
        if state.fail_reads {
            return Err(anyhow!("directory unavailable"));
        }
        Ok(state.peers.as_ref().map(|peers| {
            peers
                .iter()
                .filter(|p| p.name != node_name)
                .cloned()
                .collect()
        }))
    }

    async fn read_goal_state(&self, physical_node: &str) -> Result<Option<GoalStateRecord>> {
        let state = self.lock();
        if state.fail_reads {
            return Err(anyhow!("directory unavailable"));
        }
        Ok(state.goal_states.get(physical_node).cloned())
    }
}

#[async_trait]
impl NodeActuator for InMemoryCluster {
    async fn taint_node(&self, node_name: &str, taint: &Taint) -> Result<()> {
        let mut state = self.lock();
        state.writes += 1;
        let taints = state.taints.entry(node_name.to_string()).or_default();
        match taints.iter_mut().find(|t| t.key == taint.key) {
            Some(existing) => *existing = taint.clone(),
            None => taints.push(taint.clone()),
        }
        Ok(())
    }

    async fn label_node(&self, node_name: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        state.writes += 1;
        state
            .labels
            .entry(node_name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn update_goal_state(
        &self,
        physical_node: &str,
        goal_state: &str,
        manual: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.writes += 1;
        state.goal_states.insert(
            physical_node.to_string(),
            GoalStateRecord {
                goal_state: goal_state.to_string(),
                reason: reason.map(str::to_string),
                manual,
            },
        );
        Ok(())
    }
}
