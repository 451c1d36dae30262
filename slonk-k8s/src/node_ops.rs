//! Node Operations
//!
//! Kubernetes side of the orchestration boundary: placement-group peers for
//! the reachability probe, PhysicalNode goal states, and the taints and labels
//! the mitigation dispatcher applies.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use serde::Deserialize;
use tracing::{info, warn};

use slonk_core::cluster::{ClusterDirectory, GoalStateRecord, NodeActuator, PeerNode, Taint};

use super::client::{goal_state_from_spec, goal_state_patch, K8sClient};

/// Node label naming the node's placement group
pub const PLACEMENT_GROUP_LABEL: &str = "cloud.google.com/gke-placement-group";
/// Node annotation listing the node's NICs
pub const NIC_INFO_ANNOTATION: &str = "networking.gke.io/nic-info";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NicInfo {
    birth_name: Option<String>,
    #[serde(rename = "birthIP")]
    birth_ip: Option<String>,
}

/// Adapter name to address, from the NIC info annotation
pub fn parse_nic_info(raw: &str) -> Result<BTreeMap<String, String>> {
    let nics: Vec<NicInfo> = serde_json::from_str(raw)?;
    Ok(nics
        .into_iter()
        .filter_map(|nic| Some((nic.birth_name?, nic.birth_ip?)))
        .collect())
}

fn placement_group(node: &Node) -> Option<&str> {
    node.metadata
        .labels
        .as_ref()?
        .get(PLACEMENT_GROUP_LABEL)
        .map(String::as_str)
}

fn peer(node: &Node) -> PeerNode {
    let name = node.metadata.name.clone().unwrap_or_default();
    let adapters = node
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(NIC_INFO_ANNOTATION))
        .map(|raw| {
            parse_nic_info(raw).unwrap_or_else(|e| {
                warn!(node = %name, error = %e, "Unreadable NIC info");
                BTreeMap::new()
            })
        })
        .unwrap_or_default();
    PeerNode { name, adapters }
}

/// Nodes in `node_name`'s placement group, excluding itself
///
/// `None` when the node carries no placement group label.
pub fn peers_in_group(node_name: &str, nodes: &[Node]) -> Option<Vec<PeerNode>> {
    let me = nodes
        .iter()
        .find(|n| n.metadata.name.as_deref() == Some(node_name))?;
    let group = placement_group(me)?;
    let peers: Vec<PeerNode> = nodes
        .iter()
        .filter(|n| placement_group(n) == Some(group))
        .filter(|n| n.metadata.name.as_deref() != Some(node_name))
        .map(peer)
        .collect();
    info!(group = group, peers = peers.len(), "Found nodes in placement group");
    Some(peers)
}

/// Node operator backed by the Kubernetes API
pub struct NodeOperator {
    client: K8sClient,
}

impl NodeOperator {
    pub fn new(client: K8sClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &K8sClient {
        &self.client
    }
}

#[async_trait]
impl ClusterDirectory for NodeOperator {
    async fn placement_peers(&self, node_name: &str) -> Result<Option<Vec<PeerNode>>> {
        let nodes = self.client.list_nodes().await?;
        Ok(peers_in_group(node_name, &nodes))
    }

    async fn read_goal_state(&self, physical_node: &str) -> Result<Option<GoalStateRecord>> {
        let spec = self.client.get_physical_node_spec(physical_node).await?;
        Ok(spec.as_ref().and_then(goal_state_from_spec))
    }
}

#[async_trait]
impl NodeActuator for NodeOperator {
    async fn taint_node(&self, node_name: &str, taint: &Taint) -> Result<()> {
        self.client.upsert_taint(node_name, taint).await
    }

    async fn label_node(&self, node_name: &str, key: &str, value: &str) -> Result<()> {
        self.client.add_label(node_name, key, value).await
    }

    async fn update_goal_state(
        &self,
        physical_node: &str,
        goal_state: &str,
        manual: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let patch = goal_state_patch(goal_state, manual, reason);
        self.client.patch_physical_node(physical_node, &patch).await?;
        info!(
            physical_node = physical_node,
            goal_state = goal_state,
            "Updated physical node goal state"
        );
        Ok(())
    }
}
