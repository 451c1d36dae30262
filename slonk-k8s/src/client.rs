//! Kubernetes Client wrapper
//!
//! Provides a simplified interface to the Kubernetes API: node taints and
//! labels, and the PhysicalNode custom resources that hold goal states.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Taint as NodeTaint};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use slonk_core::cluster::{GoalStateRecord, Taint};
use slonk_core::retry::{retry_if, RetryPolicy};

/// Field manager for patches
pub const FIELD_MANAGER: &str = "slonk";

pub const PHYSICAL_NODE_GROUP: &str = "slonk.your-org.com";
pub const PHYSICAL_NODE_VERSION: &str = "v1";
pub const PHYSICAL_NODE_KIND: &str = "PhysicalNode";
pub const PHYSICAL_NODE_PLURAL: &str = "physicalnodes";

const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const CONFLICT_ATTEMPTS: u32 = 3;
const CONFLICT_BACKOFF: Duration = Duration::from_secs(1);

/// Namespace of the PhysicalNode resources: the pod's own namespace
pub fn pod_namespace() -> Result<String> {
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        return Ok(namespace);
    }
    read_namespace(Path::new(NAMESPACE_FILE))
}

fn read_namespace(path: &Path) -> Result<String> {
    let namespace = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read namespace from {}", path.display()))?;
    Ok(namespace.trim().to_string())
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// Insert `taint`, replacing any taint with the same key
///
/// Returns false when an identical taint was already present.
pub fn upsert_taint(taints: &mut Vec<NodeTaint>, taint: &Taint) -> bool {
    let wanted = NodeTaint {
        key: taint.key.clone(),
        value: Some(taint.value.clone()),
        effect: taint.effect.clone(),
        time_added: None,
    };
    match taints.iter_mut().find(|t| t.key == taint.key) {
        Some(existing) if existing.value == wanted.value && existing.effect == wanted.effect => {
            false
        }
        Some(existing) => {
            *existing = wanted;
            true
        }
        None => {
            taints.push(wanted);
            true
        }
    }
}

/// Goal state held in a PhysicalNode's spec
pub fn goal_state_from_spec(spec: &Value) -> Option<GoalStateRecord> {
    let slurm = spec.get("slurmNodeSpec")?;
    Some(GoalStateRecord {
        goal_state: slurm.get("goalState")?.as_str()?.to_string(),
        reason: slurm
            .get("reason")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
            .map(str::to_string),
        manual: spec.get("manual").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Spec patch setting a goal state; the reason is left untouched when absent
pub fn goal_state_patch(goal_state: &str, manual: bool, reason: Option<&str>) -> Value {
    let mut slurm = json!({ "goalState": goal_state });
    if let Some(reason) = reason {
        slurm["reason"] = json!(reason);
    }
    json!({
        "spec": {
            "slurmNodeSpec": slurm,
            "manual": manual,
        }
    })
}

/// Kubernetes client wrapper
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8s client using in-cluster config
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!("Connected to Kubernetes API server");
        Ok(Self { client })
    }

    /// Get node API
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// PhysicalNode API in `namespace`
    pub fn physical_nodes(&self, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(
            PHYSICAL_NODE_GROUP,
            PHYSICAL_NODE_VERSION,
            PHYSICAL_NODE_KIND,
        );
        let resource = ApiResource::from_gvk_with_plural(&gvk, PHYSICAL_NODE_PLURAL);
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }

    /// Get a node by name
    pub async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .with_context(|| format!("Failed to get node: {}", name))
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self
            .nodes()
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;
        Ok(nodes.items)
    }

    async fn try_upsert_taint(&self, node_name: &str, taint: &Taint) -> kube::Result<bool> {
        let mut node = self.nodes().get(node_name).await?;
        let spec = node.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        if !upsert_taint(taints, taint) {
            return Ok(false);
        }
        self.nodes()
            .replace(node_name, &PostParams::default(), &node)
            .await?;
        Ok(true)
    }

    /// Add or update a taint
    ///
    /// Read-modify-replace, retried on optimistic-concurrency conflicts.
    pub async fn upsert_taint(&self, node_name: &str, taint: &Taint) -> Result<()> {
        let policy = RetryPolicy::new(CONFLICT_ATTEMPTS, CONFLICT_BACKOFF);
        let changed = retry_if(
            policy,
            |attempt| {
                if attempt.number > 1 {
                    warn!(node = node_name, attempt = attempt.number, "Conflict detected, retrying");
                }
                self.try_upsert_taint(node_name, taint)
            },
            is_conflict,
        )
        .await
        .with_context(|| format!("Failed to taint node {} with {}", node_name, taint.key))?;

        if changed {
            info!(
                node = node_name,
                key = %taint.key,
                value = %taint.value,
                effect = %taint.effect,
                "Taint added to node"
            );
        } else {
            debug!(node = node_name, key = %taint.key, "Taint already exists");
        }
        Ok(())
    }

    /// Add or overwrite a label
    pub async fn add_label(&self, node_name: &str, key: &str, value: &str) -> Result<()> {
        let patch = json!({
            "metadata": {
                "labels": { key: value }
            }
        });

        let params = PatchParams::apply(FIELD_MANAGER);
        self.nodes()
            .patch(node_name, &params, &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to label node: {}", node_name))?;

        info!(node = node_name, key = key, value = value, "Label added to node");
        Ok(())
    }

    /// Spec of a PhysicalNode, `None` if it does not exist
    pub async fn get_physical_node_spec(&self, name: &str) -> Result<Option<Value>> {
        let namespace = pod_namespace()?;
        let object = self
            .physical_nodes(&namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get physical node {}", name))?;
        Ok(object.map(|o| o.data.get("spec").cloned().unwrap_or(Value::Null)))
    }

    pub async fn patch_physical_node(&self, name: &str, patch: &Value) -> Result<()> {
        let namespace = pod_namespace()?;
        let params = PatchParams::apply(FIELD_MANAGER);
        self.physical_nodes(&namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await
            .with_context(|| format!("Failed to update physical node {}", name))?;
        Ok(())
    }
}
