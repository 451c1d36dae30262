//! Slurm control wrapper
//!
//! Thin layer over `scontrol`. Mutating calls run elevated and honour dry-run.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::exec::{CommandRunner, ExecOptions};

pub struct Scontrol {
    exec: Arc<dyn CommandRunner>,
    dry_run: bool,
}

impl Scontrol {
    pub fn new(exec: Arc<dyn CommandRunner>) -> Self {
        Self {
            exec,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn query(&self, command: &str) -> Result<String> {
        let output = self
            .exec
            .run(command, &ExecOptions::new())
            .await
            .with_context(|| format!("scontrol query failed: {}", command))?;
        Ok(output.stdout)
    }

    async fn update(&self, command: &str) -> Result<()> {
        let opts = ExecOptions::new().elevated().dry_run(self.dry_run);
        self.exec
            .run(command, &opts)
            .await
            .with_context(|| format!("scontrol update failed: {}", command))?;
        Ok(())
    }

    /// Return drained nodes to service; accepts a hostlist expression
    pub async fn resume_node(&self, nodes: &str) -> Result<()> {
        info!(nodes = %nodes, "Resuming slurm nodes");
        self.update(&format!("scontrol update nodename={} state=resume reason=", nodes))
            .await
    }

    pub async fn drain_node(&self, node: &str, reason: &str) -> Result<()> {
        info!(node = %node, reason = %reason, "Draining slurm node");
        let reason = reason.replace('"', "'");
        self.update(&format!(
            "scontrol update nodename={} state=drain reason=\"{}\"",
            node, reason
        ))
        .await
    }

    /// Ask slurm to reboot the node as soon as its jobs finish
    pub async fn reboot_asap(&self, host: &str) -> Result<()> {
        info!(host = %host, "Requesting slurm reboot");
        self.update(&format!("scontrol reboot asap {}", host)).await
    }

    /// `node[1-3]` to `node1 node2 node3`
    pub async fn expand_hostlist(&self, hostlist: &str) -> Result<Vec<String>> {
        let output = self
            .query(&format!("scontrol show hostnames '{}'", hostlist))
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Inverse of [`Scontrol::expand_hostlist`]
    pub async fn collapse_hostlist(&self, hosts: &[String]) -> Result<String> {
        let output = self
            .query(&format!("scontrol show hostlistsorted '{}'", hosts.join(" ")))
            .await?;
        Ok(output.lines().next().unwrap_or_default().trim().to_string())
    }

    /// Raw `scontrol show node` dump
    pub async fn show_nodes(&self) -> Result<String> {
        self.query("scontrol show node").await
    }
}
