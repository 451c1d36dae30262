//! CLI argument parsing for Slonk

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use slonk_core::orchestrator::RunMode;

/// Slonk - node health checks and remediation for Slurm-on-Kubernetes clusters
#[derive(Debug, Parser)]
#[command(name = "slonk")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/slonk/config.yaml", global = true)]
    pub config: PathBuf,

    /// Node name (overrides config and NODE_NAME env)
    #[arg(long, env = "NODE_NAME", global = true)]
    pub node_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SLONK_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "SLONK_LOG_JSON", global = true)]
    pub log_json: bool,

    /// Dry run mode - log actions but don't execute
    #[arg(long, default_value = "false", global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run health checks
    Health {
        /// fast, all, noninvasive, continuous or lifecycle
        #[arg(long, default_value = "all")]
        mode: RunMode,

        /// Report failures without mitigating them
        #[arg(long)]
        no_mitigation: bool,
    },

    /// Power cycle the current node
    Reboot,

    /// Filter drained nodes by time frame and reason
    Drains {
        /// Only drains at or after this time (YYYY-MM-DDTHH:MM:SS)
        #[arg(long)]
        start: Option<String>,

        /// Only drains at or before this time (YYYY-MM-DDTHH:MM:SS)
        #[arg(long)]
        end: Option<String>,

        /// Regex the drain reason must match
        #[arg(long, default_value = ".*")]
        reason: String,

        /// Resume the matching nodes
        #[arg(long)]
        undrain: bool,

        /// Confirm --undrain
        #[arg(long, requires = "undrain")]
        yes: bool,
    },

    /// Run the multi-node pairwise bandwidth search
    Pairwise {
        /// Slurm hostlist, e.g. node-[1-16]
        nodes: String,

        /// Seed for the node shuffle
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run the multi-node bandwidth bisection
    Bisect {
        /// Slurm hostlist, e.g. node-[1-16]
        nodes: String,

        /// Seed for the node shuffle
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print this node's physical fingerprint
    Fingerprint,

    /// Manage this node's goal state
    Lifecycle {
        #[command(subcommand)]
        action: LifecycleAction,
    },

    /// Serve Prometheus and job-pushed metrics
    ServeMetrics,
}

#[derive(Debug, Subcommand)]
pub enum LifecycleAction {
    /// Take the node out of slurm
    Drain {
        /// Reason for draining the node
        #[arg(long)]
        reason: String,
    },
    /// Return the node to slurm
    Undrain,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["slonk", "health"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/etc/slonk/config.yaml");
        assert_eq!(cli.log_level, "info");
        assert!(!cli.log_json);
        assert!(!cli.dry_run);
        match cli.command {
            Command::Health {
                mode,
                no_mitigation,
            } => {
                assert_eq!(mode, RunMode::Full);
                assert!(!no_mitigation);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_health_modes() {
        let cli = Cli::try_parse_from(["slonk", "health", "--mode", "all", "--no-mitigation"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Health {
                mode: RunMode::Full,
                no_mitigation: true
            }
        ));
        assert!(Cli::try_parse_from(["slonk", "health", "--mode", "bogus"]).is_err());
    }

    #[test]
    fn test_cli_custom_config() {
        let cli = Cli::try_parse_from(["slonk", "-c", "/custom/config.yaml", "reboot"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/custom/config.yaml");
    }

    #[test]
    fn test_global_dry_run_after_subcommand() {
        let cli = Cli::try_parse_from(["slonk", "reboot", "--dry-run"]).unwrap();
        assert!(cli.dry_run);
    }

    #[test]
    fn test_undrain_confirmation_requires_undrain() {
        assert!(Cli::try_parse_from(["slonk", "drains", "--yes"]).is_err());
        let cli = Cli::try_parse_from(["slonk", "drains", "--undrain", "--yes"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Drains {
                undrain: true,
                yes: true,
                ..
            }
        ));
    }

    #[test]
    fn test_pairwise_args() {
        let cli = Cli::try_parse_from(["slonk", "pairwise", "node-[1-4]", "--seed", "7"]).unwrap();
        match cli.command {
            Command::Pairwise { nodes, seed } => {
                assert_eq!(nodes, "node-[1-4]");
                assert_eq!(seed, Some(7));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle_drain_needs_reason() {
        assert!(Cli::try_parse_from(["slonk", "lifecycle", "drain"]).is_err());
        let cli =
            Cli::try_parse_from(["slonk", "lifecycle", "drain", "--reason", "fan"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Lifecycle {
                action: LifecycleAction::Drain { .. }
            }
        ));
    }
}
