//! Slonk
//!
//! Node health checks and remediation for Slurm-on-Kubernetes clusters.
//! Runs diagnostics on the node it is deployed to, classifies failures and
//! taints, labels or power cycles unhealthy nodes.

mod cli;
mod config;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use regex::Regex;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command, LifecycleAction};
use config::Config;
use slonk_core::bandwidth::{self, NcclPairRunner};
use slonk_core::cluster::{ClusterDirectory, Detached, NodeActuator};
use slonk_core::drains::{self, DrainFilter, TIME_FORMAT};
use slonk_core::error::CheckError;
use slonk_core::exec::{CommandRunner, ShellExecutor};
use slonk_core::fingerprint::fingerprint;
use slonk_core::lifecycle;
use slonk_core::metrics::{MetricsBuffer, MetricsRegistry};
use slonk_core::mitigation::MitigationDispatcher;
use slonk_core::orchestrator::{CheckOrchestrator, ExitStatus, RunMode, RunOutcome, RunReport};
use slonk_core::probes::{ProbeContext, ProbeRegistry};
use slonk_core::profile::{ClusterProfile, ProfileInputs};
use slonk_core::slurm::Scontrol;
use slonk_k8s::{K8sClient, NodeOperator};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Shared handles for every subcommand
struct Runtime {
    config: Config,
    exec: Arc<dyn CommandRunner>,
    metrics: Arc<MetricsRegistry>,
}

impl Runtime {
    fn new(config: Config) -> Self {
        Self {
            config,
            exec: Arc::new(ShellExecutor::new()),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    fn profile(&self) -> Result<Arc<ClusterProfile>> {
        self.derive_profile(ProfileInputs::from_env())
    }

    fn derive_profile(&self, mut inputs: ProfileInputs) -> Result<Arc<ClusterProfile>> {
        if self.config.node_name.is_some() {
            inputs.node_name = self.config.node_name.clone();
        }
        let profile = ClusterProfile::derive(&inputs).context("Failed to detect cluster profile")?;
        info!(
            cluster = %profile.cluster_name,
            node = %profile.node_name,
            accelerator = %profile.accelerator,
            fabric = %profile.fabric,
            "Detected cluster profile"
        );
        Ok(Arc::new(profile))
    }

    fn scontrol(&self) -> Scontrol {
        Scontrol::new(self.exec.clone()).dry_run(self.config.dry_run)
    }

    fn context(&self, profile: Arc<ClusterProfile>, cluster: Arc<dyn ClusterDirectory>) -> ProbeContext {
        ProbeContext::new(
            profile,
            self.exec.clone(),
            cluster,
            Arc::new(self.config.probes.clone()),
        )
    }

    fn dispatcher(
        &self,
        actuator: Arc<dyn NodeActuator>,
        profile: Arc<ClusterProfile>,
    ) -> Arc<MitigationDispatcher> {
        Arc::new(MitigationDispatcher::new(
            actuator,
            self.exec.clone(),
            profile,
            self.metrics.clone(),
            self.config.dry_run,
        ))
    }

    fn pair_runner(&self, profile: Arc<ClusterProfile>) -> NcclPairRunner {
        NcclPairRunner::new(self.exec.clone(), profile).dry_run(self.config.dry_run)
    }
}

/// Connect to the orchestration API, falling back to a detached stand-in
async fn connect_cluster() -> (Arc<dyn ClusterDirectory>, Arc<dyn NodeActuator>) {
    match K8sClient::new().await {
        Ok(client) => {
            let operator = Arc::new(NodeOperator::new(client));
            let directory: Arc<dyn ClusterDirectory> = operator.clone();
            let actuator: Arc<dyn NodeActuator> = operator;
            (directory, actuator)
        }
        Err(e) => {
            warn!(error = %e, "Kubernetes API unavailable, running detached");
            let directory: Arc<dyn ClusterDirectory> = Arc::new(Detached);
            let actuator: Arc<dyn NodeActuator> = Arc::new(Detached);
            (directory, actuator)
        }
    }
}

fn log_report(report: &RunReport) {
    match &report.outcome {
        RunOutcome::Passed => info!(
            mode = %report.mode,
            probes = report.executed.len(),
            "All health checks passed"
        ),
        RunOutcome::Failed { probe, error } => {
            error!(
                mode = %report.mode,
                probe = %probe,
                kind = %error.kind(),
                reason = %error.reason(),
                "Health check failed: {}",
                error
            );
            if let Some(mitigation) = &report.mitigation {
                info!(remediation = %mitigation.remediation, steps = mitigation.steps.len(), "Mitigation applied");
            }
        }
        RunOutcome::Errored { probe, error } => error!(
            mode = %report.mode,
            probe = %probe,
            "Health check errored: {:?}",
            error
        ),
    }
}

/// Profile for a health run; setup failures exit as unclassified
fn health_profile(
    rt: &Runtime,
    inputs: ProfileInputs,
) -> std::result::Result<Arc<ClusterProfile>, i32> {
    rt.derive_profile(inputs).map_err(|e| {
        error!(error = ?e, "Health check setup failed");
        ExitStatus::Unknown.code()
    })
}

async fn health(
    rt: &Runtime,
    mode: RunMode,
    no_mitigation: bool,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<i32> {
    let profile = match health_profile(rt, ProfileInputs::from_env()) {
        Ok(profile) => profile,
        Err(code) => return Ok(code),
    };
    let (directory, actuator) = connect_cluster().await;
    let ctx = rt.context(profile.clone(), directory);

    let mut orchestrator = CheckOrchestrator::new(ProbeRegistry::standard(), ctx, rt.metrics.clone());
    if !(no_mitigation || rt.config.no_mitigation) {
        orchestrator = orchestrator.with_mitigation(rt.dispatcher(actuator, profile));
    }

    let report = if mode == RunMode::Continuous {
        if rt.config.metrics.enabled {
            let buffer = Arc::new(MetricsBuffer::new(rt.config.metrics.prefix.clone()));
            let port = rt.config.metrics.port;
            let rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = server::serve(port, buffer, rx).await {
                    error!(error = %e, "Metrics server failed");
                }
            });
        }
        orchestrator
            .run_continuous(rt.config.continuous_interval, shutdown_rx)
            .await
    } else {
        orchestrator.run(mode).await
    };

    log_report(&report);
    Ok(report.exit_status().code())
}

async fn reboot(rt: &Runtime) -> Result<()> {
    let profile = rt.profile()?;
    let (_, actuator) = connect_cluster().await;
    let failure = CheckError::power_cycle("ManualReboot", "ManualRebootRequested", "manual power cycle");
    rt.dispatcher(actuator, profile)
        .dispatch(&failure)
        .await
        .context("Failed to power cycle node")?;
    Ok(())
}

fn parse_time(raw: Option<&str>) -> Result<Option<NaiveDateTime>> {
    raw.map(|s| {
        NaiveDateTime::parse_from_str(s, TIME_FORMAT)
            .with_context(|| format!("Invalid time {:?}, expected {}", s, TIME_FORMAT))
    })
    .transpose()
}

async fn drains(
    rt: &Runtime,
    start: Option<String>,
    end: Option<String>,
    reason: &str,
    undrain: bool,
    yes: bool,
) -> Result<()> {
    let filter = DrainFilter {
        start: parse_time(start.as_deref())?,
        end: parse_time(end.as_deref())?,
        reason: Regex::new(reason).with_context(|| format!("Invalid reason pattern {:?}", reason))?,
    };
    let scontrol = rt.scontrol();
    let nodes = drains::drained_nodes(&scontrol, &filter).await?;
    info!(count = nodes.len(), "Matching drained nodes");

    if nodes.is_empty() || !undrain {
        return Ok(());
    }
    if !yes {
        warn!(count = nodes.len(), "Pass --yes to resume these nodes");
        return Ok(());
    }
    drains::undrain(&scontrol, &nodes).await
}

async fn pairwise(rt: &Runtime, hostlist: &str, seed: Option<u64>, bisect: bool) -> Result<()> {
    let profile = rt.profile()?;
    let scontrol = rt.scontrol();
    let nodes = scontrol.expand_hostlist(hostlist).await?;
    let runner = rt.pair_runner(profile);

    let suspicious = if bisect {
        bandwidth::bisect(&runner, &nodes, seed).await?
    } else {
        bandwidth::pairwise(&runner, &nodes, seed).await?.suspicious
    };

    if suspicious.is_empty() {
        info!("No suspicious nodes found");
    } else {
        let collapsed = scontrol.collapse_hostlist(&suspicious).await?;
        warn!(count = suspicious.len(), nodes = %collapsed, "Suspicious nodes found");
        println!("{}", collapsed);
    }
    Ok(())
}

async fn lifecycle_action(rt: &Runtime, action: LifecycleAction) -> Result<()> {
    let profile = rt.profile()?;
    let (directory, actuator) = connect_cluster().await;
    let ctx = rt.context(profile, directory);
    match action {
        LifecycleAction::Drain { reason } => {
            lifecycle::drain(&ctx, actuator.as_ref(), &reason, rt.config.dry_run).await?;
        }
        LifecycleAction::Undrain => {
            lifecycle::undrain(&ctx, actuator.as_ref(), rt.config.dry_run).await?;
        }
    }
    Ok(())
}

fn shutdown_channel() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    shutdown_rx
}

async fn run(cli: Cli, config: Config) -> Result<i32> {
    let rt = Runtime::new(config);
    let shutdown_rx = shutdown_channel();

    match cli.command {
        Command::Health {
            mode,
            no_mitigation,
        } => return health(&rt, mode, no_mitigation, shutdown_rx).await,
        Command::Reboot => reboot(&rt).await?,
        Command::Drains {
            start,
            end,
            reason,
            undrain,
            yes,
        } => drains(&rt, start, end, &reason, undrain, yes).await?,
        Command::Pairwise { nodes, seed } => pairwise(&rt, &nodes, seed, false).await?,
        Command::Bisect { nodes, seed } => pairwise(&rt, &nodes, seed, true).await?,
        Command::Fingerprint => {
            let profile = rt.profile()?;
            let physical_node = fingerprint(rt.exec.as_ref(), &profile, &rt.config.probes).await?;
            println!("{}", physical_node);
        }
        Command::Lifecycle { action } => lifecycle_action(&rt, action).await?,
        Command::ServeMetrics => {
            let buffer = Arc::new(MetricsBuffer::new(rt.config.metrics.prefix.clone()));
            server::serve(rt.config.metrics.port, buffer, shutdown_rx).await?;
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Slonk starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.node_name.is_some() {
        config.node_name = cli.node_name.clone();
    }

    config = config.with_env_overrides();
    config.validate().context("Invalid configuration")?;

    info!(dry_run = config.dry_run, "Configuration loaded");

    let code = run(cli, config).await?;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_setup_failure_is_unclassified() {
        let rt = Runtime::new(Config::default());
        let missing_cluster = ProfileInputs {
            hostname: "node-1".into(),
            ..ProfileInputs::default()
        };
        assert_eq!(health_profile(&rt, missing_cluster).unwrap_err(), 240);
    }

    #[test]
    fn test_health_profile_applies_node_name_override() {
        let mut config = Config::default();
        config.node_name = Some("slurm-node-7".into());
        let rt = Runtime::new(config);
        let inputs = ProfileInputs {
            cluster_name: Some("cluster1".into()),
            hostname: "node-1".into(),
            ..ProfileInputs::default()
        };
        let profile = health_profile(&rt, inputs).unwrap();
        assert_eq!(profile.node_name, "slurm-node-7");
        assert_eq!(profile.hostname, "node-1");
    }
}
