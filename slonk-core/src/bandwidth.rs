//! Multi-node bandwidth search
//!
//! Finds nodes that drag down collective bandwidth. `pairwise` measures every
//! node against both of its ring neighbours; `bisect` halves the node set
//! towards the slower half until few enough nodes remain for a pairwise pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::CheckError;
use crate::exec::{CommandRunner, ExecError, ExecOptions};
use crate::probes::nccl_env;
use crate::profile::ClusterProfile;

/// Relative drop below the median that marks a node suspicious
const SUSPICIOUS_DROP: f64 = 0.1;
/// Relative difference between halves that decides where bisection goes
const BISECT_DELTA: f64 = 0.05;
/// Node count at which bisection switches to pairwise
const BISECT_FLOOR: usize = 3;
const EPSILON: f64 = 1e-5;

const MPI_FLAGS: &str =
    "--map-by ppr:8:node -bind-to numa --mca plm_rsh_agent ssh -mca btl_tcp_if_include eth0";
const GPUS_PER_NODE: usize = 8;

#[derive(Debug, Error)]
pub enum BandwidthError {
    #[error("pairwise test needs at least 2 nodes, got {0}")]
    TooFewNodes(usize),
    #[error("{node} was paired {seen} times, expected 2")]
    Coverage { node: String, seen: usize },
    #[error(transparent)]
    Check(#[from] CheckError),
}

/// Measures collective bandwidth over a set of nodes
#[async_trait]
pub trait PairRunner: Send + Sync {
    /// Bus bandwidth in GB/s; 0 when the run did not complete
    async fn measure(&self, nodes: &[String]) -> Result<f64, CheckError>;
}

pub type NodePair = (String, String);

/// Consecutive pairs around the ring, wrapping from the last node to the first
pub fn ring_pairs(nodes: &[String]) -> Vec<NodePair> {
    nodes
        .iter()
        .zip(nodes.iter().cycle().skip(1))
        .map(|(a, b)| (a.clone(), b.clone()))
        .collect()
}

/// Split off the pairs that can run together: no node twice in one wave
pub fn split_wave(pending: Vec<NodePair>) -> (Vec<NodePair>, Vec<NodePair>) {
    let mut now = Vec::new();
    let mut later = Vec::new();
    let mut taken = std::collections::HashSet::new();
    for (a, b) in pending {
        if taken.contains(&a) || taken.contains(&b) {
            later.push((a, b));
        } else {
            taken.insert(a.clone());
            taken.insert(b.clone());
            now.push((a, b));
        }
    }
    (now, later)
}

/// Sort then shuffle, reproducibly when a seed is given
pub fn shuffled(nodes: &[String], seed: Option<u64>) -> Vec<String> {
    let mut nodes = nodes.to_vec();
    nodes.sort();
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    nodes.shuffle(&mut rng);
    nodes
}

/// Upper median of the scores
fn median(sorted: &[f64]) -> f64 {
    let n = (sorted.len() + 1) / 2;
    sorted.get(n.saturating_sub(1)).copied().unwrap_or(0.0)
}

/// Result of a pairwise pass
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseReport {
    /// Best score each node reached
    pub scores: BTreeMap<String, f64>,
    pub mean: f64,
    pub median: f64,
    /// Nodes that scored 0 or more than 10% below the median, slowest first
    pub suspicious: Vec<String>,
}

impl PairwiseReport {
    fn from_scores(scores: BTreeMap<String, f64>) -> Self {
        let mut ranked: Vec<(&String, f64)> = scores.iter().map(|(n, s)| (n, *s)).collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let values: Vec<f64> = ranked.iter().map(|(_, s)| *s).collect();
        let median = median(&values);
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        let suspicious = ranked
            .iter()
            .filter(|(_, s)| *s == 0.0 || (s - median) / (median + EPSILON) < -SUSPICIOUS_DROP)
            .map(|(n, _)| (*n).clone())
            .collect();

        Self {
            scores,
            mean,
            median,
            suspicious,
        }
    }
}

/// Test every node against both ring neighbours
///
/// Pairs run in waves; pairs within a wave share no node and run
/// concurrently. Each node keeps the better of its two scores.
pub async fn pairwise(
    runner: &dyn PairRunner,
    nodes: &[String],
    seed: Option<u64>,
) -> Result<PairwiseReport, BandwidthError> {
    if nodes.len() < 2 {
        return Err(BandwidthError::TooFewNodes(nodes.len()));
    }
    info!(nodes = nodes.len(), "Running pairwise nccl test on {}", nodes.join(","));

    let nodes = shuffled(nodes, seed);
    let mut pending = ring_pairs(&nodes);
    let mut scores: BTreeMap<String, f64> = BTreeMap::new();
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut wave_number = 0;

    while !pending.is_empty() {
        let (wave, rest) = split_wave(pending);
        pending = rest;
        wave_number += 1;
        debug!(wave = wave_number, pairs = wave.len(), "Starting wave");

        let results = join_all(wave.iter().map(|(a, b)| {
            let pair = vec![a.clone(), b.clone()];
            async move { runner.measure(&pair).await }
        }))
        .await;

        for ((a, b), result) in wave.into_iter().zip(results) {
            let score = result?;
            for node in [a, b] {
                let best = scores.entry(node.clone()).or_insert(0.0);
                *best = best.max(score);
                *seen.entry(node).or_insert(0) += 1;
            }
        }
    }

    for node in &nodes {
        let count = seen.get(node).copied().unwrap_or(0);
        if count != 2 {
            return Err(BandwidthError::Coverage {
                node: node.clone(),
                seen: count,
            });
        }
    }

    let report = PairwiseReport::from_scores(scores);
    info!(
        mean = report.mean,
        median = report.median,
        "Pairwise scores: {:?}",
        report.scores
    );
    info!("Suspicious nodes: {}", report.suspicious.join(","));
    Ok(report)
}

/// Narrow down slow nodes by repeatedly measuring halves
///
/// When both halves perform within 5% of each other both are searched.
pub fn bisect<'a>(
    runner: &'a dyn PairRunner,
    nodes: &'a [String],
    seed: Option<u64>,
) -> BoxFuture<'a, Result<Vec<String>, BandwidthError>> {
    async move {
        info!(nodes = nodes.len(), "Running bisect on {}", nodes.join(","));
        let nodes = shuffled(nodes, seed);

        if nodes.len() <= BISECT_FLOOR {
            info!(
                nodes = nodes.len(),
                "Down to {} nodes, switching to pairwise",
                nodes.len()
            );
            return Ok(pairwise(runner, &nodes, seed).await?.suspicious);
        }

        let (a, b): (Vec<_>, Vec<_>) = nodes
            .iter()
            .cloned()
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);
        let a: Vec<String> = a.into_iter().map(|(_, n)| n).collect();
        let b: Vec<String> = b.into_iter().map(|(_, n)| n).collect();

        let a_score = runner.measure(&a).await?;
        info!("Measurement of {}: {:.1}", a.join(","), a_score);
        let b_score = runner.measure(&b).await?;
        info!("Measurement of {}: {:.1}", b.join(","), b_score);

        let delta = (a_score - b_score) / (EPSILON + a_score.max(b_score));
        if delta >= BISECT_DELTA {
            bisect(runner, &b, seed).await
        } else if delta <= -BISECT_DELTA {
            bisect(runner, &a, seed).await
        } else {
            info!("Performance was similar. Bisecting both halves.");
            let mut slow = bisect(runner, &a, seed).await?;
            slow.extend(bisect(runner, &b, seed).await?);
            Ok(slow)
        }
    }
    .boxed()
}

/// Runs `all_reduce_perf` across nodes with mpirun, launched over ssh
pub struct NcclPairRunner {
    exec: Arc<dyn CommandRunner>,
    profile: Arc<ClusterProfile>,
    message_bytes: u64,
    operation: String,
    timeout: Duration,
    dry_run: bool,
}

impl NcclPairRunner {
    pub fn new(exec: Arc<dyn CommandRunner>, profile: Arc<ClusterProfile>) -> Self {
        Self {
            exec,
            profile,
            message_bytes: 2 * 1024 * 1024 * 1024,
            operation: "all_reduce".to_string(),
            timeout: Duration::from_secs(60),
            dry_run: false,
        }
    }

    pub fn message_bytes(mut self, bytes: u64) -> Self {
        self.message_bytes = bytes;
        self
    }

    /// NCCL test to run, e.g. `all_gather` for `all_gather_perf`
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn command(&self, nodes: &[String]) -> String {
        let mut env = nccl_env(&self.profile);
        env.retain(|(k, _)| k != "NCCL_DEBUG");
        env.push(("NCCL_DEBUG".to_string(), "INFO".to_string()));
        let nccl_flags = env
            .iter()
            .map(|(k, v)| format!("-x {}='{}'", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        let hosts = nodes
            .iter()
            .map(|h| format!("{}:{}", h, GPUS_PER_NODE))
            .collect::<Vec<_>>()
            .join(",");
        let main_node = nodes.first().map(String::as_str).unwrap_or_default();
        format!(
            "ssh {} \"mpirun {} -H {} -np {} {} {}_perf -g 1 -f 2 -b {} -e {}\"",
            main_node,
            MPI_FLAGS,
            hosts,
            nodes.len() * GPUS_PER_NODE,
            nccl_flags,
            self.operation,
            self.message_bytes,
            self.message_bytes
        )
    }
}

/// Bus bandwidth and error count from the result row for `size`
fn parse_result(output: &str, size: &str) -> Option<(f64, u64)> {
    let line = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with("# "))
        .find(|l| l.contains(size))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&size) || tokens.len() < 3 {
        return None;
    }
    let busbw = tokens[tokens.len() - 2].parse().ok()?;
    let errors = tokens[tokens.len() - 1].parse().ok()?;
    Some((busbw, errors))
}

#[async_trait]
impl PairRunner for NcclPairRunner {
    async fn measure(&self, nodes: &[String]) -> Result<f64, CheckError> {
        let command = self.command(nodes);
        info!(nodes = nodes.len(), "Running nccl test on {}", nodes.join(","));
        debug!(command = %command, "Running command");
        if self.dry_run {
            info!("[DRY-RUN] Would run {}", command);
            return Ok(0.0);
        }

        let output = match self
            .exec
            .run(&command, &ExecOptions::new().timeout(self.timeout))
            .await
        {
            Ok(output) => output,
            Err(e @ ExecError::Timeout { .. }) => {
                error!("{}", e);
                error!(
                    "You may still have processes lingering on nodes. Run `pdsh -w '{}' pkill {}_perf`",
                    nodes.join(","),
                    self.operation
                );
                return Ok(0.0);
            }
            Err(e) => {
                error!("Command {} failed:\n{}", command, e.output());
                return Ok(0.0);
            }
        };

        let size = self.message_bytes.to_string();
        match parse_result(&output.stdout, &size) {
            Some((_, errors)) if errors > 0 => {
                let msg = format!("Non-zero errors ({}) on nccl test of {:?}", errors, nodes);
                error!("{}", msg);
                Err(CheckError::manual(
                    "NCCLTest",
                    "NCCLTestFailure",
                    format!("{}\n{}", msg, output.stdout),
                ))
            }
            Some((busbw, _)) => Ok(busbw),
            None => {
                warn!(nodes = ?nodes, "No result row in nccl output");
                Ok(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Mutex, PoisonError};

    use crate::exec::{MockExecutor, MockResponse};
    use crate::probes::testing::profile;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("n{}", i)).collect()
    }

    /// Scores 100 unless a slow node takes part
    struct FakeRunner {
        slow: HashSet<String>,
        dead: HashSet<String>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeRunner {
        fn new(slow: &[&str], dead: &[&str]) -> Self {
            Self {
                slow: slow.iter().map(|s| s.to_string()).collect(),
                dead: dead.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait]
    impl PairRunner for FakeRunner {
        async fn measure(&self, nodes: &[String]) -> Result<f64, CheckError> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(nodes.to_vec());
            if nodes.iter().any(|n| self.dead.contains(n)) {
                Ok(0.0)
            } else if nodes.iter().any(|n| self.slow.contains(n)) {
                Ok(10.0)
            } else {
                Ok(100.0)
            }
        }
    }

    #[test]
    fn test_every_node_in_two_ring_pairs() {
        for n in 2..12 {
            let nodes = names(n);
            let pairs = ring_pairs(&nodes);
            assert_eq!(pairs.len(), n);
            for node in &nodes {
                let count = pairs
                    .iter()
                    .filter(|(a, b)| a == node || b == node)
                    .count();
                assert_eq!(count, 2, "{} with {} nodes", node, n);
            }
        }
    }

    #[test]
    fn test_waves_never_share_a_node() {
        for n in 2..12 {
            let mut pending = ring_pairs(&names(n));
            let mut total = 0;
            while !pending.is_empty() {
                let (wave, rest) = split_wave(pending);
                assert!(!wave.is_empty());
                let mut used = HashSet::new();
                for (a, b) in &wave {
                    assert!(used.insert(a.clone()));
                    assert!(used.insert(b.clone()));
                }
                total += wave.len();
                pending = rest;
            }
            assert_eq!(total, n);
        }
    }

    #[test]
    fn test_seeded_shuffle_is_stable() {
        let nodes = names(10);
        assert_eq!(shuffled(&nodes, Some(7)), shuffled(&nodes, Some(7)));
        let mut sorted = shuffled(&nodes, Some(7));
        sorted.sort();
        let mut expected = nodes.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_suspicious_nodes() {
        let scores: BTreeMap<String, f64> = [("a", 100.0), ("b", 95.0), ("c", 80.0), ("d", 0.0)]
            .into_iter()
            .map(|(n, s)| (n.to_string(), s))
            .collect();
        let report = PairwiseReport::from_scores(scores);
        assert_eq!(report.median, 80.0);
        assert_eq!(report.suspicious, vec!["d"]);

        let scores: BTreeMap<String, f64> = [("a", 100.0), ("b", 100.0), ("c", 50.0)]
            .into_iter()
            .map(|(n, s)| (n.to_string(), s))
            .collect();
        assert_eq!(PairwiseReport::from_scores(scores).suspicious, vec!["c"]);
    }

    #[tokio::test]
    async fn test_pairwise_finds_dead_node() {
        let runner = FakeRunner::new(&[], &["n3"]);
        let report = pairwise(&runner, &names(6), Some(1)).await.unwrap();

        assert_eq!(runner.calls().len(), 6);
        assert_eq!(report.scores.len(), 6);
        assert_eq!(report.suspicious, vec!["n3"]);
        assert_eq!(report.scores["n3"], 0.0);
    }

    #[tokio::test]
    async fn test_pairwise_needs_two_nodes() {
        let runner = FakeRunner::new(&[], &[]);
        let result = pairwise(&runner, &names(1), None).await;
        assert!(matches!(result, Err(BandwidthError::TooFewNodes(1))));
    }

    #[tokio::test]
    async fn test_bisect_narrows_to_slow_node() {
        let runner = FakeRunner::new(&["n4"], &[]);
        let slow = bisect(&runner, &names(6), Some(3)).await.unwrap();
        assert_eq!(slow, vec!["n4"]);
    }

    #[tokio::test]
    async fn test_bisect_small_set_is_pairwise() {
        let runner = FakeRunner::new(&[], &[]);
        let slow = bisect(&runner, &names(3), None).await.unwrap();
        assert!(slow.is_empty());
        assert!(runner.calls().iter().all(|c| c.len() == 2));
    }

    const NCCL_OUTPUT: &str = "\
# nThread 1 nGpus 1 minBytes 1024 maxBytes 1024 step: 2(factor) warmup iters: 5 iters: 20
#       size         count      type   redop    root     time   algbw   busbw #wrong     time   algbw   busbw #wrong
        1024           256     float     sum      -1    12590  170.57  319.83      0    12555  171.05  320.71      0
# Out of bounds values : 0 OK
";

    #[test]
    fn test_parse_result() {
        assert_eq!(parse_result(NCCL_OUTPUT, "1024"), Some((320.71, 0)));
        assert_eq!(parse_result("nothing here", "1024"), None);
    }

    #[tokio::test]
    async fn test_nccl_runner() {
        let exec = Arc::new(MockExecutor::new());
        exec.on("mpirun", MockResponse::stdout(NCCL_OUTPUT));
        let runner = NcclPairRunner::new(exec.clone(), Arc::new(profile("cluster-tcpx")))
            .message_bytes(1024);

        let nodes = vec!["a".to_string(), "b".to_string()];
        assert_eq!(runner.measure(&nodes).await.unwrap(), 320.71);

        let call = &exec.calls()[0];
        assert!(call.starts_with("ssh a \"mpirun"));
        assert!(call.contains("-H a:8,b:8 -np 16"));
        assert!(call.contains("all_reduce_perf -g 1 -f 2 -b 1024 -e 1024"));
        assert!(call.contains("-x NCCL_DEBUG='INFO'"));
    }

    #[tokio::test]
    async fn test_nccl_runner_failures_score_zero() {
        let exec = Arc::new(MockExecutor::new());
        exec.on("mpirun", MockResponse::Timeout);
        let runner = NcclPairRunner::new(exec.clone(), Arc::new(profile("cluster-tcpx")));
        let nodes = vec!["a".to_string(), "b".to_string()];
        assert_eq!(runner.measure(&nodes).await.unwrap(), 0.0);

        exec.on("mpirun", MockResponse::fail(1, "boom"));
        assert_eq!(runner.measure(&nodes).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_nccl_runner_errors_need_manual() {
        let exec = Arc::new(MockExecutor::new());
        exec.on(
            "mpirun",
            MockResponse::stdout(NCCL_OUTPUT.replace("320.71      0", "320.71      3")),
        );
        let runner = NcclPairRunner::new(exec, Arc::new(profile("cluster-tcpx"))).message_bytes(1024);
        let err = runner
            .measure(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "NCCLTestFailure");
    }
}
