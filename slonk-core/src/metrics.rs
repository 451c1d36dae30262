//! Prometheus metrics and the pushed job-metrics buffer

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};
use regex::Regex;
use serde_json::Value;

use crate::error::CheckKind;
use crate::probes::ProbeId;
use crate::state_machine::RunState;

/// Probe duration histogram
static PROBE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "slonk_probe_duration_seconds",
        "Duration of health check probes",
        &["probe"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0]
    )
    .expect("Failed to create probe_duration metric")
});

/// Probe failure counter
static PROBE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("slonk_probe_failures_total", "Total number of probe failures"),
        &["probe", "kind", "reason"]
    )
    .expect("Failed to create probe_failures metric")
});

/// Mitigation action counter
static MITIGATION_ACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("slonk_mitigation_actions_total", "Total number of mitigation actions"),
        &["action"]
    )
    .expect("Failed to create mitigation_actions metric")
});

/// Health run counter
static HEALTH_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("slonk_health_runs_total", "Total number of health check runs"),
        &["mode", "outcome"]
    )
    .expect("Failed to create health_runs metric")
});

/// Current run state (0=idle, 1=running, 2=passed, 3=failed, 4=errored)
static RUN_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("slonk_run_state", "Current health run state"))
        .expect("Failed to create run_state metric")
});

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*PROBE_DURATION;
        let _ = &*PROBE_FAILURES;
        let _ = &*MITIGATION_ACTIONS;
        let _ = &*HEALTH_RUNS;
        let _ = &*RUN_STATE;
        Self
    }

    pub fn observe_probe_duration(&self, probe: ProbeId, duration_secs: f64) {
        PROBE_DURATION
            .with_label_values(&[probe.as_str()])
            .observe(duration_secs);
    }

    /// Count a classified probe failure
    pub fn inc_probe_failure(&self, probe: ProbeId, kind: CheckKind, reason: &str) {
        PROBE_FAILURES
            .with_label_values(&[probe.as_str(), kind.as_str(), reason])
            .inc();
    }

    /// Count a probe that failed without a classification
    pub fn inc_probe_error(&self, probe: ProbeId) {
        PROBE_FAILURES
            .with_label_values(&[probe.as_str(), "unclassified", ""])
            .inc();
    }

    pub fn inc_mitigation_action(&self, action: &str) {
        MITIGATION_ACTIONS.with_label_values(&[action]).inc();
    }

    pub fn inc_health_run(&self, mode: &str, outcome: &str) {
        HEALTH_RUNS.with_label_values(&[mode, outcome]).inc();
    }

    pub fn set_run_state(&self, state: &RunState) {
        let value = match state {
            RunState::Idle => 0,
            RunState::Running(_) => 1,
            RunState::Passed => 2,
            RunState::Failed(_) => 3,
            RunState::Errored => 4,
        };
        RUN_STATE.set(value);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W").expect("valid regex"));

/// Normalise a metric or label name: `/` becomes `_`, other non-word characters are dropped
pub fn clean_name(name: &str) -> String {
    NON_WORD.replace_all(&name.replace('/', "_"), "").into_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("metric record is missing {0}")]
    Missing(&'static str),
    #[error("metric record field {0} must be a string")]
    NotAString(&'static str),
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Metrics pushed by jobs, held until the next scrape
///
/// Each scrape drains the buffer: a series is exported once and then
/// forgotten until it is written again.
#[derive(Debug)]
pub struct MetricsBuffer {
    prefix: String,
    series: Mutex<HashMap<String, String>>,
}

impl MetricsBuffer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Render one `{__name__, __value__, label...}` record as (series, value)
    fn render(&self, record: &serde_json::Map<String, Value>) -> Result<(String, String), RecordError> {
        let name = record
            .get("__name__")
            .ok_or(RecordError::Missing("__name__"))?
            .as_str()
            .ok_or(RecordError::NotAString("__name__"))?;
        let value = record
            .get("__value__")
            .ok_or(RecordError::Missing("__value__"))?;

        let labels: BTreeMap<String, String> = record
            .iter()
            .filter(|(k, _)| k.as_str() != "__name__" && k.as_str() != "__value__")
            .map(|(k, v)| (clean_name(k), render_value(v)))
            .collect();
        let labels = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect::<Vec<_>>()
            .join(",");

        Ok((
            format!("{}_{}{{{}}}", self.prefix, clean_name(name), labels),
            render_value(value),
        ))
    }

    /// Store a batch of records, replacing older values of the same series
    ///
    /// The batch is validated as a whole; nothing is stored if any record is
    /// malformed.
    pub fn write(&self, records: &[serde_json::Map<String, Value>]) -> Result<usize, RecordError> {
        let rendered = records
            .iter()
            .map(|r| self.render(r))
            .collect::<Result<Vec<_>, _>>()?;
        let count = rendered.len();
        self.series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(rendered);
        Ok(count)
    }

    /// Take every buffered series as `series value` lines, leaving the buffer empty
    pub fn drain(&self) -> String {
        let taken = std::mem::take(&mut *self.series.lock().unwrap_or_else(PoisonError::into_inner));
        let mut lines: Vec<String> = taken
            .into_iter()
            .map(|(series, value)| format!("{} {}\n", series, value))
            .collect();
        lines.sort();
        lines.concat()
    }

    pub fn len(&self) -> usize {
        self.series.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::RunMode;
    use serde_json::json;

    fn records(value: Value) -> Vec<serde_json::Map<String, Value>> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();
        registry.observe_probe_duration(ProbeId::AcceleratorSanity, 1.5);
        registry.inc_probe_failure(ProbeId::DiskUsage, CheckKind::Manual, "DiskAlmostFull");
        registry.inc_probe_error(ProbeId::CpuLoad);
        registry.inc_mitigation_action("taint_manual");
        registry.inc_health_run("fast", "passed");
        registry.set_run_state(&RunState::Running(RunMode::Fast));
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("train/loss"), "train_loss");
        assert_eq!(clean_name("tokens-per.sec"), "tokenspersec");
    }

    #[test]
    fn test_write_and_drain() {
        let buffer = MetricsBuffer::new("jobmetrics");
        let written = buffer
            .write(&records(json!([
                {"__name__": "train/loss", "__value__": 1.25, "job": "42", "host": "node-1"},
                {"__name__": "step", "__value__": 100}
            ])))
            .unwrap();
        assert_eq!(written, 2);

        assert_eq!(
            buffer.drain(),
            "jobmetrics_step{} 100\njobmetrics_train_loss{host=\"node-1\",job=\"42\"} 1.25\n"
        );
        assert!(buffer.is_empty());
        assert_eq!(buffer.drain(), "");
    }

    #[test]
    fn test_latest_value_wins() {
        let buffer = MetricsBuffer::new("jobmetrics");
        buffer
            .write(&records(json!([{"__name__": "step", "__value__": 1}])))
            .unwrap();
        buffer
            .write(&records(json!([{"__name__": "step", "__value__": 2}])))
            .unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.drain(), "jobmetrics_step{} 2\n");
    }

    #[test]
    fn test_malformed_batch_is_rejected() {
        let buffer = MetricsBuffer::new("jobmetrics");
        let result = buffer.write(&records(json!([
            {"__name__": "ok", "__value__": 1},
            {"__value__": 2}
        ])));
        assert!(matches!(result, Err(RecordError::Missing("__name__"))));
        assert!(buffer.is_empty());
    }
}
