//! Drain reason analysis
//!
//! Parses `scontrol show node` output into the reason and time each node was
//! drained, and filters them by time window and reason pattern.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::NaiveDateTime;
use regex::Regex;
use tracing::info;

use crate::slurm::Scontrol;

const NODE_NAME_PREFIX: &str = "NodeName=";
const REASON_PREFIX: &str = "Reason=";

/// Timestamp format used by slurm and the CLI filters
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReason {
    pub reason: String,
    pub time: NaiveDateTime,
}

fn node_name(line: &str) -> Option<&str> {
    line.split_whitespace()
        .next()?
        .strip_prefix(NODE_NAME_PREFIX)
}

/// `Reason=Prolog error [root@2023-12-24T06:51:08]` into its parts
fn reason_line(line: &str) -> Option<DrainReason> {
    let (_, rest) = line.split_once(REASON_PREFIX)?;
    let reason = rest.split('[').next()?.trim().to_string();
    let stamp = line.split_whitespace().last()?;
    let (_, stamp) = stamp.split_once('@')?;
    let stamp = stamp.strip_suffix(']').unwrap_or(stamp);
    let time = NaiveDateTime::parse_from_str(stamp, TIME_FORMAT).ok()?;
    Some(DrainReason { reason, time })
}

/// Drain reason of every node in a `scontrol show node` dump
///
/// A `Reason=` line belongs to the closest preceding `NodeName=` line. Nodes
/// without one are not drained and do not appear.
pub fn parse_drain_reasons(output: &str) -> BTreeMap<String, DrainReason> {
    let mut reasons = BTreeMap::new();
    let mut current: Option<&str> = None;
    for line in output.lines() {
        if line.contains(NODE_NAME_PREFIX) {
            current = node_name(line);
        } else if line.contains(REASON_PREFIX) {
            if let (Some(node), Some(reason)) = (current, reason_line(line)) {
                reasons.insert(node.to_string(), reason);
            }
        }
    }
    reasons
}

/// Whether `time` falls within the optional, inclusive window
pub fn is_valid(
    time: NaiveDateTime,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
) -> bool {
    start.map_or(true, |s| s <= time) && end.map_or(true, |e| e >= time)
}

/// Filter for drained nodes
#[derive(Debug, Clone)]
pub struct DrainFilter {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub reason: Regex,
}

impl DrainFilter {
    pub fn matches(&self, drain: &DrainReason) -> bool {
        is_valid(drain.time, self.start, self.end) && self.reason.is_match(&drain.reason)
    }
}

/// Drained nodes matching `filter`, logging each one
pub fn matching_nodes(
    reasons: &BTreeMap<String, DrainReason>,
    filter: &DrainFilter,
) -> Vec<String> {
    reasons
        .iter()
        .filter(|(_, drain)| filter.matches(drain))
        .map(|(name, drain)| {
            info!(
                node = %name,
                reason = %drain.reason,
                time = %drain.time,
                "Node was drained"
            );
            name.clone()
        })
        .collect()
}

/// Query slurm for drained nodes matching `filter`
pub async fn drained_nodes(scontrol: &Scontrol, filter: &DrainFilter) -> Result<Vec<String>> {
    let output = scontrol.show_nodes().await?;
    Ok(matching_nodes(&parse_drain_reasons(&output), filter))
}

/// Resume the given nodes in one scontrol call
pub async fn undrain(scontrol: &Scontrol, nodes: &[String]) -> Result<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    let hostlist = scontrol.collapse_hostlist(nodes).await?;
    scontrol.resume_node(&hostlist).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;

    use crate::exec::{MockExecutor, MockResponse};

    const FIXTURE: &str = "NodeName=cluster-h100-9-78 Arch=x86_64 CoresPerSocket=1
   CPUAlloc=0 CPUEfctv=96 CPUTot=96 CPULoad=1.15
   Gres=gpu:8
   NodeAddr=cluster-h100-9-78 NodeHostName=cluster-h100-9-78 Version=23.11.0-0rc1
   State=IDLE+DRAIN+MAINTENANCE+RESERVED ThreadsPerCore=1 TmpDisk=0 Weight=1 Owner=N/A MCS_label=N/A
   BootTime=2023-12-22T11:11:17 SlurmdStartTime=2023-12-22T11:11:17
   Reason=Prolog error: 571 xid 13 errors [root@2023-12-24T06:51:08]
   ReservationName=example

NodeName=cluster-h100-9-69 Arch=x86_64 CoresPerSocket=1
   CPUAlloc=96 CPUEfctv=96 CPUTot=96 CPULoad=49.84
   Gres=gpu:8
   State=ALLOCATED+MAINTENANCE+RESERVED ThreadsPerCore=1 TmpDisk=0 Weight=1 Owner=N/A MCS_label=N/A
   BootTime=2023-12-26T22:19:02 SlurmdStartTime=2023-12-26T22:19:02
   ReservationName=example

NodeName=cluster-h100-9-79 Arch=x86_64 CoresPerSocket=1
   CPUAlloc=0 CPUEfctv=96 CPUTot=96 CPULoad=0.88
   Gres=gpu:8
   State=IDLE+DRAIN+MAINTENANCE+RESERVED ThreadsPerCore=1 TmpDisk=0 Weight=1 Owner=N/A MCS_label=N/A
   Reason=SAM [root@2023-12-25T03:52:00]
   ReservationName=example

NodeName=cluster-h100-9-75 Arch=x86_64 CoresPerSocket=1
   CPUAlloc=96 CPUEfctv=96 CPUTot=96 CPULoad=53.85
   State=ALLOCATED+MAINTENANCE+RESERVED ThreadsPerCore=1 TmpDisk=0 Weight=1 Owner=N/A MCS_label=N/A
   ReservationName=example
";

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 12, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_parse_drain_reasons() {
        let reasons = parse_drain_reasons(FIXTURE);
        assert_eq!(
            reasons["cluster-h100-9-78"],
            DrainReason {
                reason: "Prolog error: 571 xid 13 errors".into(),
                time: at(24, 6, 51, 8),
            }
        );
        assert_eq!(
            reasons["cluster-h100-9-79"],
            DrainReason {
                reason: "SAM".into(),
                time: at(25, 3, 52, 0),
            }
        );
        assert!(!reasons.contains_key("cluster-h100-9-69"));
        assert!(!reasons.contains_key("cluster-h100-9-75"));
    }

    #[test]
    fn test_time_window() {
        let reasons = parse_drain_reasons(FIXTURE);
        let t78 = reasons["cluster-h100-9-78"].time;
        let t79 = reasons["cluster-h100-9-79"].time;

        assert!(is_valid(t78, Some(at(24, 3, 52, 0)), None));
        assert!(!is_valid(t78, Some(at(27, 3, 52, 0)), None));
        assert!(is_valid(t78, None, Some(at(27, 3, 52, 0))));
        assert!(!is_valid(t78, None, Some(at(22, 3, 52, 0))));
        assert!(is_valid(t79, Some(at(21, 3, 52, 0)), Some(at(27, 3, 52, 0))));
        assert!(!is_valid(t79, Some(at(21, 3, 52, 0)), Some(at(24, 3, 52, 0))));
        assert!(!is_valid(t79, Some(at(26, 3, 52, 0)), Some(at(27, 3, 52, 0))));
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let t = at(24, 6, 51, 8);
        assert!(is_valid(t, Some(t), Some(t)));
        assert!(is_valid(t, None, None));
    }

    #[test]
    fn test_reason_filter() {
        let reasons = parse_drain_reasons(FIXTURE);
        let filter = DrainFilter {
            start: None,
            end: None,
            reason: Regex::new("xid").unwrap(),
        };
        assert_eq!(matching_nodes(&reasons, &filter), vec!["cluster-h100-9-78"]);
    }

    #[tokio::test]
    async fn test_undrain_collapses_hostlist() {
        let exec = Arc::new(MockExecutor::new());
        exec.on("scontrol show node", MockResponse::stdout(FIXTURE));
        exec.on(
            "scontrol show hostlistsorted",
            MockResponse::stdout("cluster-h100-9-[78-79]\n"),
        );
        exec.on("scontrol update", MockResponse::stdout(""));
        let scontrol = Scontrol::new(exec.clone());

        let filter = DrainFilter {
            start: Some(at(24, 0, 0, 0)),
            end: None,
            reason: Regex::new(".*").unwrap(),
        };
        let nodes = drained_nodes(&scontrol, &filter).await.unwrap();
        assert_eq!(nodes, vec!["cluster-h100-9-78", "cluster-h100-9-79"]);

        undrain(&scontrol, &nodes).await.unwrap();
        assert_eq!(
            exec.calls().last().unwrap(),
            "scontrol update nodename=cluster-h100-9-[78-79] state=resume reason="
        );
    }
}
