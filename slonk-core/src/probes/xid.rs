//! NVIDIA driver fault codes (XIDs) in the kernel log

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, warn};

use super::{Probe, ProbeContext, ProbeId};
use crate::error::{CheckError, ProbeError};

static XID_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Xid \((.*?)\): (\d+), pid=.+?, (.*)$").expect("valid xid regex")
});

/// One XID event from dmesg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidEvent {
    pub pci: String,
    pub code: u32,
    pub message: String,
}

/// XID events in kernel log output
pub fn parse_xids(dmesg: &str) -> Vec<XidEvent> {
    dmesg
        .lines()
        .filter(|line| line.contains("Xid"))
        .filter_map(|line| {
            let caps = XID_LINE.captures(line)?;
            Some(XidEvent {
                pci: caps[1].to_string(),
                code: caps[2].parse().ok()?,
                message: caps[3].to_string(),
            })
        })
        .collect()
}

/// Short description of an XID code
pub fn xid_description(code: u32) -> &'static str {
    match code {
        13 => "Graphics Engine Exception",
        31 => "GPU memory page fault",
        43 => "GPU stopped processing",
        48 => "Double Bit ECC Error",
        56 => "Display Engine error",
        57 => "Error programming video memory interface",
        58 => "Unstable video memory interface detected",
        62 => "Internal micro-controller halt",
        63 => "ECC page retirement or row remapping recording event",
        64 => "ECC page retirement or row remapper recording failure",
        65 => "Video processor exception",
        68 => "NVDEC0 Exception",
        69 => "Graphics Engine class error",
        73 => "NVENC2 Error",
        74 => "NVLINK Error",
        79 => "GPU has fallen off the bus",
        80 => "Corrupted data sent to GPU",
        81 => "VGA Subsystem Error",
        92 => "High single-bit ECC error rate",
        109 => "Context Switch Timeout Error",
        119 => "GSP RPC Timeout",
        120 => "GSP Error",
        _ => "Unknown XID error",
    }
}

/// Scans dmesg for fatal XIDs
///
/// The recoverable code (13 by default) is counted and logged but never raised:
/// it also fires on faults in user code, which are not a node problem.
pub struct DriverFaultProbe;

#[async_trait]
impl Probe for DriverFaultProbe {
    fn id(&self) -> ProbeId {
        ProbeId::DriverFaults
    }

    async fn run(&self, ctx: &ProbeContext) -> Result<(), ProbeError> {
        let settings = &ctx.settings.kernel;
        let output = ctx.run_elevated("dmesg -T").await?;

        let mut counted = 0;
        for event in parse_xids(&output.stdout) {
            if settings.fatal_xids.contains(&event.code) {
                let msg = format!(
                    "Fatal XID {} ({}) on {}: {}",
                    event.code,
                    xid_description(event.code),
                    event.pci,
                    event.message
                );
                error!("{}", msg);
                return Err(CheckError::manual(
                    "XidCheck",
                    format!("XidCheckError{}", event.code),
                    msg,
                )
                .into());
            }
            if event.code == settings.counted_xid {
                counted += 1;
            }
        }

        if counted > 1 {
            warn!(
                xid = settings.counted_xid,
                count = counted,
                "Found {} Xid {} errors",
                counted,
                settings.counted_xid
            );
        }
        info!("Ignoring non-fatal XIDs");
        Ok(())
    }
}
