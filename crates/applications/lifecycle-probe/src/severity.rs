//! Severity aggregation
//!
//! Reduces a finished [`ProbeRun`] into the single verdict the monitoring
//! system consumes:
//!
//! ```text
//! session abort            → unknown (bad input) | critical
//! failed create/attach/del → critical
//! interrupted              → unknown
//! cleanup incomplete/error → warning
//! otherwise                → ok
//! ```
//!
//! A failed detach is reported in the message but does not raise the
//! severity on its own.
//!
//! The reduction is a pure function of the run; calling it twice yields the
//! same verdict and message.

use crate::run::{Abort, CleanupStatus, Phase, ProbeRun};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sensu/Nagios check severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Everything worked
    Ok,
    /// Degraded but functional
    Warning,
    /// Broken
    Critical,
    /// Could not even attempt the probe
    Unknown,
}

impl Severity {
    /// Process exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Critical => 2,
            Self::Unknown => 3,
        }
    }

    /// Upper-case label used in the check output line
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Aggregated verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Overall severity
    pub severity: Severity,
    /// Composed operator message
    pub message: String,
}

/// Reduce a run to its verdict
pub fn aggregate(run: &ProbeRun) -> Verdict {
    Verdict {
        severity: severity(run),
        message: compose_message(run),
    }
}

/// Severity of a run
pub fn severity(run: &ProbeRun) -> Severity {
    if let Some(Abort::Connection { category, .. }) = run.abort() {
        return *category;
    }

    let failed_hard = run.outcomes().any(|o| {
        o.is_failed() && matches!(o.name().phase(), Phase::Create | Phase::Attach | Phase::Delete)
    });
    if failed_hard {
        return Severity::Critical;
    }

    if matches!(run.abort(), Some(Abort::Interrupted)) {
        return Severity::Unknown;
    }

    let cleanup_degraded = run
        .cleanup()
        .is_some_and(|c| c.status == CleanupStatus::Incomplete || c.error.is_some());

    if cleanup_degraded {
        Severity::Warning
    } else {
        Severity::Ok
    }
}

/// Deterministic operator message: failed steps in execution order, then the
/// cleanup report. `"ok"` when there is nothing to report.
pub fn compose_message(run: &ProbeRun) -> String {
    let mut lines = Vec::new();

    for outcome in run.outcomes().filter(|o| o.is_failed()) {
        let name = outcome.name();
        lines.push(format!(
            "Failed to {} {}: {}",
            name.phase().verb(),
            name.object(),
            outcome.error().unwrap_or("unknown error")
        ));
    }

    if matches!(run.abort(), Some(Abort::Interrupted)) {
        lines.push("Probe interrupted before completion".to_string());
    }

    if let Some(cleanup) = run.cleanup() {
        if let Some(err) = &cleanup.error {
            lines.push(format!("Cleanup error: {}", err));
        }
        if cleanup.status == CleanupStatus::Incomplete {
            let orphans: Vec<String> = cleanup.orphans_after.iter().map(|r| r.to_string()).collect();
            lines.push(format!(
                "Cleanup incomplete, {} orphaned: {}",
                orphans.len(),
                orphans.join(", ")
            ));
        }
    }

    if lines.is_empty() {
        "ok".to_string()
    } else {
        lines.join("\n")
    }
}
