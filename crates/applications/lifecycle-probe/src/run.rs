//! Probe run record
//!
//! Every probe invocation builds exactly one [`ProbeRun`]: an ordered map of
//! step outcomes plus the reconciliation result. The orchestrator writes it
//! through a mutable reference; the metrics emitter and the severity
//! aggregator only read it.

use crate::severity::Severity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Kind of cloud resource the probe manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Compute instance
    Server,
    /// Floating (public) IP address
    FloatingIp,
    /// Block storage volume
    Volume,
}

impl ResourceKind {
    /// Short label used in step names, metrics and messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::FloatingIp => "fip",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a concrete cloud resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource kind
    pub kind: ResourceKind,
    /// Cloud-assigned identifier
    pub id: String,
    /// Well-known probe tag (name or description) used to rediscover it
    pub tag: String,
}

impl ResourceRef {
    /// Create a new resource reference
    pub fn new(kind: ResourceKind, id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.tag, self.id)
    }
}

/// Lifecycle phase a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Authentication
    Session,
    /// Resource creation
    Create,
    /// Attachment / association
    Attach,
    /// Detachment / disassociation
    Detach,
    /// Deletion / release
    Delete,
}

impl Phase {
    /// Verb used in operator messages
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Session | Self::Create => "create",
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::Delete => "delete",
        }
    }
}

/// The fixed probe steps, declared in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StepName {
    /// Authenticate and resolve the service catalog
    CreateSession,
    /// Boot the probe server
    CreateServer,
    /// Allocate a floating IP
    CreateFip,
    /// Create the probe volume
    CreateVolume,
    /// Associate the floating IP with the server
    AttachFip,
    /// Attach the volume to the server
    AttachVolume,
    /// Disassociate the floating IP
    DetachFip,
    /// Detach the volume
    DetachVolume,
    /// Release the floating IP
    DeleteFip,
    /// Delete the volume
    DeleteVolume,
    /// Delete the server
    DeleteServer,
}

impl StepName {
    /// All steps in execution order
    pub const ALL: [StepName; 11] = [
        Self::CreateSession,
        Self::CreateServer,
        Self::CreateFip,
        Self::CreateVolume,
        Self::AttachFip,
        Self::AttachVolume,
        Self::DetachFip,
        Self::DetachVolume,
        Self::DeleteFip,
        Self::DeleteVolume,
        Self::DeleteServer,
    ];

    /// Kebab-case step name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateSession => "create-session",
            Self::CreateServer => "create-server",
            Self::CreateFip => "create-fip",
            Self::CreateVolume => "create-volume",
            Self::AttachFip => "attach-fip",
            Self::AttachVolume => "attach-volume",
            Self::DetachFip => "detach-fip",
            Self::DetachVolume => "detach-volume",
            Self::DeleteFip => "delete-fip",
            Self::DeleteVolume => "delete-volume",
            Self::DeleteServer => "delete-server",
        }
    }

    /// Metric leaf name (`create_session`, ...)
    pub fn metric_name(&self) -> String {
        self.as_str().replace('-', "_")
    }

    /// Phase of this step
    pub fn phase(&self) -> Phase {
        match self {
            Self::CreateSession => Phase::Session,
            Self::CreateServer | Self::CreateFip | Self::CreateVolume => Phase::Create,
            Self::AttachFip | Self::AttachVolume => Phase::Attach,
            Self::DetachFip | Self::DetachVolume => Phase::Detach,
            Self::DeleteFip | Self::DeleteVolume | Self::DeleteServer => Phase::Delete,
        }
    }

    /// Resource the step operates on, `None` for the session step
    pub fn resource(&self) -> Option<ResourceKind> {
        match self {
            Self::CreateSession => None,
            Self::CreateServer | Self::DeleteServer => Some(ResourceKind::Server),
            Self::CreateFip | Self::AttachFip | Self::DetachFip | Self::DeleteFip => {
                Some(ResourceKind::FloatingIp)
            }
            Self::CreateVolume | Self::AttachVolume | Self::DetachVolume | Self::DeleteVolume => {
                Some(ResourceKind::Volume)
            }
        }
    }

    /// Object of the step in operator messages (`session`, `server`, ...)
    pub fn object(&self) -> &'static str {
        self.resource().map(|k| k.as_str()).unwrap_or("session")
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// The call (and any wait) completed
    Success,
    /// The call or its wait failed
    Failed,
    /// A prerequisite was missing, the step was not attempted
    Skipped,
}

/// Recorded outcome of one step. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    name: StepName,
    status: StepStatus,
    error: Option<String>,
    duration: Duration,
    resource: Option<ResourceRef>,
}

impl StepOutcome {
    /// Successful step, optionally producing a resource
    pub fn success(name: StepName, duration: Duration, resource: Option<ResourceRef>) -> Self {
        Self {
            name,
            status: StepStatus::Success,
            error: None,
            duration,
            resource,
        }
    }

    /// Failed step with its error detail
    pub fn failed(name: StepName, duration: Duration, error: impl Into<String>) -> Self {
        Self {
            name,
            status: StepStatus::Failed,
            error: Some(error.into()),
            duration,
            resource: None,
        }
    }

    /// Step that was not attempted
    pub fn skipped(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Skipped,
            error: None,
            duration: Duration::ZERO,
            resource: None,
        }
    }

    /// Step name
    pub fn name(&self) -> StepName {
        self.name
    }

    /// Step status
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Error detail, present iff the step failed
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Wall-clock duration of the step
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Resource produced by the step (create steps only)
    pub fn resource(&self) -> Option<&ResourceRef> {
        self.resource.as_ref()
    }

    /// Whether the step succeeded
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    /// Whether the step failed
    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// Reconciliation verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupStatus {
    /// No probe-tagged resource survived the cleanup pass
    Clean,
    /// At least one orphan survived
    Incomplete,
}

/// Result of the cleanup reconciler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    /// Probe-tagged resources found before the cleanup pass
    pub orphans_before: BTreeSet<ResourceRef>,
    /// Probe-tagged resources still present after the pass
    pub orphans_after: BTreeSet<ResourceRef>,
    /// `Incomplete` iff `orphans_after` is non-empty
    pub status: CleanupStatus,
    /// Set when a listing call failed and reconciliation could not complete
    pub error: Option<String>,
}

impl CleanupResult {
    /// Build a result, deriving the status from the after-scan
    pub fn new(
        orphans_before: BTreeSet<ResourceRef>,
        orphans_after: BTreeSet<ResourceRef>,
        error: Option<String>,
    ) -> Self {
        let status = if orphans_after.is_empty() {
            CleanupStatus::Clean
        } else {
            CleanupStatus::Incomplete
        };
        Self {
            orphans_before,
            orphans_after,
            status,
            error,
        }
    }

    /// Nothing found, nothing left
    pub fn clean() -> Self {
        Self::new(BTreeSet::new(), BTreeSet::new(), None)
    }
}

/// Why a run stopped before executing its steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Abort {
    /// The session could not be opened; the error detail lives on the
    /// `create-session` outcome
    Connection {
        /// `Unknown` for bad input, `Critical` otherwise
        category: Severity,
    },
    /// A shutdown signal arrived mid-run
    Interrupted,
}

/// Ordered record of one probe invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeRun {
    steps: BTreeMap<StepName, StepOutcome>,
    cleanup: Option<CleanupResult>,
    abort: Option<Abort>,
}

impl ProbeRun {
    /// Empty run
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step outcome. The first outcome for a step wins.
    pub fn record(&mut self, outcome: StepOutcome) {
        let name = outcome.name();
        if self.steps.contains_key(&name) {
            warn!(step = %name, "Outcome already recorded, ignoring duplicate");
            return;
        }
        self.steps.insert(name, outcome);
    }

    /// Record every step not yet recorded as skipped
    pub fn skip_remaining(&mut self) {
        for name in StepName::ALL {
            self.steps
                .entry(name)
                .or_insert_with(|| StepOutcome::skipped(name));
        }
    }

    /// Outcome of one step
    pub fn get(&self, name: StepName) -> Option<&StepOutcome> {
        self.steps.get(&name)
    }

    /// Outcomes in execution order
    pub fn outcomes(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.values()
    }

    /// Whether a step was recorded as successful
    pub fn succeeded(&self, name: StepName) -> bool {
        self.get(name).is_some_and(StepOutcome::is_success)
    }

    /// Resource produced by a successful step
    pub fn resource(&self, name: StepName) -> Option<&ResourceRef> {
        self.get(name).filter(|o| o.is_success()).and_then(StepOutcome::resource)
    }

    /// Attach the reconciliation result
    pub fn set_cleanup(&mut self, cleanup: CleanupResult) {
        self.cleanup = Some(cleanup);
    }

    /// Reconciliation result, `None` when cleanup was disabled
    pub fn cleanup(&self) -> Option<&CleanupResult> {
        self.cleanup.as_ref()
    }

    /// Mark the run as aborted
    pub fn set_abort(&mut self, abort: Abort) {
        self.abort = Some(abort);
    }

    /// Abort reason, if any
    pub fn abort(&self) -> Option<&Abort> {
        self.abort.as_ref()
    }
}
