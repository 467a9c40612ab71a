//! # OpenStack Lifecycle Probe
//!
//! Synthetic end-to-end check for an OpenStack cloud, reporting to Sensu/Nagios
//! through its exit code and to Graphite through per-step timings.
//!
//! ## Architecture
//!
//! ```text
//! Connector ──► Orchestrator ──► Reconciler ──► Metrics Emitter
//!   (session)     │  drives          (tag scan)   Severity Aggregator
//!                 ▼                                      │
//!        Server / FIP / Volume drivers             exit 0|1|2|3
//!                 │
//!             CloudApi (Nova, Cinder, Neutron)
//! ```
//!
//! One invocation:
//!
//! 1. **Session**: authenticate against Keystone and resolve the catalog
//! 2. **Create**: boot a server, allocate a floating IP, create a volume (concurrently)
//! 3. **Attach / Detach**: associate the floating IP, attach the volume, then undo both
//! 4. **Delete**: release, delete, delete-and-wait
//! 5. **Reconcile**: delete anything still tagged as a probe resource, re-scan
//! 6. **Report**: Graphite lines plus one verdict
//!
//! Every wait is a bounded poll (see [`poll`]); every step outcome lands in a
//! [`ProbeRun`], which [`severity::aggregate`] reduces to the verdict.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod cloud;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod poll;
pub mod probe;
pub mod run;
pub mod session;
pub mod severity;

// Error handling
pub use error::{ProbeError, Result};

// Cloud access
pub use cloud::{
    CloudApi, FloatingIpInfo, ServerInfo, ServerSpec, ServerStatus, SharedCloud, VolumeInfo,
    VolumeSpec, VolumeStatus,
};
pub use session::{CloudSession, Connector, OpenStackConnector};

// Configuration
pub use config::{
    DebugMode, MetricsConfig, ProbeConfig, ProbeTags, SessionConfig, Timeouts,
    DEFAULT_RESOURCE_TAG,
};
pub use poll::{PollPolicy, poll_until};

// Lifecycle
pub use cleanup::CleanupReconciler;
pub use driver::{FloatingIpDriver, ServerDriver, ServerState, VolumeDriver};
pub use orchestrator::{LifecycleOrchestrator, open_session};
pub use run::{
    Abort, CleanupResult, CleanupStatus, ProbeRun, ResourceKind, ResourceRef, StepName,
    StepOutcome, StepStatus,
};

// Reporting
pub use metrics::{MetricsEmitter, metric_prefix, render_lines};
pub use probe::{CHECK_NAME, Probe, ProbeReport};
pub use severity::{Severity, Verdict, aggregate};
