//! Probe composition
//!
//! Wires the connector, orchestrator, reconciler, metrics emitter and severity
//! aggregator into a single run and reacts to a shutdown signal.

use crate::cleanup::CleanupReconciler;
use crate::config::ProbeConfig;
use crate::metrics::MetricsEmitter;
use crate::orchestrator::{LifecycleOrchestrator, open_session};
use crate::run::{Abort, ProbeRun};
use crate::session::{Connector, OpenStackConnector};
use crate::severity::{Severity, Verdict, aggregate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

/// Name printed in front of the verdict
pub const CHECK_NAME: &str = "CheckBootAttachFloatipVolume";

/// Everything one probe invocation produced
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    /// Run identifier (also on every log line of the run)
    pub run_id: Uuid,
    /// When the run started; used as the metrics timestamp
    pub started_at: DateTime<Utc>,
    /// Step outcomes and cleanup result
    pub run: ProbeRun,
    /// Aggregated verdict
    pub verdict: Verdict,
    /// Why metrics could not be delivered, if they could not
    pub metrics_error: Option<String>,
}

impl ProbeReport {
    /// Overall severity
    pub fn severity(&self) -> Severity {
        self.verdict.severity
    }

    /// Process exit code
    pub fn exit_code(&self) -> i32 {
        self.verdict.severity.exit_code()
    }

    /// Check output line (`CheckBootAttachFloatipVolume OK: ok`)
    pub fn output_line(&self) -> String {
        format!(
            "{} {}: {}",
            CHECK_NAME,
            self.verdict.severity.label(),
            self.verdict.message
        )
    }
}

/// A configured probe
pub struct Probe {
    config: ProbeConfig,
    connector: Arc<dyn Connector>,
}

impl Probe {
    /// Create a probe against a real OpenStack cloud
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            connector: Arc::new(OpenStackConnector),
        }
    }

    /// Use a different connector
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Probe configuration
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Execute one probe run.
    ///
    /// When `shutdown` resolves first, unfinished steps are recorded as
    /// skipped and the run still goes through cleanup and reporting.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> ProbeReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("probe", run_id = %run_id);
        self.run_inner(run_id, shutdown).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, shutdown: impl Future<Output = ()>) -> ProbeReport {
        let started_at = Utc::now();
        let mut run = ProbeRun::new();
        tokio::pin!(shutdown);

        info!(
            image = %self.config.image,
            flavor = %self.config.flavor,
            pool = %self.config.floating_ip_pool,
            "Starting lifecycle probe"
        );

        let opened = tokio::select! {
            cloud = open_session(self.connector.as_ref(), &self.config.session, &mut run) => Some(cloud),
            _ = &mut shutdown => None,
        };
        let cloud = match opened {
            Some(cloud) => cloud,
            None => {
                interrupt(&mut run);
                None
            }
        };

        if let Some(cloud) = &cloud {
            let orchestrator = LifecycleOrchestrator::new(cloud.clone(), &self.config);
            let interrupted = tokio::select! {
                _ = orchestrator.execute(&mut run) => false,
                _ = &mut shutdown => true,
            };

            if interrupted {
                interrupt(&mut run);
            } else if self.config.cleanup && !self.config.post_delete_grace.is_zero() {
                info!(grace = ?self.config.post_delete_grace, "Waiting for deletes to settle");
                tokio::time::sleep(self.config.post_delete_grace).await;
            }

            if self.config.cleanup {
                let reconciler = CleanupReconciler::new(
                    cloud.clone(),
                    self.config.tags.clone(),
                    self.config.settle_interval,
                );
                run.set_cleanup(reconciler.reconcile().await);
            } else {
                info!("Cleanup disabled");
            }
        }

        let metrics_error = match &self.config.metrics {
            Some(metrics) => {
                let emitter = MetricsEmitter::new(metrics.clone(), &self.config.session.auth_url);
                match emitter.emit(&run, started_at).await {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Metrics not delivered");
                        Some(e.detail())
                    }
                }
            }
            None => None,
        };

        let verdict = aggregate(&run);
        info!(severity = %verdict.severity, "Probe finished");

        ProbeReport {
            run_id,
            started_at,
            run,
            verdict,
            metrics_error,
        }
    }
}

fn interrupt(run: &mut ProbeRun) {
    warn!("Shutdown requested, abandoning remaining steps");
    run.set_abort(Abort::Interrupted);
    run.skip_remaining();
}
