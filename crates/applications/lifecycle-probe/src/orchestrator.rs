//! Lifecycle orchestration
//!
//! Runs the fixed step sequence against one cloud session:
//!
//! ```text
//! create-session
//!   ├─ create-server ─┐
//!   ├─ create-fip ────┼─► attach-fip ──► detach-fip ──► delete-fip
//!   └─ create-volume ─┴─► attach-volume ► detach-volume ► delete-volume
//!                                                       ► delete-server
//! ```
//!
//! Every step is timed and recorded into the [`ProbeRun`]. A step whose
//! prerequisites are missing is recorded as skipped; a failed step never stops
//! the steps that do not depend on it.

use crate::cloud::{ServerSpec, SharedCloud, VolumeSpec};
use crate::config::{ProbeConfig, SessionConfig};
use crate::driver::{FloatingIpDriver, ServerDriver, VolumeDriver};
use crate::error::Result;
use crate::run::{Abort, ProbeRun, ResourceRef, StepName, StepOutcome};
use crate::session::Connector;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Authenticate and record the `create-session` step.
///
/// On failure the run is marked aborted and every remaining step skipped.
pub async fn open_session(
    connector: &dyn Connector,
    config: &SessionConfig,
    run: &mut ProbeRun,
) -> Option<SharedCloud> {
    let (elapsed, result) = timed(connector.connect(config)).await;

    match result {
        Ok(cloud) => {
            run.record(StepOutcome::success(StepName::CreateSession, elapsed, None));
            Some(cloud)
        }
        Err(e) => {
            error!(error = %e, "Could not open cloud session");
            run.record(StepOutcome::failed(StepName::CreateSession, elapsed, e.detail()));
            run.set_abort(Abort::Connection {
                category: e.severity_category(),
            });
            run.skip_remaining();
            None
        }
    }
}

/// Drives the resource drivers through the probe lifecycle
pub struct LifecycleOrchestrator {
    servers: ServerDriver,
    fips: FloatingIpDriver,
    volumes: VolumeDriver,
    server_spec: ServerSpec,
    volume_spec: VolumeSpec,
    pool: String,
    fip_tag: String,
}

impl LifecycleOrchestrator {
    /// Create an orchestrator over an open session
    pub fn new(cloud: SharedCloud, config: &ProbeConfig) -> Self {
        Self {
            servers: ServerDriver::new(cloud.clone(), config.poll),
            fips: FloatingIpDriver::new(cloud.clone()),
            volumes: VolumeDriver::new(cloud, config.poll),
            server_spec: config.server_spec(),
            volume_spec: config.volume_spec(),
            pool: config.floating_ip_pool.clone(),
            fip_tag: config.tags.floating_ip.clone(),
        }
    }

    /// Execute every step after `create-session`.
    ///
    /// Outcomes are recorded as soon as they are known, so a run dropped
    /// mid-way keeps everything that already finished.
    pub async fn execute(&self, run: &mut ProbeRun) {
        if !run.succeeded(StepName::CreateSession) {
            warn!("No session, skipping lifecycle");
            run.skip_remaining();
            return;
        }

        let start = Instant::now();
        self.create_all(run).await;
        self.attach_all(run).await;
        self.detach_all(run).await;
        self.delete_all(run).await;

        let failed = run.outcomes().filter(|o| o.is_failed()).count();
        info!(
            total_secs = start.elapsed().as_secs_f64(),
            failed_steps = failed,
            "Lifecycle finished"
        );
    }

    async fn create_all(&self, run: &mut ProbeRun) {
        info!("Creating server, floating IP and volume");
        let (server, fip, volume) = tokio::join!(
            timed(self.servers.create(&self.server_spec)),
            timed(self.fips.create(&self.pool, &self.fip_tag)),
            timed(self.volumes.create(&self.volume_spec)),
        );

        record(run, StepName::CreateServer, server.0, server.1.map(Some));
        record(run, StepName::CreateFip, fip.0, fip.1.map(Some));
        record(run, StepName::CreateVolume, volume.0, volume.1.map(Some));
    }

    async fn attach_all(&self, run: &mut ProbeRun) {
        let (server, fip, volume) = created(run);

        match (&server, &fip) {
            (Some(server), Some(fip)) => {
                let (elapsed, result) = timed(self.fips.attach(fip, server)).await;
                record(run, StepName::AttachFip, elapsed, result.map(|_| None));
            }
            _ => skip(run, StepName::AttachFip),
        }

        match (&server, &volume) {
            (Some(server), Some(volume)) => {
                let (elapsed, result) = timed(self.volumes.attach(volume, server)).await;
                record(run, StepName::AttachVolume, elapsed, result.map(|_| None));
            }
            _ => skip(run, StepName::AttachVolume),
        }
    }

    async fn detach_all(&self, run: &mut ProbeRun) {
        let (server, fip, volume) = created(run);

        match (run.succeeded(StepName::AttachFip), &fip) {
            (true, Some(fip)) => {
                let (elapsed, result) = timed(self.fips.detach(fip)).await;
                record(run, StepName::DetachFip, elapsed, result.map(|_| None));
            }
            _ => skip(run, StepName::DetachFip),
        }

        match (run.succeeded(StepName::AttachVolume), &server, &volume) {
            (true, Some(server), Some(volume)) => {
                let (elapsed, result) = timed(self.volumes.detach(volume, server)).await;
                record(run, StepName::DetachVolume, elapsed, result.map(|_| None));
            }
            _ => skip(run, StepName::DetachVolume),
        }
    }

    async fn delete_all(&self, run: &mut ProbeRun) {
        let (server, fip, volume) = created(run);

        match &fip {
            Some(fip) => {
                let (elapsed, result) = timed(self.fips.delete(fip)).await;
                record(run, StepName::DeleteFip, elapsed, result.map(|_| None));
            }
            None => skip(run, StepName::DeleteFip),
        }

        match &volume {
            Some(volume) => {
                let (elapsed, result) = timed(self.volumes.delete(volume)).await;
                record(run, StepName::DeleteVolume, elapsed, result.map(|_| None));
            }
            None => skip(run, StepName::DeleteVolume),
        }

        match &server {
            Some(server) => {
                let (elapsed, result) = timed(self.servers.delete_and_wait(server)).await;
                record(run, StepName::DeleteServer, elapsed, result.map(|_| None));
            }
            None => skip(run, StepName::DeleteServer),
        }
    }
}

/// Resources handed on by successful create steps
fn created(run: &ProbeRun) -> (Option<ResourceRef>, Option<ResourceRef>, Option<ResourceRef>) {
    (
        run.resource(StepName::CreateServer).cloned(),
        run.resource(StepName::CreateFip).cloned(),
        run.resource(StepName::CreateVolume).cloned(),
    )
}

async fn timed<T>(fut: impl Future<Output = Result<T>>) -> (Duration, Result<T>) {
    let start = Instant::now();
    let result = fut.await;
    (start.elapsed(), result)
}

fn record(run: &mut ProbeRun, name: StepName, elapsed: Duration, result: Result<Option<ResourceRef>>) {
    run.record(outcome(name, elapsed, result));
}

fn outcome(name: StepName, elapsed: Duration, result: Result<Option<ResourceRef>>) -> StepOutcome {
    match result {
        Ok(resource) => {
            info!(step = %name, secs = elapsed.as_secs_f64(), "Step succeeded");
            StepOutcome::success(name, elapsed, resource)
        }
        Err(e) => {
            warn!(step = %name, secs = elapsed.as_secs_f64(), error = %e, "Step failed");
            StepOutcome::failed(name, elapsed, e.detail())
        }
    }
}

fn skip(run: &mut ProbeRun, name: StepName) {
    debug!(step = %name, "Prerequisite missing, skipping");
    run.record(StepOutcome::skipped(name));
}
