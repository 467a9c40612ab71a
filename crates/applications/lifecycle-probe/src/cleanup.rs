//! Cleanup reconciliation
//!
//! Probe resources are rediscovered purely by their well-known tags, so the
//! reconciler also removes leftovers of earlier runs and of creations that
//! failed half-way. It scans, deletes what it found, waits for the deletes to
//! settle and scans again; whatever survives the second scan is an orphan.

use crate::cloud::{SharedCloud, VolumeStatus};
use crate::config::ProbeTags;
use crate::driver::{FloatingIpDriver, ServerDriver, VolumeDriver};
use crate::error::{ProbeError, Result};
use crate::poll::PollPolicy;
use crate::run::{CleanupResult, ResourceKind, ResourceRef};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

/// Finds and deletes probe-tagged resources
pub struct CleanupReconciler {
    cloud: SharedCloud,
    servers: ServerDriver,
    fips: FloatingIpDriver,
    volumes: VolumeDriver,
    tags: ProbeTags,
    settle_interval: Duration,
}

impl CleanupReconciler {
    /// Create a reconciler
    pub fn new(cloud: SharedCloud, tags: ProbeTags, settle_interval: Duration) -> Self {
        // Deletes are fire-and-forget here, the re-scan is the only wait.
        let poll = PollPolicy::default();
        Self {
            servers: ServerDriver::new(cloud.clone(), poll),
            fips: FloatingIpDriver::new(cloud.clone()),
            volumes: VolumeDriver::new(cloud.clone(), poll),
            cloud,
            tags,
            settle_interval,
        }
    }

    /// Run one reconciliation pass. Never fails; a listing error is stored
    /// in the result.
    pub async fn reconcile(&self) -> CleanupResult {
        let before = match self.scan().await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Could not list probe resources");
                return CleanupResult::new(BTreeSet::new(), BTreeSet::new(), Some(e.detail()));
            }
        };

        if before.is_empty() {
            info!("No probe resources left behind");
            return CleanupResult::clean();
        }

        info!(count = before.len(), "Deleting leftover probe resources");
        for resource in &before {
            if let Err(e) = self.delete(resource).await {
                warn!(resource = %resource, error = %e, "Cleanup delete failed");
            }
        }

        tokio::time::sleep(self.settle_interval).await;

        match self.scan().await {
            Ok(after) => {
                if !after.is_empty() {
                    warn!(count = after.len(), "Probe resources survived cleanup");
                }
                CleanupResult::new(before, after, None)
            }
            Err(e) => {
                warn!(error = %e, "Could not re-list probe resources");
                CleanupResult::new(before, BTreeSet::new(), Some(e.detail()))
            }
        }
    }

    /// Probe-tagged resources that are not already being deleted
    pub async fn scan(&self) -> Result<BTreeSet<ResourceRef>> {
        let mut found = BTreeSet::new();

        let servers = self.cloud.list_servers().await.map_err(listing("servers"))?;
        found.extend(
            servers
                .into_iter()
                .filter(|s| s.name == self.tags.server && !s.is_deleting())
                .map(|s| ResourceRef::new(ResourceKind::Server, s.id, s.name)),
        );

        let volumes = self.cloud.list_volumes().await.map_err(listing("volumes"))?;
        found.extend(
            volumes
                .into_iter()
                .filter(|v| v.name == self.tags.volume && v.status != VolumeStatus::Deleting)
                .map(|v| ResourceRef::new(ResourceKind::Volume, v.id, v.name)),
        );

        let fips = self
            .cloud
            .list_floating_ips()
            .await
            .map_err(listing("floating IPs"))?;
        found.extend(
            fips.into_iter()
                .filter(|f| f.description == self.tags.floating_ip)
                .map(|f| ResourceRef::new(ResourceKind::FloatingIp, f.id, f.description)),
        );

        Ok(found)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        match resource.kind {
            ResourceKind::Server => self.servers.delete(resource).await,
            ResourceKind::FloatingIp => self.fips.delete(resource).await,
            ResourceKind::Volume => self.volumes.delete(resource).await,
        }
    }
}

fn listing(what: &'static str) -> impl Fn(ProbeError) -> ProbeError {
    move |e| ProbeError::cleanup(format!("listing {} failed: {}", what, e))
}
