//! Resource drivers
//!
//! One driver per resource kind. A driver issues a single cloud call per
//! operation, waits where the resource has an observable transition, and maps
//! failures into the step error taxonomy. Drivers never retry.
//!
//! ```text
//! server:  create ──► BUILD ──► ACTIVE ........ delete ──► (404)
//! volume:  create ──► creating ──► available ◄──► in-use ── delete
//! fip:     allocate ── associate ── disassociate ── release
//! ```

use crate::cloud::{ServerInfo, ServerSpec, ServerStatus, SharedCloud, VolumeSpec, VolumeStatus};
use crate::error::{ProbeError, Result};
use crate::poll::{PollPolicy, PollState, poll_until};
use crate::run::{ResourceKind, ResourceRef};
use tracing::{debug, info};

/// Device path used for the probe volume
pub const VOLUME_DEVICE: &str = "/dev/vdb";

/// Observable server states the probe waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Booted (`ACTIVE`)
    Ready,
    /// Removed (get returns not found)
    Gone,
}

/// Server lifecycle operations
#[derive(Clone)]
pub struct ServerDriver {
    cloud: SharedCloud,
    poll: PollPolicy,
}

impl ServerDriver {
    /// Create a server driver
    pub fn new(cloud: SharedCloud, poll: PollPolicy) -> Self {
        Self { cloud, poll }
    }

    /// Boot a server and wait until it is ready
    pub async fn create(&self, spec: &ServerSpec) -> Result<ResourceRef> {
        info!(name = %spec.name, image = %spec.image, flavor = %spec.flavor, "Booting server");

        let created = self
            .cloud
            .create_server(spec)
            .await
            .map_err(|e| ProbeError::create(ResourceKind::Server, e))?;
        let server = ResourceRef::new(ResourceKind::Server, created.id, spec.name.clone());

        self.await_state(&server, ServerState::Ready)
            .await
            .map_err(|e| ProbeError::create(ResourceKind::Server, e))?;

        info!(id = %server.id, "Server is active");
        Ok(server)
    }

    /// Request deletion without waiting
    pub async fn delete(&self, server: &ResourceRef) -> Result<()> {
        info!(id = %server.id, "Deleting server");
        match self.cloud.delete_server(&server.id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(id = %server.id, "Server already gone");
                Ok(())
            }
            Err(e) => Err(ProbeError::delete(ResourceKind::Server, e)),
        }
    }

    /// Delete and wait until the compute service no longer knows the server
    pub async fn delete_and_wait(&self, server: &ResourceRef) -> Result<()> {
        self.delete(server).await?;
        self.await_gone(server)
            .await
            .map_err(|e| ProbeError::delete(ResourceKind::Server, e))
    }

    /// Bounded wait until get-server reports not found
    pub async fn await_gone(&self, server: &ResourceRef) -> Result<()> {
        self.await_state(server, ServerState::Gone).await
    }

    /// Bounded wait for a server state. `ERROR` while waiting for `Ready`
    /// fails immediately.
    pub async fn await_state(&self, server: &ResourceRef, desired: ServerState) -> Result<()> {
        let what = match desired {
            ServerState::Ready => format!("server {} to become active", server.id),
            ServerState::Gone => format!("server {} to be deleted", server.id),
        };

        let cloud = &self.cloud;
        let id = server.id.as_str();
        poll_until(self.poll, &what, || async move {
            match (desired, cloud.get_server(id).await) {
                (ServerState::Ready, Ok(ServerInfo { status: ServerStatus::Active, .. })) => {
                    Ok(PollState::Ready(()))
                }
                (ServerState::Ready, Ok(ServerInfo { status: ServerStatus::Error, .. })) => {
                    Err(ProbeError::state(format!("server {} entered ERROR state", id)))
                }
                (ServerState::Ready, Ok(info)) => {
                    debug!(id, status = ?info.status, "Server not ready yet");
                    Ok(PollState::Pending)
                }
                (ServerState::Gone, Err(e)) if e.is_not_found() => Ok(PollState::Ready(())),
                (ServerState::Gone, Ok(info)) => {
                    debug!(id, status = ?info.status, task = ?info.task_state, "Server still present");
                    Ok(PollState::Pending)
                }
                (_, Err(e)) => Err(e),
            }
        })
        .await
    }
}

/// Floating IP operations. Association is synchronous, no waits.
#[derive(Clone)]
pub struct FloatingIpDriver {
    cloud: SharedCloud,
}

impl FloatingIpDriver {
    /// Create a floating IP driver
    pub fn new(cloud: SharedCloud) -> Self {
        Self { cloud }
    }

    /// Allocate an address from `pool`, tagged through its description
    pub async fn create(&self, pool: &str, tag: &str) -> Result<ResourceRef> {
        info!(pool, "Allocating floating IP");
        let fip = self
            .cloud
            .allocate_floating_ip(pool, tag)
            .await
            .map_err(|e| ProbeError::create(ResourceKind::FloatingIp, e))?;
        info!(id = %fip.id, address = %fip.address, "Floating IP allocated");
        Ok(ResourceRef::new(ResourceKind::FloatingIp, fip.id, tag))
    }

    /// Associate with a server
    pub async fn attach(&self, fip: &ResourceRef, server: &ResourceRef) -> Result<()> {
        info!(fip = %fip.id, server = %server.id, "Associating floating IP");
        self.cloud
            .associate_floating_ip(&fip.id, &server.id)
            .await
            .map_err(|e| ProbeError::attach(ResourceKind::FloatingIp, e))
    }

    /// Remove the association
    pub async fn detach(&self, fip: &ResourceRef) -> Result<()> {
        info!(fip = %fip.id, "Disassociating floating IP");
        self.cloud
            .disassociate_floating_ip(&fip.id)
            .await
            .map_err(|e| ProbeError::detach(ResourceKind::FloatingIp, e))
    }

    /// Release the address
    pub async fn delete(&self, fip: &ResourceRef) -> Result<()> {
        info!(fip = %fip.id, "Releasing floating IP");
        match self.cloud.release_floating_ip(&fip.id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(ProbeError::delete(ResourceKind::FloatingIp, e)),
        }
    }
}

/// Volume lifecycle operations
#[derive(Clone)]
pub struct VolumeDriver {
    cloud: SharedCloud,
    poll: PollPolicy,
}

impl VolumeDriver {
    /// Create a volume driver
    pub fn new(cloud: SharedCloud, poll: PollPolicy) -> Self {
        Self { cloud, poll }
    }

    /// Create a volume and wait until it is available
    pub async fn create(&self, spec: &VolumeSpec) -> Result<ResourceRef> {
        info!(name = %spec.name, size_gb = spec.size_gb, "Creating volume");
        let created = self
            .cloud
            .create_volume(spec)
            .await
            .map_err(|e| ProbeError::create(ResourceKind::Volume, e))?;
        let volume = ResourceRef::new(ResourceKind::Volume, created.id, spec.name.clone());

        self.await_state(&volume, VolumeStatus::Available)
            .await
            .map_err(|e| ProbeError::create(ResourceKind::Volume, e))?;
        Ok(volume)
    }

    /// Attach to a server and wait until the volume is in use
    pub async fn attach(&self, volume: &ResourceRef, server: &ResourceRef) -> Result<()> {
        info!(volume = %volume.id, server = %server.id, device = VOLUME_DEVICE, "Attaching volume");
        self.cloud
            .attach_volume(&server.id, &volume.id, VOLUME_DEVICE)
            .await
            .map_err(|e| ProbeError::attach(ResourceKind::Volume, e))?;
        self.await_state(volume, VolumeStatus::InUse)
            .await
            .map_err(|e| ProbeError::attach(ResourceKind::Volume, e))
    }

    /// Detach from a server and wait until the volume is available again
    pub async fn detach(&self, volume: &ResourceRef, server: &ResourceRef) -> Result<()> {
        info!(volume = %volume.id, server = %server.id, "Detaching volume");
        self.cloud
            .detach_volume(&server.id, &volume.id)
            .await
            .map_err(|e| ProbeError::detach(ResourceKind::Volume, e))?;
        self.await_state(volume, VolumeStatus::Available)
            .await
            .map_err(|e| ProbeError::detach(ResourceKind::Volume, e))
    }

    /// Request deletion without waiting
    pub async fn delete(&self, volume: &ResourceRef) -> Result<()> {
        info!(volume = %volume.id, "Deleting volume");
        match self.cloud.delete_volume(&volume.id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(ProbeError::delete(ResourceKind::Volume, e)),
        }
    }

    /// Bounded wait for a volume status. Error statuses fail immediately.
    pub async fn await_state(&self, volume: &ResourceRef, desired: VolumeStatus) -> Result<()> {
        let what = format!("volume {} to become {}", volume.id, desired.as_str());
        let cloud = &self.cloud;
        let id = volume.id.as_str();
        let desired = &desired;
        poll_until(self.poll, &what, || async move {
            let info = cloud.get_volume(id).await?;
            if info.status == *desired {
                Ok(PollState::Ready(()))
            } else if info.status.is_error() {
                Err(ProbeError::state(format!(
                    "volume {} entered {} state",
                    id,
                    info.status.as_str()
                )))
            } else {
                debug!(id, status = info.status.as_str(), "Volume not there yet");
                Ok(PollState::Pending)
            }
        })
        .await
    }
}
