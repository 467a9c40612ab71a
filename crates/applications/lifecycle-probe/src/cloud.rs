//! Cloud API abstraction
//!
//! The probe only needs five primitive families per resource kind:
//! create, get, list, delete and attach/detach. Any provider that exposes them
//! can implement [`CloudApi`]; the OpenStack implementation lives in
//! [`crate::session`].

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared, read-only handle to an authenticated cloud session
pub type SharedCloud = Arc<dyn CloudApi>;

/// Parameters to boot a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Server name, doubles as the probe tag
    pub name: String,
    /// Image name or ID
    pub image: String,
    /// Flavor name or ID
    pub flavor: String,
    /// Optional network ID to attach
    pub network: Option<String>,
    /// Security group name
    pub security_group: String,
    /// Keypair name
    pub key_name: String,
}

/// Parameters to create a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name, doubles as the probe tag
    pub name: String,
    /// Size in GiB
    pub size_gb: u32,
    /// Free-form description
    pub description: String,
}

/// Server status as reported by the compute service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Still building
    Build,
    /// Booted and ready
    Active,
    /// Failed
    Error,
    /// Soft-deleted
    Deleted,
    /// Any other status (SHUTOFF, REBOOT, ...)
    Other(String),
}

impl ServerStatus {
    /// Parse a compute status string
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "BUILD" => Self::Build,
            "ACTIVE" => Self::Active,
            "ERROR" => Self::Error,
            "DELETED" | "SOFT_DELETED" => Self::Deleted,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Snapshot of a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server ID
    pub id: String,
    /// Server name
    pub name: String,
    /// Status
    pub status: ServerStatus,
    /// Pending task (e.g. `deleting`)
    pub task_state: Option<String>,
}

impl ServerInfo {
    /// Booted and usable for attachments
    pub fn is_ready(&self) -> bool {
        self.status == ServerStatus::Active
    }

    /// Already on its way out
    pub fn is_deleting(&self) -> bool {
        self.status == ServerStatus::Deleted || self.task_state.as_deref() == Some("deleting")
    }
}

/// Volume status as reported by the block storage service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeStatus {
    /// Being created
    Creating,
    /// Ready and unattached
    Available,
    /// Attach in progress
    Attaching,
    /// Attached
    InUse,
    /// Detach in progress
    Detaching,
    /// Being deleted
    Deleting,
    /// Failed
    Error,
    /// Failed while deleting
    ErrorDeleting,
    /// Any other status
    Other(String),
}

impl VolumeStatus {
    /// Parse a block storage status string
    pub fn parse(s: &str) -> Self {
        match s {
            "creating" => Self::Creating,
            "available" => Self::Available,
            "attaching" => Self::Attaching,
            "in-use" => Self::InUse,
            "detaching" => Self::Detaching,
            "deleting" => Self::Deleting,
            "error" => Self::Error,
            "error_deleting" => Self::ErrorDeleting,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire name of the status
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::Attaching => "attaching",
            Self::InUse => "in-use",
            Self::Detaching => "detaching",
            Self::Deleting => "deleting",
            Self::Error => "error",
            Self::ErrorDeleting => "error_deleting",
            Self::Other(s) => s,
        }
    }

    /// Terminal failure states
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error | Self::ErrorDeleting)
    }
}

/// Snapshot of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Volume ID
    pub id: String,
    /// Volume name
    pub name: String,
    /// Status
    pub status: VolumeStatus,
}

/// Snapshot of a floating IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIpInfo {
    /// Floating IP ID
    pub id: String,
    /// Public address
    pub address: String,
    /// Description, carries the probe tag
    pub description: String,
    /// Port the address is associated with
    pub port_id: Option<String>,
}

/// Primitive cloud operations used by the probe
///
/// Implementations must be safe for concurrent use: the three creation calls
/// are issued in parallel over one handle.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Boot a server and return its initial snapshot
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerInfo>;

    /// Fetch a server; `ProbeError::NotFound` once it is gone
    async fn get_server(&self, id: &str) -> Result<ServerInfo>;

    /// List all servers of the tenant
    async fn list_servers(&self) -> Result<Vec<ServerInfo>>;

    /// Request server deletion
    async fn delete_server(&self, id: &str) -> Result<()>;

    /// Allocate a floating IP from a pool (external network name or ID)
    async fn allocate_floating_ip(&self, pool: &str, description: &str) -> Result<FloatingIpInfo>;

    /// List all floating IPs of the tenant
    async fn list_floating_ips(&self) -> Result<Vec<FloatingIpInfo>>;

    /// Associate a floating IP with a server
    async fn associate_floating_ip(&self, fip_id: &str, server_id: &str) -> Result<()>;

    /// Remove the association of a floating IP
    async fn disassociate_floating_ip(&self, fip_id: &str) -> Result<()>;

    /// Release a floating IP
    async fn release_floating_ip(&self, fip_id: &str) -> Result<()>;

    /// Create a volume and return its initial snapshot
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeInfo>;

    /// Fetch a volume; `ProbeError::NotFound` once it is gone
    async fn get_volume(&self, id: &str) -> Result<VolumeInfo>;

    /// List all volumes of the tenant
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Request volume deletion
    async fn delete_volume(&self, id: &str) -> Result<()>;

    /// Attach a volume to a server at `device`
    async fn attach_volume(&self, server_id: &str, volume_id: &str, device: &str) -> Result<()>;

    /// Detach a volume from a server
    async fn detach_volume(&self, server_id: &str, volume_id: &str) -> Result<()>;
}
