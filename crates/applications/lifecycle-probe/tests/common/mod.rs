//! In-memory cloud for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use lifecycle_probe::{
    CloudApi, Connector, FloatingIpInfo, MetricsConfig, PollPolicy, ProbeConfig, ProbeError,
    Result, ServerInfo, ServerSpec, ServerStatus, SessionConfig, SharedCloud, VolumeInfo,
    VolumeSpec, VolumeStatus,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Failure injection switches
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Servers go to ERROR instead of ACTIVE
    pub server_error_state: bool,
    /// Floating IP allocation fails with a 409
    pub fip_pool_exhausted: bool,
    /// Volumes go to `error` instead of `available`
    pub volume_error_state: bool,
    /// Volumes never leave `creating`
    pub volume_stuck_creating: bool,
    /// Server deletes are accepted and the server disappears from get, but
    /// stays in listings forever
    pub undeletable_server: bool,
    /// Floating IP disassociation fails
    pub detach_fip_error: bool,
    /// Listing servers fails
    pub list_servers_error: bool,
    /// attach_volume never returns
    pub hang_on_attach_volume: bool,
}

#[derive(Debug)]
struct FakeServer {
    info: ServerInfo,
    polls: u32,
    ghost: bool,
}

#[derive(Debug, Default)]
struct State {
    counters: BTreeMap<&'static str, u32>,
    servers: BTreeMap<String, FakeServer>,
    volumes: BTreeMap<String, VolumeInfo>,
    fips: BTreeMap<String, FloatingIpInfo>,
    calls: Vec<String>,
}

impl State {
    fn next_id(&mut self, prefix: &'static str) -> String {
        let n = self.counters.entry(prefix).or_insert(0);
        *n += 1;
        format!("{}-{}", prefix, n)
    }
}

/// Fake OpenStack: servers boot after one poll, volumes become available
/// after one poll, floating IPs are synchronous.
#[derive(Debug, Default)]
pub struct FakeCloud {
    faults: Faults,
    state: Mutex<State>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_faults(faults: Faults) -> Arc<Self> {
        Arc::new(Self {
            faults,
            state: Mutex::default(),
        })
    }

    pub fn shared(self: &Arc<Self>) -> SharedCloud {
        self.clone()
    }

    /// Leftover server from an earlier run
    pub fn seed_server(&self, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("srv");
        state.servers.insert(
            id.clone(),
            FakeServer {
                info: ServerInfo {
                    id: id.clone(),
                    name: name.to_string(),
                    status: ServerStatus::Active,
                    task_state: None,
                },
                polls: 0,
                ghost: false,
            },
        );
        id
    }

    /// Leftover volume from an earlier run
    pub fn seed_volume(&self, name: &str, status: VolumeStatus) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("vol");
        state.volumes.insert(
            id.clone(),
            VolumeInfo {
                id: id.clone(),
                name: name.to_string(),
                status,
            },
        );
        id
    }

    /// Leftover floating IP from an earlier run
    pub fn seed_fip(&self, description: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id("fip");
        state.fips.insert(
            id.clone(),
            FloatingIpInfo {
                id: id.clone(),
                address: "203.0.113.250".to_string(),
                description: description.to_string(),
                port_id: None,
            },
        );
        id
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| *c == op).count()
    }

    pub fn server_count(&self) -> usize {
        self.state.lock().unwrap().servers.len()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().unwrap().volumes.len()
    }

    pub fn fip_count(&self) -> usize {
        self.state.lock().unwrap().fips.len()
    }

    fn call(&self, op: &str) -> std::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(op.to_string());
        state
    }
}

fn not_found(what: &str, id: &str) -> ProbeError {
    ProbeError::NotFound(format!("{} {}", what, id))
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn create_server(&self, spec: &ServerSpec) -> Result<ServerInfo> {
        let mut state = self.call("create_server");
        let id = state.next_id("srv");
        let info = ServerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            status: ServerStatus::Build,
            task_state: Some("spawning".to_string()),
        };
        state.servers.insert(
            id,
            FakeServer {
                info: info.clone(),
                polls: 0,
                ghost: false,
            },
        );
        Ok(info)
    }

    async fn get_server(&self, id: &str) -> Result<ServerInfo> {
        let error_state = self.faults.server_error_state;
        let mut state = self.call("get_server");
        let server = state.servers.get_mut(id).ok_or_else(|| not_found("server", id))?;
        if server.ghost {
            return Err(not_found("server", id));
        }
        server.polls += 1;
        if server.info.status == ServerStatus::Build && server.polls > 1 {
            server.info.task_state = None;
            server.info.status = if error_state {
                ServerStatus::Error
            } else {
                ServerStatus::Active
            };
        }
        Ok(server.info.clone())
    }

    async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        let state = self.call("list_servers");
        if self.faults.list_servers_error {
            return Err(ProbeError::Api {
                status: 503,
                message: "compute service unavailable".to_string(),
            });
        }
        Ok(state.servers.values().map(|s| s.info.clone()).collect())
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        let mut state = self.call("delete_server");
        if !state.servers.contains_key(id) {
            return Err(not_found("server", id));
        }
        if self.faults.undeletable_server {
            if let Some(server) = state.servers.get_mut(id) {
                server.ghost = true;
            }
            return Ok(());
        }
        state.servers.remove(id);
        // Deleting a server detaches its volumes and disassociates its addresses
        for volume in state.volumes.values_mut() {
            if volume.status == VolumeStatus::InUse {
                volume.status = VolumeStatus::Available;
            }
        }
        let port = format!("port-{}", id);
        for fip in state.fips.values_mut() {
            if fip.port_id.as_deref() == Some(port.as_str()) {
                fip.port_id = None;
            }
        }
        Ok(())
    }

    async fn allocate_floating_ip(&self, pool: &str, description: &str) -> Result<FloatingIpInfo> {
        let mut state = self.call("allocate_floating_ip");
        if self.faults.fip_pool_exhausted {
            return Err(ProbeError::Api {
                status: 409,
                message: format!("No more IP addresses available on network {}", pool),
            });
        }
        let id = state.next_id("fip");
        let n = state.fips.len() + 10;
        let info = FloatingIpInfo {
            id: id.clone(),
            address: format!("203.0.113.{}", n),
            description: description.to_string(),
            port_id: None,
        };
        state.fips.insert(id, info.clone());
        Ok(info)
    }

    async fn list_floating_ips(&self) -> Result<Vec<FloatingIpInfo>> {
        let state = self.call("list_floating_ips");
        Ok(state.fips.values().cloned().collect())
    }

    async fn associate_floating_ip(&self, fip_id: &str, server_id: &str) -> Result<()> {
        let mut state = self.call("associate_floating_ip");
        if !state.servers.contains_key(server_id) {
            return Err(not_found("server", server_id));
        }
        let fip = state.fips.get_mut(fip_id).ok_or_else(|| not_found("floatingip", fip_id))?;
        fip.port_id = Some(format!("port-{}", server_id));
        Ok(())
    }

    async fn disassociate_floating_ip(&self, fip_id: &str) -> Result<()> {
        let mut state = self.call("disassociate_floating_ip");
        if self.faults.detach_fip_error {
            return Err(ProbeError::Api {
                status: 500,
                message: "neutron agent timeout".to_string(),
            });
        }
        let fip = state.fips.get_mut(fip_id).ok_or_else(|| not_found("floatingip", fip_id))?;
        fip.port_id = None;
        Ok(())
    }

    async fn release_floating_ip(&self, fip_id: &str) -> Result<()> {
        let mut state = self.call("release_floating_ip");
        state
            .fips
            .remove(fip_id)
            .map(|_| ())
            .ok_or_else(|| not_found("floatingip", fip_id))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeInfo> {
        let mut state = self.call("create_volume");
        let id = state.next_id("vol");
        let info = VolumeInfo {
            id: id.clone(),
            name: spec.name.clone(),
            status: VolumeStatus::Creating,
        };
        state.volumes.insert(id, info.clone());
        Ok(info)
    }

    async fn get_volume(&self, id: &str) -> Result<VolumeInfo> {
        let mut state = self.call("get_volume");
        let volume = state.volumes.get_mut(id).ok_or_else(|| not_found("volume", id))?;
        if volume.status == VolumeStatus::Creating && !self.faults.volume_stuck_creating {
            volume.status = if self.faults.volume_error_state {
                VolumeStatus::Error
            } else {
                VolumeStatus::Available
            };
        }
        Ok(volume.clone())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let state = self.call("list_volumes");
        Ok(state.volumes.values().cloned().collect())
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        let mut state = self.call("delete_volume");
        match state.volumes.get(id) {
            None => Err(not_found("volume", id)),
            Some(v) if v.status == VolumeStatus::InUse => Err(ProbeError::Api {
                status: 400,
                message: "Volume status must be available or error".to_string(),
            }),
            Some(_) => {
                state.volumes.remove(id);
                Ok(())
            }
        }
    }

    async fn attach_volume(&self, server_id: &str, volume_id: &str, _device: &str) -> Result<()> {
        {
            let mut state = self.call("attach_volume");
            if !self.faults.hang_on_attach_volume {
                if !state.servers.contains_key(server_id) {
                    return Err(not_found("server", server_id));
                }
                let volume = state
                    .volumes
                    .get_mut(volume_id)
                    .ok_or_else(|| not_found("volume", volume_id))?;
                volume.status = VolumeStatus::InUse;
                return Ok(());
            }
        }
        std::future::pending().await
    }

    async fn detach_volume(&self, _server_id: &str, volume_id: &str) -> Result<()> {
        let mut state = self.call("detach_volume");
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?;
        volume.status = VolumeStatus::Available;
        Ok(())
    }
}

/// Hands out one fake cloud, or fails like a real Keystone would
pub struct FakeConnector {
    cloud: Arc<FakeCloud>,
    failure: Option<fn() -> ProbeError>,
}

impl FakeConnector {
    pub fn new(cloud: Arc<FakeCloud>) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            failure: None,
        })
    }

    pub fn failing(cloud: Arc<FakeCloud>, failure: fn() -> ProbeError) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            failure: Some(failure),
        })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _config: &SessionConfig) -> Result<SharedCloud> {
        match self.failure {
            Some(failure) => Err(failure()),
            None => Ok(self.cloud.shared()),
        }
    }
}

/// Fast polling, no grace periods, no metrics
pub fn test_config() -> ProbeConfig {
    let session = SessionConfig::new(
        "https://keystone.cloud1.example.com:5000/v3",
        "monitoring",
        "secret",
        "monitoring",
    );
    ProbeConfig::new(session, "cirros", "ext-net")
        .with_poll(PollPolicy::new(Duration::from_millis(5), Duration::from_millis(500)))
        .with_settle(Duration::ZERO, Duration::ZERO)
}

/// Config that sends metrics to `port` on localhost
pub fn config_with_metrics(port: u16) -> ProbeConfig {
    test_config().with_metrics(MetricsConfig::new("127.0.0.1").with_port(port))
}

/// Accept one connection and return everything written to it
pub async fn metrics_sink() -> (u16, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = String::new();
        socket.read_to_string(&mut received).await.unwrap();
        received
    });
    (port, handle)
}

/// Shutdown future that never fires
pub async fn never() {
    std::future::pending::<()>().await
}
