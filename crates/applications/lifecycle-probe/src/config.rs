//! Probe configuration
//!
//! Typed configuration assembled by the CLI. Everything has a default except
//! the credentials, the image and the floating IP pool.

use crate::cloud::{ServerSpec, VolumeSpec};
use crate::error::{ProbeError, Result};
use crate::poll::PollPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default base tag for probe-owned resources
pub const DEFAULT_RESOURCE_TAG: &str = "sensu-check";

/// Default flavor
pub const DEFAULT_FLAVOR: &str = "sbc.tiny";

/// Default Graphite plaintext port
pub const DEFAULT_GRAPHITE_PORT: u16 = 2003;

/// Grace period between the delete steps and reconciliation
pub const DEFAULT_POST_DELETE_GRACE: Duration = Duration::from_secs(10);

/// Settle interval between cleanup deletes and the re-scan
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_secs(5);

/// HTTP debug logging mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DebugMode {
    /// Log outgoing requests
    Request,
    /// Log responses
    Response,
    /// Log both
    All,
}

impl DebugMode {
    /// Whether requests are logged
    pub fn logs_requests(&self) -> bool {
        matches!(self, Self::Request | Self::All)
    }

    /// Whether responses are logged
    pub fn logs_responses(&self) -> bool {
        matches!(self, Self::Response | Self::All)
    }
}

/// Per-call timeouts of the cloud session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Bound on establishing the session (TCP connect and authentication)
    pub connect: Duration,
    /// Bound on reading a response
    pub read: Duration,
    /// Bound on sending a request
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(300),
            read: Duration::from_secs(300),
            write: Duration::from_secs(300),
        }
    }
}

impl Timeouts {
    /// Bound for one complete HTTP exchange
    pub fn request(&self) -> Duration {
        self.read.max(self.write)
    }
}

/// Everything needed to open a cloud session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identity (Keystone) endpoint, v2.0 or v3
    pub auth_url: String,
    /// User name
    pub username: String,
    /// Password
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Tenant / project name
    pub tenant: String,
    /// User and project domain (Keystone v3 only)
    pub domain: String,
    /// Catalog region filter
    pub region: Option<String>,
    /// Timeouts
    pub timeouts: Timeouts,
    /// Extra CA bundle (PEM)
    pub ca_file: Option<PathBuf>,
    /// HTTP debug logging
    pub debug: Option<DebugMode>,
}

impl SessionConfig {
    /// Create a session config with default timeouts
    pub fn new(
        auth_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Self {
        Self {
            auth_url: auth_url.into(),
            username: username.into(),
            password: password.into(),
            tenant: tenant.into(),
            domain: "Default".to_string(),
            region: None,
            timeouts: Timeouts::default(),
            ca_file: None,
            debug: None,
        }
    }

    /// Check required credentials are present
    pub fn validate(&self) -> Result<()> {
        for (flag, value) in [
            ("--auth-url", &self.auth_url),
            ("--user", &self.username),
            ("--password", &self.password),
            ("--tenant", &self.tenant),
        ] {
            if value.trim().is_empty() {
                return Err(ProbeError::config(format!("{} is empty", flag)));
            }
        }
        for (flag, timeout) in [
            ("--connect-timeout", self.timeouts.connect),
            ("--read-timeout", self.timeouts.read),
            ("--write-timeout", self.timeouts.write),
        ] {
            if timeout.is_zero() {
                return Err(ProbeError::config(format!("{} must be positive", flag)));
            }
        }
        Ok(())
    }
}

/// Well-known names used to tag and rediscover probe resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTags {
    /// Server name
    pub server: String,
    /// Volume name
    pub volume: String,
    /// Floating IP description
    pub floating_ip: String,
}

impl ProbeTags {
    /// Derive all tags from a base (`sensu-check` → `sensu-check-instance`, ...)
    pub fn from_base(base: &str) -> Self {
        Self {
            server: format!("{}-instance", base),
            volume: format!("{}-volume", base),
            floating_ip: format!("{}-fip", base),
        }
    }
}

impl Default for ProbeTags {
    fn default() -> Self {
        Self::from_base(DEFAULT_RESOURCE_TAG)
    }
}

/// Graphite sink settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Sink host
    pub host: String,
    /// Sink port
    pub port: u16,
    /// Metric prefix; derived from the auth URL when unset
    pub prefix: Option<String>,
    /// Connect/write bound for the sink
    pub timeout: Duration,
}

impl MetricsConfig {
    /// Create a sink config on the default port
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_GRAPHITE_PORT,
            prefix: None,
            timeout: Duration::from_secs(10),
        }
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set explicit metric prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// Complete probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Cloud session
    pub session: SessionConfig,
    /// Image name or ID
    pub image: String,
    /// Flavor name or ID
    pub flavor: String,
    /// Network ID to attach to the server
    pub network: Option<String>,
    /// Security group name
    pub security_group: String,
    /// Keypair name
    pub key_name: String,
    /// Volume size (GiB)
    pub volume_size_gb: u32,
    /// Floating IP pool (external network name or ID)
    pub floating_ip_pool: String,
    /// Resource tags
    pub tags: ProbeTags,
    /// Waits on server/volume state changes
    #[serde(skip)]
    pub poll: PollPolicy,
    /// Graphite sink; `None` disables metrics
    pub metrics: Option<MetricsConfig>,
    /// Run the cleanup reconciler
    pub cleanup: bool,
    /// Pause between the delete steps and reconciliation
    pub post_delete_grace: Duration,
    /// Pause between cleanup deletes and the re-scan
    pub settle_interval: Duration,
}

impl ProbeConfig {
    /// Create a config with defaults for everything optional
    pub fn new(
        session: SessionConfig,
        image: impl Into<String>,
        floating_ip_pool: impl Into<String>,
    ) -> Self {
        Self {
            session,
            image: image.into(),
            flavor: DEFAULT_FLAVOR.to_string(),
            network: None,
            security_group: "default".to_string(),
            key_name: DEFAULT_RESOURCE_TAG.to_string(),
            volume_size_gb: 1,
            floating_ip_pool: floating_ip_pool.into(),
            tags: ProbeTags::default(),
            poll: PollPolicy::default(),
            metrics: None,
            cleanup: true,
            post_delete_grace: DEFAULT_POST_DELETE_GRACE,
            settle_interval: DEFAULT_SETTLE_INTERVAL,
        }
    }

    /// Set flavor
    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = flavor.into();
        self
    }

    /// Set network
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Set security group
    pub fn with_security_group(mut self, group: impl Into<String>) -> Self {
        self.security_group = group.into();
        self
    }

    /// Set keypair
    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    /// Set volume size
    pub fn with_volume_size(mut self, size_gb: u32) -> Self {
        self.volume_size_gb = size_gb;
        self
    }

    /// Set resource tags
    pub fn with_tags(mut self, tags: ProbeTags) -> Self {
        self.tags = tags;
        self
    }

    /// Set poll policy
    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Enable metrics
    pub fn with_metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enable or disable cleanup
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Set the pauses before reconciliation and before the re-scan
    pub fn with_settle(mut self, post_delete_grace: Duration, settle_interval: Duration) -> Self {
        self.post_delete_grace = post_delete_grace;
        self.settle_interval = settle_interval;
        self
    }

    /// Check the configuration can drive a probe
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if self.image.trim().is_empty() {
            return Err(ProbeError::config("--image is empty"));
        }
        if self.floating_ip_pool.trim().is_empty() {
            return Err(ProbeError::config("--floating-ip-pool is empty"));
        }
        if self.volume_size_gb == 0 {
            return Err(ProbeError::config("--volume-size must be at least 1"));
        }
        if self.poll.interval.is_zero() {
            return Err(ProbeError::config("--poll-interval must be positive"));
        }
        if self.poll.deadline.is_zero() {
            return Err(ProbeError::config("--wait-timeout must be positive"));
        }
        Ok(())
    }

    /// Server boot parameters
    pub fn server_spec(&self) -> ServerSpec {
        ServerSpec {
            name: self.tags.server.clone(),
            image: self.image.clone(),
            flavor: self.flavor.clone(),
            network: self.network.clone(),
            security_group: self.security_group.clone(),
            key_name: self.key_name.clone(),
        }
    }

    /// Volume creation parameters
    pub fn volume_spec(&self) -> VolumeSpec {
        VolumeSpec {
            name: self.tags.volume.clone(),
            size_gb: self.volume_size_gb,
            description: "Sensu check volume".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::severity::Severity;

    fn session() -> SessionConfig {
        SessionConfig::new("https://keystone.example.com:5000/v3", "probe", "secret", "monitoring")
    }

    #[test]
    fn test_defaults() {
        let config = ProbeConfig::new(session(), "cirros", "ext-net");
        assert_eq!(config.flavor, "sbc.tiny");
        assert_eq!(config.security_group, "default");
        assert_eq!(config.key_name, "sensu-check");
        assert_eq!(config.volume_size_gb, 1);
        assert_eq!(config.tags.server, "sensu-check-instance");
        assert_eq!(config.tags.volume, "sensu-check-volume");
        assert_eq!(config.tags.floating_ip, "sensu-check-fip");
        assert_eq!(config.session.timeouts.connect.as_secs(), 300);
        assert!(config.cleanup);
        assert!(config.metrics.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ProbeConfig::new(session(), "cirros", "ext-net")
            .with_flavor("m1.small")
            .with_network("net-123")
            .with_volume_size(5)
            .with_tags(ProbeTags::from_base("canary"))
            .with_metrics(MetricsConfig::new("graphite.local").with_port(2013));

        let server = config.server_spec();
        assert_eq!(server.name, "canary-instance");
        assert_eq!(server.flavor, "m1.small");
        assert_eq!(server.network.as_deref(), Some("net-123"));

        let volume = config.volume_spec();
        assert_eq!(volume.name, "canary-volume");
        assert_eq!(volume.size_gb, 5);
        assert_eq!(config.metrics.unwrap().port, 2013);
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let mut config = ProbeConfig::new(session(), "cirros", "ext-net");
        config.session.password = String::new();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Invalid configuration: --password is empty");

        let config = ProbeConfig::new(session(), "cirros", " ");
        assert!(matches!(config.validate(), Err(ProbeError::InvalidConfig(_))));

        let config = ProbeConfig::new(session(), "cirros", "ext").with_volume_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let cases: [(&str, fn(&mut Timeouts)); 3] = [
            ("--connect-timeout", |t| t.connect = Duration::ZERO),
            ("--read-timeout", |t| t.read = Duration::ZERO),
            ("--write-timeout", |t| t.write = Duration::ZERO),
        ];
        for (flag, zero) in cases {
            let mut config = ProbeConfig::new(session(), "cirros", "ext-net");
            zero(&mut config.session.timeouts);

            let err = config.validate().unwrap_err();
            assert_eq!(err.severity_category(), Severity::Unknown);
            assert_eq!(
                err.to_string(),
                format!("Invalid configuration: {} must be positive", flag)
            );
        }

        let config = ProbeConfig::new(session(), "cirros", "ext-net")
            .with_poll(PollPolicy::new(Duration::from_secs(1), Duration::ZERO));
        assert!(matches!(config.validate(), Err(ProbeError::InvalidConfig(_))));
    }

    #[test]
    fn test_password_not_serialized() {
        let json = serde_json::to_string(&session()).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"tenant\":\"monitoring\""));
    }

    #[test]
    fn test_debug_mode() {
        assert!(DebugMode::All.logs_requests() && DebugMode::All.logs_responses());
        assert!(DebugMode::Request.logs_requests());
        assert!(!DebugMode::Request.logs_responses());
        assert!(!DebugMode::Response.logs_requests());
    }

    #[test]
    fn test_request_timeout_is_larger_bound() {
        let timeouts = Timeouts {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            write: Duration::from_secs(60),
        };
        assert_eq!(timeouts.request(), Duration::from_secs(60));
    }
}
