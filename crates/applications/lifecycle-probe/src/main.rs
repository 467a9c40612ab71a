//! check-openstack-lifecycle - synthetic OpenStack lifecycle check
//!
//! Boots a server, allocates a floating IP and creates a volume, attaches,
//! detaches and deletes them again, cleans up leftovers and reports one verdict.
//!
//! ## Usage
//!
//! ```bash
//! check-openstack-lifecycle \
//!     --auth-url https://keystone.cloud1.example.com:5000/v3 \
//!     --user monitoring --password "$OS_PASSWORD" --tenant monitoring \
//!     --image cirros --floating-ip-pool ext-net \
//!     --graphite-host graphite.example.com
//! ```
//!
//! Exit codes follow the Sensu/Nagios convention: 0 ok, 1 warning,
//! 2 critical, 3 unknown.

use anyhow::Context;
use clap::Parser;
use clap::error::ErrorKind;
use lifecycle_probe::{
    CHECK_NAME, DEFAULT_RESOURCE_TAG, DebugMode, MetricsConfig, PollPolicy, Probe, ProbeConfig,
    ProbeReport, ProbeTags, SessionConfig, Severity, Timeouts,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Synthetic boot / attach / floating IP / volume lifecycle check for OpenStack
#[derive(Parser, Debug)]
#[command(name = "check-openstack-lifecycle", version)]
#[command(about = "Synthetic OpenStack boot/attach/floating-IP/volume check", long_about = None)]
struct Cli {
    /// Identity endpoint (Keystone v2.0 or v3)
    #[arg(long, env = "OS_AUTH_URL")]
    auth_url: String,

    /// User name
    #[arg(long, env = "OS_USERNAME")]
    user: String,

    /// Password
    #[arg(long, env = "OS_PASSWORD", hide_env_values = true)]
    password: String,

    /// Tenant / project name (falls back to OS_PROJECT_NAME)
    #[arg(long, env = "OS_TENANT_NAME")]
    tenant: Option<String>,

    /// User and project domain (Keystone v3)
    #[arg(long, env = "OS_USER_DOMAIN_NAME", default_value = "Default")]
    domain: String,

    /// Catalog region
    #[arg(long, env = "OS_REGION_NAME")]
    region: Option<String>,

    /// Image name or ID to boot
    #[arg(long)]
    image: String,

    /// Flavor name or ID
    #[arg(long, default_value = "sbc.tiny")]
    flavor: String,

    /// Network ID for the server
    #[arg(long)]
    network: Option<String>,

    /// Security group
    #[arg(long, default_value = "default")]
    security_group: String,

    /// Keypair name
    #[arg(long, default_value = DEFAULT_RESOURCE_TAG)]
    key_name: String,

    /// Volume size in GiB
    #[arg(long, default_value_t = 1)]
    volume_size: u32,

    /// Floating IP pool (external network name or ID)
    #[arg(long)]
    floating_ip_pool: String,

    /// Session connect timeout (seconds)
    #[arg(long, default_value_t = 300)]
    connect_timeout: u64,

    /// HTTP read timeout (seconds)
    #[arg(long, default_value_t = 300)]
    read_timeout: u64,

    /// HTTP write timeout (seconds)
    #[arg(long, default_value_t = 300)]
    write_timeout: u64,

    /// Deadline for each state wait (seconds, default: read timeout)
    #[arg(long)]
    wait_timeout: Option<u64>,

    /// Interval between state queries (seconds)
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,

    /// Extra CA bundle (PEM)
    #[arg(long, env = "OS_CACERT")]
    ca_file: Option<PathBuf>,

    /// Base tag for probe resources
    #[arg(long, default_value = DEFAULT_RESOURCE_TAG)]
    resource_tag: String,

    /// Graphite host
    #[arg(long, env = "GRAPHITE_HOST", required_unless_present = "no_metrics")]
    graphite_host: Option<String>,

    /// Graphite plaintext port
    #[arg(long, env = "GRAPHITE_PORT", default_value_t = 2003)]
    graphite_port: u16,

    /// Metric prefix (default: <cloud>.openstack.boot_attach_fip_volume)
    #[arg(long)]
    metrics_prefix: Option<String>,

    /// Do not send metrics
    #[arg(long)]
    no_metrics: bool,

    /// Skip the cleanup reconciler
    #[arg(long)]
    no_cleanup: bool,

    /// Log HTTP requests, responses or both
    #[arg(long, value_enum)]
    debug: Option<DebugMode>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<ProbeConfig> {
        let tenant = self
            .tenant
            .or_else(|| std::env::var("OS_PROJECT_NAME").ok())
            .context("--tenant is required (or OS_TENANT_NAME / OS_PROJECT_NAME)")?;

        let mut session = SessionConfig::new(self.auth_url, self.user, self.password, tenant);
        session.domain = self.domain;
        session.region = self.region;
        session.ca_file = self.ca_file;
        session.debug = self.debug;
        session.timeouts = Timeouts {
            connect: Duration::from_secs(self.connect_timeout),
            read: Duration::from_secs(self.read_timeout),
            write: Duration::from_secs(self.write_timeout),
        };

        let wait = self.wait_timeout.unwrap_or(self.read_timeout);
        let mut config = ProbeConfig::new(session, self.image, self.floating_ip_pool)
            .with_flavor(self.flavor)
            .with_security_group(self.security_group)
            .with_key_name(self.key_name)
            .with_volume_size(self.volume_size)
            .with_tags(ProbeTags::from_base(&self.resource_tag))
            .with_poll(PollPolicy::new(
                Duration::from_secs(self.poll_interval),
                Duration::from_secs(wait),
            ))
            .with_cleanup(!self.no_cleanup);

        if let Some(network) = self.network {
            config = config.with_network(network);
        }

        if !self.no_metrics {
            let host = self
                .graphite_host
                .context("--graphite-host is required unless --no-metrics is set")?;
            let mut metrics = MetricsConfig::new(host).with_port(self.graphite_port);
            if let Some(prefix) = self.metrics_prefix {
                metrics = metrics.with_prefix(prefix);
            }
            config = config.with_metrics(metrics);
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => return argument_error(e),
    };

    init_tracing(cli.debug.is_some());

    match run(cli) {
        Ok(report) => {
            println!("{}", report.output_line());
            exit_code(report.severity())
        }
        Err(e) => {
            println!("{} {}: {:#}", CHECK_NAME, Severity::Unknown.label(), e);
            exit_code(Severity::Unknown)
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> anyhow::Result<ProbeReport> {
    let config = cli.into_config()?;
    let probe = Probe::new(config);
    let report = probe.run(shutdown_signal()).await;

    if let Some(err) = &report.metrics_error {
        warn!(error = %err, "Check result stands, metrics were lost");
    }
    Ok(report)
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("lifecycle_probe=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "lifecycle_probe=info,warn".into())
    };

    // stdout carries the check line only
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn argument_error(e: clap::Error) -> ExitCode {
    match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = e.print();
            ExitCode::SUCCESS
        }
        _ => {
            let _ = e.print();
            println!("{} {}: invalid arguments", CHECK_NAME, Severity::Unknown.label());
            exit_code(Severity::Unknown)
        }
    }
}

fn exit_code(severity: Severity) -> ExitCode {
    ExitCode::from(severity.exit_code() as u8)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
