//! Graphite metrics
//!
//! One plaintext line per step, `<prefix>.<step> <seconds> <unix-ts>`, sent
//! over a short-lived TCP connection. Delivery is best effort: the caller logs
//! a failure and moves on, it never changes the verdict.

use crate::config::MetricsConfig;
use crate::error::{ProbeError, Result};
use crate::run::{ProbeRun, StepName};
use chrono::{DateTime, Utc};
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Namespace appended to the cloud name in the default prefix
pub const METRIC_NAMESPACE: &str = "openstack.boot_attach_fip_volume";

/// Default prefix: first DNS label of the auth host plus [`METRIC_NAMESPACE`]
///
/// `https://keystone.cloud1.example.com:5000/v3` → `keystone.openstack.boot_attach_fip_volume`
pub fn metric_prefix(auth_url: &str) -> String {
    let cloud = Url::parse(auth_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.split('.').next().unwrap_or(h).to_string()))
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}.{}", cloud, METRIC_NAMESPACE)
}

/// Render one line per step in execution order. Only successful steps report
/// their duration; failed and skipped steps report `0`.
pub fn render_lines(run: &ProbeRun, prefix: &str, timestamp: i64) -> Vec<String> {
    StepName::ALL
        .iter()
        .map(|name| {
            let value = match run.get(*name) {
                Some(o) if o.is_success() => format!("{:.3}", o.duration().as_secs_f64()),
                _ => "0".to_string(),
            };
            format!("{}.{} {} {}", prefix, name.metric_name(), value, timestamp)
        })
        .collect()
}

/// Sends run metrics to a Graphite plaintext listener
#[derive(Debug, Clone)]
pub struct MetricsEmitter {
    config: MetricsConfig,
    prefix: String,
}

impl MetricsEmitter {
    /// Create an emitter; the prefix falls back to the one derived from `auth_url`
    pub fn new(config: MetricsConfig, auth_url: &str) -> Self {
        let prefix = config
            .prefix
            .clone()
            .unwrap_or_else(|| metric_prefix(auth_url));
        Self { config, prefix }
    }

    /// Metric prefix in use
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Send all step metrics, returns the number of lines written
    pub async fn emit(&self, run: &ProbeRun, at: DateTime<Utc>) -> Result<usize> {
        let lines = render_lines(run, &self.prefix, at.timestamp());
        let mut payload = lines.join("\n");
        payload.push('\n');

        self.send(payload.as_bytes()).await?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            lines = lines.len(),
            "Metrics sent"
        );
        Ok(lines.len())
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        debug!(%address, bytes = payload.len(), "Connecting to metrics sink");

        let mut stream = match timeout(self.config.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ProbeError::MetricsSend(format!("connect to {}: {}", address, e)));
            }
            Err(_) => {
                return Err(ProbeError::MetricsSend(format!(
                    "connect to {} timed out after {:?}",
                    address, self.config.timeout
                )));
            }
        };

        let write = async {
            stream.write_all(payload).await?;
            stream.shutdown().await
        };
        match timeout(self.config.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::MetricsSend(format!("write to {}: {}", address, e))),
            Err(_) => Err(ProbeError::MetricsSend(format!(
                "write to {} timed out after {:?}",
                address, self.config.timeout
            ))),
        }
    }
}
