//! Error types for the lifecycle probe

use crate::run::ResourceKind;
use crate::severity::Severity;
use std::time::Duration;
use thiserror::Error;

/// Probe result type
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Errors that can occur while probing the cloud
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Probe input is malformed (missing credentials, bad URL, unreadable CA file)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Identity service rejected the credentials
    #[error("Authentication rejected: {0}")]
    InvalidCredentials(String),

    /// Session could not be established (unreachable endpoint, bad catalog, timeout)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Cloud API answered with an unexpected status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Resource does not exist (HTTP 404)
    #[error("{0} not found")]
    NotFound(String),

    /// Resource creation failed
    #[error("Failed to create {kind}: {detail}")]
    ResourceCreate { kind: ResourceKind, detail: String },

    /// Attach/associate failed
    #[error("Failed to attach {kind}: {detail}")]
    Attach { kind: ResourceKind, detail: String },

    /// Detach/disassociate failed
    #[error("Failed to detach {kind}: {detail}")]
    Detach { kind: ResourceKind, detail: String },

    /// Delete/release failed
    #[error("Failed to delete {kind}: {detail}")]
    Delete { kind: ResourceKind, detail: String },

    /// Resource reached a terminal failure state
    #[error("{0}")]
    InvalidState(String),

    /// A bounded poll ran past its deadline
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// Reconciliation could not complete
    #[error("Cleanup error: {0}")]
    Cleanup(String),

    /// Metrics sink unreachable or write failed
    #[error("Failed to send metrics: {0}")]
    MetricsSend(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProbeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a resource state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a cleanup error
    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    /// Wrap a failure of a create call
    pub fn create(kind: ResourceKind, err: impl std::fmt::Display) -> Self {
        Self::ResourceCreate {
            kind,
            detail: err.to_string(),
        }
    }

    /// Wrap a failure of an attach call
    pub fn attach(kind: ResourceKind, err: impl std::fmt::Display) -> Self {
        Self::Attach {
            kind,
            detail: err.to_string(),
        }
    }

    /// Wrap a failure of a detach call
    pub fn detach(kind: ResourceKind, err: impl std::fmt::Display) -> Self {
        Self::Detach {
            kind,
            detail: err.to_string(),
        }
    }

    /// Wrap a failure of a delete call
    pub fn delete(kind: ResourceKind, err: impl std::fmt::Display) -> Self {
        Self::Delete {
            kind,
            detail: err.to_string(),
        }
    }

    /// Create a poll timeout error
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Error text without its prefix, for step outcomes and reports
    pub fn detail(&self) -> String {
        match self {
            Self::ResourceCreate { detail, .. }
            | Self::Attach { detail, .. }
            | Self::Detach { detail, .. }
            | Self::Delete { detail, .. } => detail.clone(),
            Self::Cleanup(detail) | Self::MetricsSend(detail) => detail.clone(),
            other => other.to_string(),
        }
    }

    /// True when the cloud reported the resource as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Api { status: 404, .. })
    }

    /// Severity a session-level failure maps to.
    ///
    /// Bad input (configuration or credentials) cannot even attempt the probe
    /// and is `Unknown`; everything else means the cloud is unhealthy.
    pub fn severity_category(&self) -> Severity {
        match self {
            Self::InvalidConfig(_) | Self::InvalidCredentials(_) => Severity::Unknown,
            _ => Severity::Critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_category() {
        assert_eq!(
            ProbeError::config("missing --password").severity_category(),
            Severity::Unknown
        );
        assert_eq!(
            ProbeError::InvalidCredentials("401".into()).severity_category(),
            Severity::Unknown
        );
        assert_eq!(
            ProbeError::connection("connection refused").severity_category(),
            Severity::Critical
        );
    }

    #[test]
    fn test_not_found_detection() {
        assert!(ProbeError::NotFound("server abc".into()).is_not_found());
        assert!(
            ProbeError::Api {
                status: 404,
                message: "gone".into()
            }
            .is_not_found()
        );
        assert!(!ProbeError::connection("refused").is_not_found());
    }

    #[test]
    fn test_step_error_display() {
        let err = ProbeError::create(ResourceKind::FloatingIp, "No more floating IPs in pool ext");
        assert_eq!(
            err.to_string(),
            "Failed to create fip: No more floating IPs in pool ext"
        );
        assert_eq!(err.detail(), "No more floating IPs in pool ext");

        let err = ProbeError::timeout("volume v1 to become in-use", Duration::from_secs(3));
        assert_eq!(
            err.to_string(),
            "Timed out after 3s waiting for volume v1 to become in-use"
        );
    }
}
