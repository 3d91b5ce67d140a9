//! Error types for the upstream-proxy application.
//!
//! A single error enum covers the whole request path. Configuration errors
//! are fatal at startup; every other variant is isolated to the request
//! that produced it and ends up as a `502 Bad Gateway` at the proxy
//! boundary.

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the upstream-proxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The required target host was not provided.
    #[error("No value for env var {var:?} provided")]
    MissingTargetHost { var: &'static str },

    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// Hostname lookup failed and no cached record was available.
    #[error("lookup {host} failed: {source}")]
    Resolution {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Hostname lookup did not finish in time.
    #[error("lookup {host} timed out after {timeout:?}")]
    ResolutionTimeout { host: String, timeout: Duration },

    /// The resolver answered without any usable address.
    #[error("lookup {host}: no addresses found")]
    NoAddresses { host: String },

    /// An address could not be split into host and port.
    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },

    /// Every candidate address refused or timed out.
    #[error("dial tcp {host}:{port}: tried {attempted:?}: {source}")]
    Dial {
        host: String,
        port: u16,
        attempted: Vec<IpAddr>,
        #[source]
        source: std::io::Error,
    },

    /// The inbound request could not be turned into an upstream request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The upstream exchange failed after the request was handed to the client.
    #[error("upstream request failed: {source}")]
    Upstream {
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Whether this error is a fatal startup misconfiguration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::MissingTargetHost { .. }
                | Self::ConfigNotFound { .. }
                | Self::ConfigParse { .. }
                | Self::ConfigValidation { .. }
        )
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(source: hyper_util::client::legacy::Error) -> Self {
        Self::Upstream { source }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
