use crate::trust::{TrustList, TrustListError};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Tunnel path must start with '/': {0}")]
    InvalidPath(String),

    #[error("Invalid allowed origin: {0}")]
    InvalidOrigin(String),

    #[error("Invalid trust list: {0}")]
    TrustList(#[from] TrustListError),

    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),

    #[error("Initial backoff ({initial_ms}ms) is greater than max backoff ({max_ms}ms)")]
    InvalidBackoff { initial_ms: u64, max_ms: u64 },
}

/// Tunnel configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for tunnel requests
    pub listener: Listener,
    /// Listener for health and readiness checks
    #[serde(default = "Listener::admin_default")]
    pub admin_listener: Listener,
    /// Path the tunnel endpoint is mounted on
    #[serde(default = "default_path")]
    pub path: String,
    /// DSNs envelopes may be forwarded to, without keys. Empty trusts all.
    #[serde(default)]
    pub trusted_dsns: Vec<String>,
    /// Origins allowed to call the tunnel from a browser. Empty allows all.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Deadline for a whole tunnel request, retries included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Timeout of a single upstream attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Largest accepted envelope
    #[serde(default = "default_max_envelope_bytes")]
    pub max_envelope_bytes: usize,
    /// Remove keys from the envelope header and send them as `X-Sentry-Auth`
    #[serde(default)]
    pub strip_dsn_credentials: bool,
    /// How long in-flight requests may run after shutdown is requested
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Validates the tunnel configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if !self.path.starts_with('/') {
            return Err(ValidationError::InvalidPath(self.path.clone()));
        }

        for origin in &self.allowed_origins {
            validate_origin(origin)?;
        }

        self.trust_list()?;

        if self.request_timeout_secs == 0 {
            return Err(ValidationError::ZeroValue("request_timeout_secs"));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(ValidationError::ZeroValue("attempt_timeout_secs"));
        }
        if self.max_envelope_bytes == 0 {
            return Err(ValidationError::ZeroValue("max_envelope_bytes"));
        }

        self.retry.validate()
    }

    pub fn trust_list(&self) -> Result<TrustList, TrustListError> {
        TrustList::from_entries(&self.trusted_dsns)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn validate_origin(origin: &str) -> Result<(), ValidationError> {
    if origin == "*" {
        return Ok(());
    }

    let url = Url::parse(origin).map_err(|_| ValidationError::InvalidOrigin(origin.into()))?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(ValidationError::InvalidOrigin(origin.into())),
    }
}

fn default_path() -> String {
    "/tunnel".into()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_attempt_timeout_secs() -> u64 {
    15
}

fn default_max_envelope_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    fn admin_default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 8081,
        }
    }

    /// Validates the listener configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Upstream retry policy
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, the first one included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::ZeroValue("retry.max_attempts"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ValidationError::InvalidBackoff {
                initial_ms: self.initial_backoff_ms,
                max_ms: self.max_backoff_ms,
            });
        }
        Ok(())
    }
}
