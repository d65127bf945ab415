//! Backend configuration.
//!
//! The configuration is validated once at construction and treated as
//! immutable afterwards. The launch section inlines the engine-native
//! container/host/network specifications so that operators can pass anything
//! the engine accepts; see [`LaunchConfig`].

mod execution;
mod launch;
mod legacy;
mod timeouts;

pub use execution::{ExecutionConfig, ExecutionMode, ImagePullPolicy};
pub(crate) use execution::default_idle_command;
pub use launch::{LaunchConfig, NetworkSpec, DEFAULT_IMAGE};
pub use legacy::{DockerRunConfig, DockerRunContainerConfig};
pub use timeouts::TimeoutConfig;

use serde::{Deserialize, Serialize};

/// Configuration errors reported at construction time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid connection configuration ({0})")]
    Connection(String),

    #[error("invalid execution configuration ({0})")]
    Execution(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Base configuration of the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// How to connect to the container engine.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// How containers and workloads are executed.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Timeouts for engine interactions.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.execution.validate()?;
        Ok(())
    }
}

/// Configures how to connect to the container engine daemon.
///
/// The URL scheme of `host` selects the transport: `unix://` for a Unix
/// domain socket, `npipe://` for a Windows named pipe, `tcp://` for TCP. When
/// the PEM fields are set the TCP transport uses mutual TLS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Engine connect URL.
    #[serde(default = "default_host")]
    pub host: String,
    /// CA certificate in PEM format, embedded in the configuration.
    #[serde(default)]
    pub cacert: String,
    /// Client certificate in PEM format, embedded in the configuration.
    #[serde(default)]
    pub cert: String,
    /// Client key in PEM format, embedded in the configuration.
    #[serde(default)]
    pub key: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            cacert: String::new(),
            cert: String::new(),
            key: String::new(),
        }
    }
}

#[cfg(not(windows))]
fn default_host() -> String {
    "unix:///var/run/docker.sock".to_string()
}

#[cfg(windows)]
fn default_host() -> String {
    "npipe:////./pipe/docker_engine".to_string()
}

impl ConnectionConfig {
    /// Whether the TLS material is present.
    pub fn tls_enabled(&self) -> bool {
        !self.cacert.is_empty() || !self.cert.is_empty() || !self.key.is_empty()
    }

    /// Validate the connection configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ConfigError::Connection("missing host".to_string()));
        }
        if self.tls_enabled()
            && (self.cacert.is_empty() || self.cert.is_empty() || self.key.is_empty())
        {
            return Err(ConfigError::Connection(
                "cacert, cert and key must all be set to enable TLS".to_string(),
            ));
        }
        Ok(())
    }
}
