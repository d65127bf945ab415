//! The deprecated flat configuration shape, kept readable for existing
//! deployments and translated into [`Config`](super::Config) at construction.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::execution::default_subsystems;
use super::{
    Config, ConfigError, ConnectionConfig, ExecutionConfig, ExecutionMode, ImagePullPolicy,
    LaunchConfig, Result, TimeoutConfig,
};

/// The legacy configuration format.
///
/// Connection parameters sit at the top level and the launch specification
/// lives under `config`, together with `subsystems`, `disableCommand` and a
/// single `timeout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerRunConfig {
    /// Engine connect URL.
    #[serde(default = "super::default_host")]
    pub host: String,
    /// CA certificate in PEM format.
    #[serde(default)]
    pub cacert: String,
    /// Client certificate in PEM format.
    #[serde(default)]
    pub cert: String,
    /// Client key in PEM format.
    #[serde(default)]
    pub key: String,
    /// Container configuration.
    #[serde(default)]
    pub config: DockerRunContainerConfig,
}

/// The `config` section of the legacy format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerRunContainerConfig {
    /// Engine-native launch configuration, inlined.
    #[serde(flatten)]
    pub launch: LaunchConfig,
    /// Subsystem names mapped to binaries inside the container.
    #[serde(default = "default_subsystems")]
    pub subsystems: HashMap<String, String>,
    /// Refuse exec requests carrying a command.
    #[serde(default, rename = "disableCommand")]
    pub disable_command: bool,
    /// Timeout for container creation, start and command start.
    #[serde(
        default = "default_timeout",
        with = "super::timeouts::duration_format"
    )]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for DockerRunContainerConfig {
    fn default() -> Self {
        Self {
            launch: LaunchConfig::default(),
            subsystems: default_subsystems(),
            disable_command: false,
            timeout: default_timeout(),
        }
    }
}

impl DockerRunConfig {
    /// Validate the legacy configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ConfigError::Connection(
                "empty engine host provided".to_string(),
            ));
        }
        self.config.launch.validate()?;
        Ok(())
    }

    /// Translate into the canonical configuration.
    ///
    /// The legacy backend always ran one container per session without guest
    /// agent support and pulled the image on every connection; the single
    /// timeout fans out into the container and command start/stop timeouts.
    pub fn into_config(self) -> Config {
        Config {
            connection: ConnectionConfig {
                host: self.host,
                cacert: self.cacert,
                cert: self.cert,
                key: self.key,
            },
            execution: ExecutionConfig {
                launch: self.config.launch,
                mode: ExecutionMode::Session,
                idle_command: Vec::new(),
                shell_command: Vec::new(),
                agent_path: String::new(),
                disable_agent: true,
                subsystems: self.config.subsystems,
                image_pull_policy: ImagePullPolicy::Always,
                disable_command: self.config.disable_command,
            },
            timeouts: TimeoutConfig {
                container_start: self.config.timeout,
                container_stop: self.config.timeout,
                command_start: self.config.timeout,
                ..Default::default()
            },
        }
    }
}
