//! Execution configuration: modes, commands and image pull policy.

use std::collections::HashMap;

use bollard::models::RestartPolicyNameEnum;
use serde::{Deserialize, Serialize};

use super::{ConfigError, LaunchConfig, Result};

/// Determines when a container is launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One container per SSH connection. Programs run as execs against it
    /// while the main container process runs the idle command.
    #[default]
    Connection,
    /// One container per SSH session. The program is launched directly as
    /// the main process of the container, so one connection may create
    /// several containers.
    Session,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Connection => write!(f, "connection"),
            ExecutionMode::Session => write!(f, "session"),
        }
    }
}

/// Controls when the container image is pulled. The values are aligned with
/// the Kubernetes image pull policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    /// Pull the image on every connection.
    Always,
    /// Pull if the image is not present locally, has no tag, or is tagged
    /// `latest`.
    #[default]
    IfNotPresent,
    /// Never pull; the connection fails if the image is absent.
    Never,
}

/// Configuration of what to run and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Engine-native launch configuration, inlined.
    #[serde(flatten)]
    pub launch: LaunchConfig,

    /// Execution mode.
    #[serde(default)]
    pub mode: ExecutionMode,

    /// First process of the container in connection mode; it should wait
    /// until signalled. Ignored in session mode.
    #[serde(default = "default_idle_command", rename = "idleCommand")]
    pub idle_command: Vec<String>,

    /// Program launched for shell requests in connection mode. Ignored in
    /// session mode.
    #[serde(default = "default_shell_command", rename = "shellCommand")]
    pub shell_command: Vec<String>,

    /// Path to the guest agent inside the container image.
    #[serde(default = "default_agent_path", rename = "agentPath")]
    pub agent_path: String,

    /// Disables guest agent support. Strongly discouraged: without the agent
    /// there is no process ID to deliver signals to and no init process for
    /// connection mode.
    #[serde(default, rename = "disableAgent")]
    pub disable_agent: bool,

    /// Subsystem names mapped to binaries inside the container.
    #[serde(default = "default_subsystems")]
    pub subsystems: HashMap<String, String>,

    /// Image pull policy.
    #[serde(default, rename = "imagePullPolicy")]
    pub image_pull_policy: ImagePullPolicy,

    /// Command execution disabled, retained from the legacy configuration
    /// shape. Not part of the serialized surface.
    #[serde(skip)]
    pub(crate) disable_command: bool,
}

pub(crate) fn default_idle_command() -> Vec<String> {
    vec![
        "/usr/bin/containerssh-agent".to_string(),
        "wait-signal".to_string(),
        "--signal".to_string(),
        "INT".to_string(),
        "--signal".to_string(),
        "TERM".to_string(),
    ]
}

fn default_shell_command() -> Vec<String> {
    vec!["/bin/bash".to_string()]
}

fn default_agent_path() -> String {
    "/usr/bin/containerssh-agent".to_string()
}

pub(crate) fn default_subsystems() -> HashMap<String, String> {
    let mut subsystems = HashMap::new();
    subsystems.insert(
        "sftp".to_string(),
        "/usr/lib/openssh/sftp-server".to_string(),
    );
    subsystems
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            launch: LaunchConfig::default(),
            mode: ExecutionMode::default(),
            idle_command: default_idle_command(),
            shell_command: default_shell_command(),
            agent_path: default_agent_path(),
            disable_agent: false,
            subsystems: default_subsystems(),
            image_pull_policy: ImagePullPolicy::default(),
            disable_command: false,
        }
    }
}

impl ExecutionConfig {
    /// Validate the execution configuration.
    pub fn validate(&self) -> Result<()> {
        if self.mode == ExecutionMode::Connection && self.idle_command.is_empty() {
            return Err(ConfigError::Execution(
                "idle command required for execution mode \"connection\"".to_string(),
            ));
        }
        if self.mode == ExecutionMode::Connection && self.shell_command.is_empty() {
            return Err(ConfigError::Execution(
                "shell command required for execution mode \"connection\"".to_string(),
            ));
        }
        if self.mode == ExecutionMode::Session {
            if let Some(policy) = self
                .launch
                .host
                .as_ref()
                .and_then(|host| host.restart_policy.as_ref())
            {
                match policy.name {
                    None | Some(RestartPolicyNameEnum::EMPTY) | Some(RestartPolicyNameEnum::NO) => {
                    }
                    Some(name) => {
                        return Err(ConfigError::Execution(format!(
                            "unsupported restart policy for execution mode \"session\": {:?} \
                             (session containers may not restart)",
                            name
                        )));
                    }
                }
            }
        }
        self.launch.validate()?;
        Ok(())
    }
}
