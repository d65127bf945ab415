//! Engine-native launch configuration.

use std::collections::HashMap;

use bollard::models::{ContainerConfig, EndpointSettings, HostConfig};
use serde::{Deserialize, Serialize};

use super::{ConfigError, Result};

/// Default image launched when the configuration does not name one.
pub const DEFAULT_IMAGE: &str = "containerssh/containerssh-guest-image";

/// Container launch configuration, passed to the engine as-is.
///
/// These fields are inlined into the execution section of the configuration
/// file, so `container`, `host`, `network` and `platform` sit next to `mode`,
/// `idleCommand` and the other execution options. Unknown keys inside the
/// engine specs are ignored: the engine treats removed fields as
/// backwards-compatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Container-specific configuration options.
    #[serde(default = "default_container_spec")]
    pub container: Option<ContainerConfig>,
    /// Host-specific configuration options.
    #[serde(default)]
    pub host: Option<HostConfig>,
    /// Network endpoint settings.
    #[serde(default)]
    pub network: Option<NetworkSpec>,
    /// Platform selector in `os[/arch[/variant]]` form, passed to the engine
    /// on container creation.
    #[serde(default)]
    pub platform: Option<String>,
    /// Name for the launched container. Best left empty: a fixed name
    /// prevents more than one container from existing at a time.
    #[serde(default)]
    pub containername: String,
}

/// Network settings for the created container, keyed by network name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Endpoint configuration per network.
    #[serde(default, rename = "EndpointsConfig")]
    pub endpoints_config: HashMap<String, EndpointSettings>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            container: default_container_spec(),
            host: None,
            network: None,
            platform: None,
            containername: String::new(),
        }
    }
}

fn default_container_spec() -> Option<ContainerConfig> {
    Some(ContainerConfig {
        image: Some(DEFAULT_IMAGE.to_string()),
        ..Default::default()
    })
}

impl LaunchConfig {
    /// The image reference the backend launches.
    pub fn image(&self) -> &str {
        self.container
            .as_ref()
            .and_then(|spec| spec.image.as_deref())
            .unwrap_or("")
    }

    /// Validate the launch configuration.
    pub fn validate(&self) -> Result<()> {
        let container = self
            .container
            .as_ref()
            .ok_or_else(|| ConfigError::Execution("no container config provided".to_string()))?;
        if container.image.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Execution("no image name provided".to_string()));
        }
        Ok(())
    }
}
