//! Typed facade over the container engine HTTP API.
//!
//! One [`EngineClient`] is created lazily per SSH connection and shared by
//! all of its channels. Every method performs a single engine request; the
//! callers wrap them in the [retry loop](super::retry). The transport is
//! chosen by the URL scheme of the configured host, and the API version is
//! negotiated with the daemon at construction.

use std::pin::Pin;
use std::sync::Arc;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerSpec,
    CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    ResizeContainerTtyOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ExecInspectResponse};
use bollard::Docker;
use futures::stream::StreamExt;
use futures::Stream;
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::config::Config;
use crate::metrics::BackendMetrics;

use super::{EngineError, Result};

/// The demultiplexed output side of an attach or exec stream.
pub(crate) type OutputStream =
    Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>;

/// The write side of an attach or exec stream.
pub(crate) type InputWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Both endpoints of a hijacked duplex stream, plus any bytes already
/// consumed from the output side (by the PID pre-read) that still belong to
/// the program's stdout.
pub(crate) struct AttachedIo {
    pub output: OutputStream,
    pub input: InputWriter,
    pub leftover: Vec<u8>,
}

/// Client for a Docker Engine API compatible daemon.
#[derive(Clone)]
pub struct EngineClient {
    docker: Arc<Docker>,
    config: Arc<Config>,
    metrics: BackendMetrics,
}

impl EngineClient {
    /// Connect to the engine configured in `config.connection`.
    ///
    /// The constructors are lazy: no request is made until the version
    /// negotiation, and a failed negotiation falls back to the default API
    /// version so that an unreachable daemon surfaces on the first real
    /// operation, bounded by that operation's deadline.
    pub async fn connect(config: Arc<Config>, metrics: BackendMetrics) -> Result<Self> {
        let host = config.connection.host.trim().to_string();
        let timeout = config.timeouts.http.as_secs().max(1);

        let docker = if host.starts_with("unix://") {
            Docker::connect_with_unix(&host, timeout, bollard::API_DEFAULT_VERSION)?
        } else if host.starts_with("npipe://") {
            Self::connect_named_pipe(&host, timeout)?
        } else if config.connection.tls_enabled() {
            Self::connect_tls(&config, &host, timeout)?
        } else {
            Docker::connect_with_http(&host, timeout, bollard::API_DEFAULT_VERSION)?
        };

        let docker = match docker.clone().negotiate_version().await {
            Ok(negotiated) => negotiated,
            Err(err) => {
                debug!(
                    "API version negotiation failed, using the default version ({})",
                    err
                );
                docker
            }
        };

        Ok(Self {
            docker: Arc::new(docker),
            config,
            metrics,
        })
    }

    #[cfg(windows)]
    fn connect_named_pipe(host: &str, timeout: u64) -> Result<Docker> {
        Ok(Docker::connect_with_named_pipe(
            host,
            timeout,
            bollard::API_DEFAULT_VERSION,
        )?)
    }

    #[cfg(not(windows))]
    fn connect_named_pipe(host: &str, _timeout: u64) -> Result<Docker> {
        Err(EngineError::UnsupportedTransport(host.to_string()))
    }

    /// Stage the inline PEM material on disk and build a mutual-TLS
    /// transport from it. The connector loads the files eagerly, so the
    /// staging directory is deleted again when this function returns.
    fn connect_tls(config: &Config, host: &str, timeout: u64) -> Result<Docker> {
        let staging = tempfile::tempdir()?;
        let ca_path = staging.path().join("ca.pem");
        let cert_path = staging.path().join("cert.pem");
        let key_path = staging.path().join("key.pem");
        std::fs::write(&ca_path, &config.connection.cacert)?;
        std::fs::write(&cert_path, &config.connection.cert)?;
        std::fs::write(&key_path, &config.connection.key)?;
        Ok(Docker::connect_with_ssl(
            host,
            &key_path,
            &cert_path,
            &ca_path,
            timeout,
            bollard::API_DEFAULT_VERSION,
        )?)
    }

    pub(crate) fn metrics(&self) -> &BackendMetrics {
        &self.metrics
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The image reference this backend launches.
    pub(crate) fn image_name(&self) -> &str {
        self.config.execution.launch.image()
    }

    /// Whether the configured image is present in the local image store.
    pub(crate) async fn has_image(&self) -> Result<bool> {
        let image = self.image_name();
        debug!("Checking if image {} exists locally...", image);
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = EngineError::from(err);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Pull the configured image, draining the progress stream.
    pub(crate) async fn pull_image(&self) -> Result<()> {
        let image = canonical_image_name(self.image_name());
        debug!("Pulling image {}...", image);
        let mut progress = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.as_str(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(update) = progress.next().await {
            let update = update?;
            if let Some(error) = update.error {
                return Err(EngineError::Api(
                    bollard::errors::Error::DockerStreamError { error },
                ));
            }
        }
        Ok(())
    }

    /// Create a container from the assembled spec. Returns the container ID.
    pub(crate) async fn create_container(
        &self,
        spec: ContainerSpec<String>,
        name: Option<&str>,
        platform: Option<&str>,
    ) -> Result<String> {
        let options = if name.is_some() || platform.is_some() {
            Some(CreateContainerOptions {
                name: name.unwrap_or("").to_string(),
                platform: platform.map(str::to_string),
            })
        } else {
            None
        };
        let response = self.docker.create_container(options, spec).await?;
        Ok(response.id)
    }

    pub(crate) async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(
                container_id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<()> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_secs }))
            .await?;
        Ok(())
    }

    pub(crate) async fn kill_container(&self, container_id: &str, signal: &str) -> Result<()> {
        self.docker
            .kill_container(container_id, Some(KillContainerOptions { signal }))
            .await?;
        Ok(())
    }

    pub(crate) async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn inspect_container(
        &self,
        container_id: &str,
    ) -> Result<ContainerInspectResponse> {
        Ok(self
            .docker
            .inspect_container(
                container_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await?)
    }

    /// Attach to the container's main process.
    pub(crate) async fn attach_container(&self, container_id: &str) -> Result<AttachedIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(container_id, Some(options))
            .await?;
        Ok(AttachedIo {
            output,
            input,
            leftover: Vec::new(),
        })
    }

    pub(crate) async fn resize_container(
        &self,
        container_id: &str,
        height: u16,
        width: u16,
    ) -> Result<()> {
        self.docker
            .resize_container_tty(container_id, ResizeContainerTtyOptions { height, width })
            .await?;
        Ok(())
    }

    /// Create an exec in a running container. Returns the exec ID.
    pub(crate) async fn create_exec(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<String> {
        let response = self.docker.create_exec(container_id, options).await?;
        Ok(response.id)
    }

    /// Start a previously created exec and attach to its streams.
    pub(crate) async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<AttachedIo> {
        let started = self
            .docker
            .start_exec(
                exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty,
                    ..Default::default()
                }),
            )
            .await?;
        match started {
            StartExecResults::Attached { output, input } => Ok(AttachedIo {
                output,
                input,
                leftover: Vec::new(),
            }),
            StartExecResults::Detached => Err(EngineError::ExecAttach(
                "the engine started the exec detached".to_string(),
            )),
        }
    }

    pub(crate) async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()> {
        self.docker
            .resize_exec(exec_id, ResizeExecOptions { height, width })
            .await?;
        Ok(())
    }

    pub(crate) async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse> {
        Ok(self.docker.inspect_exec(exec_id).await?)
    }
}

/// Canonicalise an image reference for pulling: bare names gain the
/// `docker.io/library/` prefix, unqualified repository paths gain
/// `docker.io/`.
pub(crate) fn canonical_image_name(image: &str) -> String {
    let image = image.trim();
    match image.split_once('/') {
        None => format!("docker.io/library/{image}"),
        Some((registry, _))
            if registry.contains('.') || registry.contains(':') || registry == "localhost" =>
        {
            image.to_string()
        }
        Some(_) => format!("docker.io/{image}"),
    }
}
