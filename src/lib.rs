//! # gangplank
//!
//! An SSH-to-container backend: for every SSH connection it provisions
//! containers on a Docker Engine API compatible daemon and bridges SSH
//! session semantics onto container and exec operations.
//!
//! ## Architecture Overview
//!
//! The crate is organized into a few modules:
//!
//! - [`config`]: validated, immutable configuration, including the inlined
//!   engine-native launch specs and the deprecated flat legacy shape
//! - [`engine`]: typed facade over the engine HTTP API, the uniform
//!   retry/backoff loop and the attach stream codec
//! - [`backend`]: the handlers bridging SSH events to the engine - network
//!   connection, session channel, container and execution
//! - [`sshserver`]: the trait surface an embedding SSH server drives
//! - [`metrics`]: the request/failure counter pair provided by the host
//!
//! ## Execution modes
//!
//! In *connection* mode one container is created per SSH connection when the
//! handshake succeeds; programs run as engine execs against it while the
//! container's main process runs a configurable idle command. In *session*
//! mode every session channel creates its own container and the requested
//! program is the container's main process.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gangplank::config::Config;
//! use gangplank::metrics::BackendMetrics;
//! use gangplank::sshserver::NetworkConnectionHandler;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: Config = serde_yaml::from_str("execution:\n  mode: connection\n")?;
//!     let handler = gangplank::new(
//!         "192.0.2.1:48122".parse()?,
//!         "0123456789abcdef",
//!         config,
//!         BackendMetrics::unregistered(),
//!     )?;
//!
//!     // Driven by the embedding SSH server:
//!     let connection = handler.on_handshake_success("someuser").await?;
//!     # let _ = connection;
//!     handler.on_disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod sshserver;

pub use backend::{new, new_docker_run, ChannelError, NetworkHandler};
pub use config::{Config, ConfigError, DockerRunConfig, ExecutionMode, ImagePullPolicy};
pub use engine::{EngineClient, EngineError};
pub use metrics::BackendMetrics;
