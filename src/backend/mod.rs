//! The SSH-to-container backend.
//!
//! One [`NetworkHandler`] is created per SSH network connection. After a
//! successful handshake it hands out a connection handler whose session
//! channels are served by [`ChannelHandler`]s. Depending on the execution
//! mode, programs run as execs against a per-connection container or as the
//! main process of a per-session container.

mod channel;
mod container;
mod execution;
mod image;
mod network;

pub use channel::ChannelHandler;
pub use container::Container;
pub use execution::Execution;
pub use network::NetworkHandler;

use std::net::SocketAddr;

use tracing::warn;

use crate::config::{self, Config, DockerRunConfig, ExecutionMode};
use crate::engine::EngineError;
use crate::metrics::BackendMetrics;

/// Errors surfaced to the SSH client on channel requests.
///
/// The display strings are user-visible: the SSH server forwards them in
/// channel failure messages.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("program already running")]
    ProgramAlreadyRunning,

    #[error("cannot perform request, program is not running")]
    ProgramNotRunning,

    #[error("command execution is disabled")]
    ExecutionDisabled,

    #[error("the specified subsystem is not supported ({0})")]
    SubsystemNotSupported(String),

    #[error("cannot send signal, no process ID recorded")]
    SignalNoPid,

    #[error("cannot send signal, guest agent support is disabled")]
    SignalNoAgent,

    #[error("cannot send signal")]
    CannotSendSignal,

    #[error("cannot run program, the connection is shutting down")]
    ShuttingDown,

    #[error("no container engine connection")]
    NotConnected,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Create a network connection handler for one SSH connection.
///
/// `client_addr` is the remote address of the SSH client, `connection_id` a
/// unique identifier assigned by the server; both end up as labels on every
/// container this connection creates.
pub fn new(
    client_addr: SocketAddr,
    connection_id: &str,
    config: Config,
    metrics: BackendMetrics,
) -> config::Result<NetworkHandler> {
    config.validate()?;

    if config.execution.disable_agent {
        warn!(
            "Guest agent support is disabled. Signal delivery to processes \
             and several other SSH features will not work."
        );
        if config.execution.mode == ExecutionMode::Connection
            && config.execution.idle_command == config::default_idle_command()
        {
            warn!(
                "Guest agent support is disabled, but the execution mode is \"connection\" and \
                 the idle command still points at the agent to provide an init process. This is \
                 very likely to break unless the agent is installed in the guest image."
            );
        }
    }

    Ok(NetworkHandler::new(
        client_addr,
        connection_id.to_string(),
        config,
        metrics,
    ))
}

/// Create a network connection handler from the deprecated flat
/// configuration shape.
pub fn new_docker_run(
    client_addr: SocketAddr,
    connection_id: &str,
    legacy: DockerRunConfig,
    metrics: BackendMetrics,
) -> config::Result<NetworkHandler> {
    warn!(
        "You are using the deprecated flat configuration format. Please switch to the \
         structured configuration as soon as possible; this format will be removed."
    );
    legacy.validate()?;
    new(client_addr, connection_id, legacy.into_config(), metrics)
}
