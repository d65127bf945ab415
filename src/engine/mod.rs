//! Container engine interface.
//!
//! A typed facade over the engine's HTTP API ([`client`]), the uniform retry
//! loop applied to every engine call ([`retry`]) and the attach stream codec
//! ([`codec`]). All engine errors are classified as either *permanent*
//! (retrying cannot help) or *transient* (retried with a fixed backoff until
//! the operation deadline fires).

pub(crate) mod client;
pub(crate) mod codec;
pub(crate) mod retry;

pub use client::EngineClient;

/// Errors produced by engine interactions.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Error reported by the engine API or its transport.
    #[error("container engine API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// The operation deadline fired before any attempt failed or succeeded.
    #[error("timeout")]
    Timeout,

    /// I/O error while preparing the engine connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine accepted the exec start but did not attach the stream.
    #[error("failed to attach to exec: {0}")]
    ExecAttach(String),

    /// The connection URL names a transport this platform does not support.
    #[error("unsupported connection transport: {0}")]
    UnsupportedTransport(String),

    /// The container is still running while its exit code was requested.
    #[error("container still running")]
    StillRunning,

    /// The container is restarting; the backend never configures restarting
    /// containers, so this points at a host configuration problem.
    #[error("container restarting")]
    Restarting,

    /// The engine reported a negative exit code.
    #[error("negative exit code: {0}")]
    NegativeExitCode(i64),

    /// The guest agent wrote to stderr instead of announcing the process ID.
    /// The guest image most likely does not contain the agent binary.
    #[error("failed to read from the guest agent: {0}")]
    AgentRead(String),

    /// The process ID announcement from the guest agent could not be read.
    #[error("failed to read process ID from the guest agent: {0}")]
    PidRead(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether retrying cannot recover from this error.
    ///
    /// Permanent errors are those the engine reports as not-found,
    /// unauthorized, permission-denied or not-implemented. Everything else,
    /// including transport failures and daemon restarts, is transient.
    pub fn is_permanent(&self) -> bool {
        match self {
            EngineError::Api(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => matches!(status_code, 404 | 401 | 403 | 501),
            _ => false,
        }
    }

    /// Whether the engine reported the referenced object as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Api(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}
