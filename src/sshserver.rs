//! The SSH server collaborator surface.
//!
//! The backend does not speak the SSH wire protocol itself. An SSH server
//! embedding this crate drives the handlers defined here: one
//! [`NetworkConnectionHandler`] per TCP connection, one
//! [`SshConnectionHandler`] per completed handshake and one
//! [`SessionChannelHandler`] per session channel. The server also hands over
//! the channel's byte streams and control surface via [`SessionChannel`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::backend::ChannelError;
use crate::engine::EngineError;

/// Outcome of an authentication callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// The credentials were accepted.
    Success,
    /// The credentials were rejected.
    Failure,
    /// This handler cannot authenticate; the server should consult another
    /// authentication backend.
    Unavailable {
        /// Human-readable reason for the server log.
        reason: String,
    },
}

/// Byte streams of a session channel.
///
/// Reading `stdin` yields data sent by the SSH client; writes to `stdout` and
/// `stderr` are framed back to the client by the server.
pub struct SessionStreams {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Control surface of a session channel.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Send an `exit-status` message to the client.
    async fn exit_status(&self, status: u32);

    /// Close the write side of the channel (EOF towards the client).
    async fn close_write(&self);

    /// Close the channel.
    async fn close(&self) -> std::io::Result<()>;
}

/// A session channel as handed over by the SSH server.
pub struct SessionChannel {
    pub streams: SessionStreams,
    pub control: Arc<dyn SessionControl>,
}

/// Handler for one SSH network connection.
#[async_trait]
pub trait NetworkConnectionHandler: Send + Sync {
    /// Password authentication attempt.
    async fn on_auth_password(&self, username: &str, password: &[u8]) -> AuthResult;

    /// Public key authentication attempt. The key is in OpenSSH
    /// `authorized_keys` format.
    async fn on_auth_pubkey(&self, username: &str, public_key: &str) -> AuthResult;

    /// The handshake failed before authentication completed.
    async fn on_handshake_failed(&self, _reason: &str) {}

    /// The handshake completed with an authenticated user. Returns the
    /// handler for the authenticated connection.
    async fn on_handshake_success(
        &self,
        username: &str,
    ) -> Result<Box<dyn SshConnectionHandler>, EngineError>;

    /// The network connection was torn down.
    async fn on_disconnect(&self);
}

/// Handler for an authenticated SSH connection.
#[async_trait]
pub trait SshConnectionHandler: Send + Sync {
    /// A new session channel was opened by the client.
    async fn on_session_channel(
        &self,
        channel_id: u64,
        extra_data: &[u8],
        channel: SessionChannel,
    ) -> Result<Box<dyn SessionChannelHandler>, ChannelError>;
}

/// Handler for one session channel.
///
/// The server serialises callbacks per channel; `env`/`pty` requests arrive
/// before a program request, `signal`/`window-change` after.
#[async_trait]
pub trait SessionChannelHandler: Send {
    /// The client requested an environment variable.
    async fn on_env_request(
        &mut self,
        request_id: u64,
        name: &str,
        value: &str,
    ) -> Result<(), ChannelError>;

    /// The client requested a pseudo-terminal.
    #[allow(clippy::too_many_arguments)]
    async fn on_pty_request(
        &mut self,
        request_id: u64,
        term: &str,
        columns: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
        modes: &[u8],
    ) -> Result<(), ChannelError>;

    /// The client requested program execution.
    async fn on_exec_request(&mut self, request_id: u64, program: &str)
        -> Result<(), ChannelError>;

    /// The client requested an interactive shell.
    async fn on_shell(&mut self, request_id: u64) -> Result<(), ChannelError>;

    /// The client requested a named subsystem (e.g. `sftp`).
    async fn on_subsystem(&mut self, request_id: u64, subsystem: &str)
        -> Result<(), ChannelError>;

    /// The client sent a signal. The name comes without the `SIG` prefix.
    async fn on_signal(&mut self, request_id: u64, signal: &str) -> Result<(), ChannelError>;

    /// The client resized its terminal window.
    async fn on_window(
        &mut self,
        request_id: u64,
        columns: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
    ) -> Result<(), ChannelError>;

    /// The channel was closed.
    async fn on_close(&mut self);

    /// The server is shutting down; the handler should terminate the program
    /// gracefully, by force once `deadline` passes.
    async fn on_shutdown(&mut self, deadline: Instant);
}
