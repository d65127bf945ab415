//! Per-session-channel handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ExecutionMode;
use crate::sshserver::{SessionChannel, SessionChannelHandler, SessionControl, SessionStreams};

use super::container::Container;
use super::execution::{Execution, ExitHandler};
use super::network::NetworkHandler;
use super::ChannelError;

/// Handler for one session channel.
///
/// Collects `env` and `pty` state until the client requests a program, then
/// launches it according to the execution mode and routes signals and window
/// changes to it. A channel runs at most one program.
pub struct ChannelHandler {
    network: NetworkHandler,
    channel_id: u64,
    env: HashMap<String, String>,
    pty: bool,
    columns: u32,
    rows: u32,
    execution: Option<Execution>,
    /// Container owned by this channel (session mode only).
    session_container: Option<Container>,
    streams: Option<SessionStreams>,
    control: Arc<dyn SessionControl>,
    exit_sent: Arc<AtomicBool>,
}

impl ChannelHandler {
    pub(crate) fn new(network: NetworkHandler, channel_id: u64, channel: SessionChannel) -> Self {
        Self {
            network,
            channel_id,
            env: HashMap::new(),
            pty: false,
            columns: 0,
            rows: 0,
            execution: None,
            session_container: None,
            streams: Some(channel.streams),
            control: channel.control,
            exit_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Split a requested command line into an argument vector.
    ///
    /// Only explicit paths are executed directly; everything else runs
    /// through the shell so that variable expansion and builtins behave the
    /// way SSH users expect.
    fn parse_program(program: &str) -> Vec<String> {
        match shlex::split(program) {
            Some(parts)
                if parts.first().is_some_and(|first| {
                    first.starts_with('/')
                        || first.starts_with("./")
                        || first.starts_with("../")
                }) =>
            {
                parts
            }
            _ => vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                program.to_string(),
            ],
        }
    }

    async fn launch(&mut self, program: Vec<String>, deadline: Instant) -> Result<(), ChannelError> {
        let state = self.network.state().await;
        if self.execution.is_some() {
            return Err(ChannelError::ProgramAlreadyRunning);
        }
        if state.disconnected {
            return Err(ChannelError::ShuttingDown);
        }

        debug!(channel = self.channel_id, "Launching program {:?}", program);
        let execution = match self.network.config().execution.mode {
            ExecutionMode::Connection => {
                let container = state
                    .container
                    .clone()
                    .ok_or(ChannelError::NotConnected)?;
                let execution = container
                    .create_exec(program, &self.env, self.pty, deadline)
                    .await?;
                if self.pty {
                    if let Err(err) = execution.resize(self.rows, self.columns, deadline).await {
                        debug!("failed to set initial window size ({})", err);
                    }
                }
                execution
            }
            ExecutionMode::Session => {
                let engine = state.engine.clone().ok_or(ChannelError::NotConnected)?;
                let container = Container::create(
                    &engine,
                    &state.labels,
                    &self.env,
                    Some(self.pty),
                    Some(program),
                    deadline,
                )
                .await?;

                let started: Result<Execution, ChannelError> = async {
                    let execution = container.attach(deadline).await?;
                    container.start(deadline).await?;
                    if self.pty {
                        execution.resize(self.rows, self.columns, deadline).await?;
                    }
                    Ok(execution)
                }
                .await;

                match started {
                    Ok(execution) => {
                        self.session_container = Some(container);
                        execution
                    }
                    Err(err) => {
                        let remove_deadline = Instant::now()
                            + self.network.config().timeouts.container_stop;
                        let _ = container.remove(remove_deadline).await;
                        return Err(err);
                    }
                }
            }
        };

        let streams = self
            .streams
            .take()
            .ok_or(ChannelError::ProgramAlreadyRunning)?;
        execution
            .run(
                streams.stdout,
                streams.stderr,
                streams.stdin,
                Arc::new(SessionExit {
                    control: self.control.clone(),
                    exit_sent: self.exit_sent.clone(),
                }),
            )
            .await?;
        self.execution = Some(execution);
        Ok(())
    }
}

#[async_trait]
impl SessionChannelHandler for ChannelHandler {
    async fn on_env_request(
        &mut self,
        _request_id: u64,
        name: &str,
        value: &str,
    ) -> Result<(), ChannelError> {
        let _state = self.network.state().await;
        if self.execution.is_some() {
            return Err(ChannelError::ProgramAlreadyRunning);
        }
        self.env.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn on_pty_request(
        &mut self,
        _request_id: u64,
        term: &str,
        columns: u32,
        rows: u32,
        _width_px: u32,
        _height_px: u32,
        _modes: &[u8],
    ) -> Result<(), ChannelError> {
        let _state = self.network.state().await;
        if self.execution.is_some() {
            return Err(ChannelError::ProgramAlreadyRunning);
        }
        self.env.insert("TERM".to_string(), term.to_string());
        self.columns = columns;
        self.rows = rows;
        self.pty = true;
        Ok(())
    }

    async fn on_exec_request(
        &mut self,
        _request_id: u64,
        program: &str,
    ) -> Result<(), ChannelError> {
        if self.network.config().execution.disable_command {
            return Err(ChannelError::ExecutionDisabled);
        }
        let deadline = Instant::now() + self.network.config().timeouts.command_start;
        self.launch(Self::parse_program(program), deadline).await
    }

    async fn on_shell(&mut self, _request_id: u64) -> Result<(), ChannelError> {
        let deadline = Instant::now() + self.network.config().timeouts.command_start;
        let shell = self.network.config().execution.shell_command.clone();
        self.launch(shell, deadline).await
    }

    async fn on_subsystem(
        &mut self,
        _request_id: u64,
        subsystem: &str,
    ) -> Result<(), ChannelError> {
        let deadline = Instant::now() + self.network.config().timeouts.command_start;
        let binary = self
            .network
            .config()
            .execution
            .subsystems
            .get(subsystem)
            .cloned()
            .ok_or_else(|| ChannelError::SubsystemNotSupported(subsystem.to_string()))?;
        self.launch(vec![binary], deadline).await
    }

    async fn on_signal(&mut self, _request_id: u64, signal: &str) -> Result<(), ChannelError> {
        let _state = self.network.state().await;
        let execution = self
            .execution
            .as_ref()
            .ok_or(ChannelError::ProgramNotRunning)?;
        let deadline = Instant::now() + self.network.config().timeouts.signal;
        execution.signal(signal, deadline).await
    }

    async fn on_window(
        &mut self,
        _request_id: u64,
        columns: u32,
        rows: u32,
        _width_px: u32,
        _height_px: u32,
    ) -> Result<(), ChannelError> {
        let _state = self.network.state().await;
        let execution = self
            .execution
            .as_ref()
            .ok_or(ChannelError::ProgramNotRunning)?;
        let deadline = Instant::now() + self.network.config().timeouts.window;
        Ok(execution.resize(rows, columns, deadline).await?)
    }

    async fn on_close(&mut self) {
        if let Some(execution) = &self.execution {
            execution.kill().await;
        }
        if let Some(container) = self.session_container.take() {
            let deadline = Instant::now() + self.network.config().timeouts.container_stop;
            let _ = container.remove(deadline).await;
        }
    }

    async fn on_shutdown(&mut self, deadline: Instant) {
        if let Some(execution) = &self.execution {
            execution.term(deadline).await;
        }
    }
}

/// Writes the exit status into the SSH session and closes the channel.
struct SessionExit {
    control: Arc<dyn SessionControl>,
    exit_sent: Arc<AtomicBool>,
}

#[async_trait]
impl ExitHandler for SessionExit {
    async fn on_exit(&self, exit_status: u32) {
        if self.exit_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.control.exit_status(exit_status).await;
    }

    async fn close_write(&self) {
        self.control.close_write().await;
        if let Err(err) = self.control.close().await {
            debug!("failed to close session ({})", err);
        }
    }
}
