//! A running program: either an exec inside the connection container or the
//! main process of a session container.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::engine::client::AttachedIo;
use crate::engine::codec;
use crate::engine::retry::retry;
use crate::engine::{self, EngineError};

use super::container::Container;
use super::ChannelError;

/// How long the backend keeps polling the engine for an exit code after the
/// output stream ended.
const EXIT_CODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives the program's exit and the subsequent output shutdown.
#[async_trait]
pub trait ExitHandler: Send + Sync {
    /// The program exited with `exit_status`. Called at most once.
    async fn on_exit(&self, exit_status: u32);

    /// Called after `on_exit`: no more output will be produced.
    async fn close_write(&self) {}
}

struct Inner {
    container: Container,
    exec_id: Option<String>,
    tty: bool,
    /// `0` means the PID is unknown (guest agent disabled), `1` the
    /// container init process, larger values a real in-container PID
    /// announced by the guest agent. Negative once the program has exited.
    pid: AtomicI64,
    io: Mutex<Option<AttachedIo>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    done: watch::Sender<bool>,
}

/// Handle to a running program.
///
/// Cloning is cheap; all clones drive the same program. The attach stream is
/// owned exclusively by this execution: killing it closes both endpoints.
#[derive(Clone)]
pub struct Execution {
    inner: Arc<Inner>,
}

impl Execution {
    pub(crate) fn new(
        container: Container,
        exec_id: Option<String>,
        tty: bool,
        pid: i64,
        io: AttachedIo,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                container,
                exec_id,
                tty,
                pid: AtomicI64::new(pid),
                io: Mutex::new(Some(io)),
                pumps: Mutex::new(Vec::new()),
                done: watch::Sender::new(false),
            }),
        }
    }

    /// The current PID of the program: `0` unknown, `1` container init,
    /// `>1` a real in-container PID, negative once the program exited.
    pub fn pid(&self) -> i64 {
        self.inner.pid.load(Ordering::SeqCst)
    }

    /// Start the I/O pumps.
    ///
    /// Program output is demultiplexed into `stdout`/`stderr`; `stdin` is
    /// copied to the program until EOF. When the output stream ends the exit
    /// code is harvested from the engine and delivered through `handler`.
    pub(crate) async fn run(
        &self,
        stdout: Box<dyn AsyncWrite + Send + Unpin>,
        stderr: Box<dyn AsyncWrite + Send + Unpin>,
        stdin: Box<dyn AsyncRead + Send + Unpin>,
        handler: Arc<dyn ExitHandler>,
    ) -> Result<(), ChannelError> {
        let io = self
            .inner
            .io
            .lock()
            .await
            .take()
            .ok_or(ChannelError::ProgramAlreadyRunning)?;
        let AttachedIo {
            output,
            mut input,
            leftover,
        } = io;

        let tty = self.inner.tty;
        let inner = self.inner.clone();
        let output_pump = tokio::spawn(async move {
            codec::pump_output(output, leftover, stdout, stderr, tty).await;
            finish(&inner, handler).await;
        });
        let input_pump = tokio::spawn(async move {
            let mut stdin = stdin;
            if let Err(err) = tokio::io::copy(&mut stdin, &mut input).await {
                warn!("failed to stream input ({})", err);
            }
        });
        self.inner
            .pumps
            .lock()
            .await
            .extend([output_pump, input_pump]);
        Ok(())
    }

    /// Resize the program's terminal.
    pub async fn resize(&self, rows: u32, columns: u32, deadline: Instant) -> engine::Result<()> {
        debug!("Resizing window...");
        let client = self.inner.container.client();
        let height = rows.min(u32::from(u16::MAX)) as u16;
        let width = columns.min(u32::from(u16::MAX)) as u16;
        let result = if let Some(exec_id) = &self.inner.exec_id {
            retry("resize window", deadline, client.metrics(), || {
                client.resize_exec(exec_id, height, width)
            })
            .await
        } else {
            retry("resize window", deadline, client.metrics(), || {
                client.resize_container(self.inner.container.id(), height, width)
            })
            .await
        };
        // Resizes fail for legitimate reasons, e.g. the program already
        // exited, so the failure log stays at debug level.
        result.inspect_err(|err| debug!("failed to resize window ({})", err))
    }

    /// Deliver a signal to the program.
    ///
    /// PID 1 is signalled through the engine's container kill; any other
    /// positive PID is signalled out-of-band through a guest agent exec.
    pub async fn signal(&self, signal: &str, deadline: Instant) -> Result<(), ChannelError> {
        let pid = self.pid();
        if pid <= 0 {
            return Err(ChannelError::SignalNoPid);
        }
        if pid == 1 {
            return Ok(self.inner.container.kill(signal, deadline).await?);
        }
        self.signal_process(pid, signal, deadline).await
    }

    async fn signal_process(
        &self,
        pid: i64,
        signal: &str,
        deadline: Instant,
    ) -> Result<(), ChannelError> {
        let container = &self.inner.container;
        if container.config().execution.disable_agent {
            return Err(ChannelError::SignalNoAgent);
        }
        debug!(
            "Using the exec facility to send signal {} to pid {}...",
            signal, pid
        );
        let program = vec![
            container.config().execution.agent_path.clone(),
            "signal".to_string(),
            "--pid".to_string(),
            pid.to_string(),
            "--signal".to_string(),
            signal.to_string(),
        ];
        let exec = container
            .create_exec(program, &HashMap::new(), false, deadline)
            .await
            .map_err(|err| {
                error!(
                    "cannot send {} signal to container {} pid {} ({})",
                    signal,
                    container.id(),
                    pid,
                    err
                );
                ChannelError::CannotSendSignal
            })?;

        let stderr = CollectWriter::default();
        let (tx, rx) = oneshot::channel();
        exec.run(
            Box::new(tokio::io::sink()),
            Box::new(stderr.clone()),
            Box::new(tokio::io::empty()),
            Arc::new(SignalExit {
                tx: std::sync::Mutex::new(Some(tx)),
            }),
        )
        .await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Err(_elapsed) => {
                exec.kill().await;
                Err(ChannelError::CannotSendSignal)
            }
            Ok(Err(_closed)) => Err(ChannelError::CannotSendSignal),
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(_)) => {
                error!(
                    "cannot send {} signal to container {} pid {} ({})",
                    signal,
                    container.id(),
                    pid,
                    String::from_utf8_lossy(&stderr.contents())
                );
                Err(ChannelError::CannotSendSignal)
            }
        }
    }

    /// Abort the I/O pumps and close the attach stream.
    pub async fn kill(&self) {
        debug!("Killing program...");
        for pump in self.inner.pumps.lock().await.drain(..) {
            pump.abort();
        }
        self.inner.io.lock().await.take();
        let _ = self.inner.done.send(true);
    }

    /// Ask the program to terminate and wait for it to exit; kill it when
    /// the deadline fires first.
    pub async fn term(&self, deadline: Instant) {
        debug!("Requesting graceful termination...");
        if let Err(err) = self.signal("TERM", deadline).await {
            debug!("failed to deliver TERM ({})", err);
        }
        if tokio::time::timeout_at(deadline, self.done()).await.is_err() {
            self.kill().await;
        }
    }

    /// Wait until the program has exited (or was killed).
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Output pump epilogue: harvest the exit code and deliver it.
async fn finish(inner: &Arc<Inner>, handler: Arc<dyn ExitHandler>) {
    inner.pid.store(-1, Ordering::SeqCst);
    debug!("Fetching exit code...");
    let deadline = Instant::now() + EXIT_CODE_TIMEOUT;
    match harvest_exit_code(inner, deadline).await {
        Ok(status) => {
            handler.on_exit(status).await;
            handler.close_write().await;
        }
        Err(err) => error!("failed to fetch program exit code, giving up ({})", err),
    }
    let _ = inner.done.send(true);
}

async fn harvest_exit_code(inner: &Arc<Inner>, deadline: Instant) -> engine::Result<u32> {
    let client = inner.container.client();
    if let Some(exec_id) = &inner.exec_id {
        retry("fetch exit code", deadline, client.metrics(), || async {
            let inspect = client.inspect_exec(exec_id).await?;
            if inspect.running == Some(true) {
                return Err(EngineError::StillRunning);
            }
            match inspect.exit_code {
                None => Err(EngineError::StillRunning),
                Some(code) if code < 0 => Err(EngineError::NegativeExitCode(code)),
                Some(code) => Ok(code as u32),
            }
        })
        .await
    } else {
        // The program is the container init: force the container into a
        // non-running state first, then read the exit code off its state.
        if stop_container(inner, deadline).await.is_err() {
            return Ok(137);
        }
        retry("fetch exit code", deadline, client.metrics(), || async {
            let inspect = client.inspect_container(inner.container.id()).await?;
            let state = inspect.state.ok_or(EngineError::StillRunning)?;
            if state.running == Some(true) {
                return Err(EngineError::StillRunning);
            }
            if state.restarting == Some(true) {
                return Err(EngineError::Restarting);
            }
            match state.exit_code {
                None => Err(EngineError::StillRunning),
                Some(code) if code < 0 => Err(EngineError::NegativeExitCode(code)),
                Some(code) => Ok(code as u32),
            }
        })
        .await
    }
}

async fn stop_container(inner: &Arc<Inner>, deadline: Instant) -> engine::Result<()> {
    let client = inner.container.client();
    let stop_secs = inner
        .container
        .config()
        .timeouts
        .container_stop
        .as_secs()
        .max(1) as i64;
    retry("stop container", deadline, client.metrics(), || async {
        let inspect = client.inspect_container(inner.container.id()).await?;
        let state = inspect.state.unwrap_or_default();
        if state.running != Some(true) && state.restarting != Some(true) {
            return Ok(());
        }
        debug!("Stopping container...");
        client
            .stop_container(inner.container.id(), stop_secs)
            .await
    })
    .await
    .inspect_err(|err| error!("failed to stop container, giving up ({})", err))
}

/// Exit handler of the signal side-channel exec.
struct SignalExit {
    tx: std::sync::Mutex<Option<oneshot::Sender<u32>>>,
}

#[async_trait]
impl ExitHandler for SignalExit {
    async fn on_exit(&self, exit_status: u32) {
        if let Ok(mut guard) = self.tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(exit_status);
            }
        }
    }
}

/// An `AsyncWrite` collecting everything into a shared buffer.
#[derive(Clone, Default)]
pub(crate) struct CollectWriter {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl CollectWriter {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl AsyncWrite for CollectWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(buf);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::client::EngineClient;
    use crate::metrics::BackendMetrics;
    use tokio::io::AsyncWriteExt;

    async fn offline_container(mutate: impl FnOnce(&mut Config)) -> Container {
        let mut config = Config::default();
        config.connection.host = "unix:///nonexistent/engine.sock".to_string();
        mutate(&mut config);
        let client = EngineClient::connect(Arc::new(config), BackendMetrics::unregistered())
            .await
            .unwrap();
        Container::for_tests(client, "testcontainer", false)
    }

    fn idle_io() -> AttachedIo {
        AttachedIo {
            output: Box::pin(futures::stream::pending()),
            input: Box::pin(tokio::io::sink()),
            leftover: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_signal_requires_a_pid() {
        let container = offline_container(|_| {}).await;
        let execution = Execution::new(container, None, false, 0, idle_io());
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            execution.signal("TERM", deadline).await,
            Err(ChannelError::SignalNoPid)
        ));
    }

    #[tokio::test]
    async fn test_signal_refused_after_exit() {
        let container = offline_container(|_| {}).await;
        let execution = Execution::new(container, None, false, -1, idle_io());
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            execution.signal("USR1", deadline).await,
            Err(ChannelError::SignalNoPid)
        ));
    }

    #[tokio::test]
    async fn test_signal_to_process_requires_agent() {
        let container = offline_container(|config| {
            config.execution.disable_agent = true;
        })
        .await;
        let execution = Execution::new(container, Some("exec".to_string()), false, 42, idle_io());
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            execution.signal("USR1", deadline).await,
            Err(ChannelError::SignalNoAgent)
        ));
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let container = offline_container(|_| {}).await;
        let execution = Execution::new(container, Some("exec".to_string()), false, 0, idle_io());
        let handler = Arc::new(SignalExit {
            tx: std::sync::Mutex::new(None),
        });
        execution
            .run(
                Box::new(tokio::io::sink()),
                Box::new(tokio::io::sink()),
                Box::new(tokio::io::empty()),
                handler.clone(),
            )
            .await
            .unwrap();
        let result = execution
            .run(
                Box::new(tokio::io::sink()),
                Box::new(tokio::io::sink()),
                Box::new(tokio::io::empty()),
                handler,
            )
            .await;
        assert!(matches!(result, Err(ChannelError::ProgramAlreadyRunning)));
        execution.kill().await;
    }

    #[tokio::test]
    async fn test_kill_resolves_done() {
        let container = offline_container(|_| {}).await;
        let execution = Execution::new(container, None, false, 1, idle_io());
        execution.kill().await;
        tokio::time::timeout(Duration::from_secs(1), execution.done())
            .await
            .unwrap();
        assert_eq!(execution.pid(), 1);
    }

    #[tokio::test]
    async fn test_collect_writer_accumulates() {
        let mut writer = CollectWriter::default();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        assert_eq!(writer.contents(), b"hello world");
    }
}
