//! End-to-end tests against a live container engine.
//!
//! These tests drive the backend through the SSH handler surface the same
//! way an SSH server would and verify the effects against the engine. They
//! are skipped if no engine is available or SKIP_CONTAINER_TESTS=1.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gangplank::config::Config;
use gangplank::metrics::BackendMetrics;
use gangplank::sshserver::{
    NetworkConnectionHandler, SessionChannel, SessionChannelHandler, SessionControl,
    SessionStreams,
};
use gangplank::NetworkHandler;
use serial_test::serial;
use test_tag::tag;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

/// Check if the engine-backed tests should run.
fn should_run_container_tests() -> bool {
    if let Ok(value) = std::env::var("SKIP_CONTAINER_TESTS") {
        if value == "1" || value.eq_ignore_ascii_case("true") {
            return false;
        }
    }

    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn test_handler(config: Config) -> (NetworkHandler, String) {
    let connection_id = uuid::Uuid::new_v4().simple().to_string();
    let handler = gangplank::new(
        "127.0.0.1:2222".parse().unwrap(),
        &connection_id,
        config,
        BackendMetrics::unregistered(),
    )
    .expect("configuration should validate");
    (handler, connection_id)
}

struct TestControl {
    exit_tx: std::sync::Mutex<Option<oneshot::Sender<u32>>>,
}

#[async_trait]
impl SessionControl for TestControl {
    async fn exit_status(&self, status: u32) {
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(status);
        }
    }

    async fn close_write(&self) {}

    async fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The test's ends of a mock session channel.
struct ChannelProbe {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit_status: oneshot::Receiver<u32>,
}

fn test_channel() -> (SessionChannel, ChannelProbe) {
    let (stdin_probe, stdin_backend) = tokio::io::duplex(64 * 1024);
    let (stdout_backend, stdout_probe) = tokio::io::duplex(64 * 1024);
    let (stderr_backend, stderr_probe) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = oneshot::channel();
    (
        SessionChannel {
            streams: SessionStreams {
                stdin: Box::new(stdin_backend),
                stdout: Box::new(stdout_backend),
                stderr: Box::new(stderr_backend),
            },
            control: Arc::new(TestControl {
                exit_tx: std::sync::Mutex::new(Some(exit_tx)),
            }),
        },
        ChannelProbe {
            stdin: stdin_probe,
            stdout: stdout_probe,
            stderr: stderr_probe,
            exit_status: exit_rx,
        },
    )
}

/// Read from `reader` until the accumulated output contains `needle`.
async fn read_until(reader: &mut DuplexStream, needle: &[u8]) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    let result = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let n = reader.read(&mut buf).await.expect("stream read failed");
            if n == 0 {
                panic!(
                    "stream closed before {:?} arrived, got {:?}",
                    String::from_utf8_lossy(needle),
                    String::from_utf8_lossy(&collected)
                );
            }
            collected.extend_from_slice(&buf[..n]);
            if collected
                .windows(needle.len())
                .any(|window| window == needle)
            {
                break;
            }
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "timed out waiting for {:?}, got {:?}",
        String::from_utf8_lossy(needle),
        String::from_utf8_lossy(&collected)
    );
    collected
}

async fn drain(mut reader: DuplexStream) -> Vec<u8> {
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(
        Duration::from_secs(1),
        reader.read_to_end(&mut collected),
    )
    .await;
    collected
}

async fn open_session(
    handler: &NetworkHandler,
    username: &str,
) -> (Box<dyn SessionChannelHandler>, ChannelProbe) {
    let connection = handler
        .on_handshake_success(username)
        .await
        .expect("handshake should succeed");
    let (channel, probe) = test_channel();
    let session = connection
        .on_session_channel(0, &[], channel)
        .await
        .expect("session channel should open");
    (session, probe)
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_connect_and_disconnect_create_and_remove_container() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (engine not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let (handler, connection_id) = test_handler(Config::default());
    let _connection = handler
        .on_handshake_success("test")
        .await
        .expect("handshake should succeed");

    // Verify through an independent engine client.
    let docker = bollard::Docker::connect_with_local_defaults().unwrap();
    let mut filters = std::collections::HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![
            "containerssh_username=test".to_string(),
            "containerssh_ip=127.0.0.1".to_string(),
            format!("containerssh_connection_id={connection_id}"),
        ],
    );
    let containers = docker
        .list_containers(Some(bollard::container::ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(containers.len(), 1, "expected exactly one labelled container");
    assert_eq!(
        containers[0].state,
        Some(bollard::models::ContainerSummaryStateEnum::RUNNING)
    );
    let container_id = containers[0].id.clone().unwrap();

    handler.on_disconnect().await;

    let inspect = docker
        .inspect_container(
            &container_id,
            None::<bollard::query_parameters::InspectContainerOptions>,
        )
        .await;
    assert!(
        matches!(
            inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        ),
        "the container should be gone after disconnect"
    );
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_single_exec_returns_output_and_status() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let (handler, _) = test_handler(Config::default());
    let (mut session, mut probe) = open_session(&handler, "test").await;

    session
        .on_exec_request(0, "echo \"Hello world!\"")
        .await
        .expect("exec should start");

    let status = probe.exit_status.await.expect("exit status should arrive");
    assert_eq!(status, 0);
    let stdout = read_until(&mut probe.stdout, b"Hello world!\n").await;
    assert_eq!(stdout, b"Hello world!\n");
    assert_eq!(drain(probe.stderr).await, b"");

    handler.on_disconnect().await;
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_env_request_reaches_the_program() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let (handler, _) = test_handler(Config::default());
    let (mut session, mut probe) = open_session(&handler, "test").await;

    session.on_env_request(0, "FOO", "bar").await.unwrap();
    session
        .on_exec_request(1, "echo \"$FOO\"")
        .await
        .expect("exec should start");

    let status = probe.exit_status.await.expect("exit status should arrive");
    assert_eq!(status, 0);
    read_until(&mut probe.stdout, b"bar\n").await;

    handler.on_disconnect().await;
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_pty_shell_with_window_resize() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let mut config = Config::default();
    config.execution.disable_agent = true;
    config.execution.shell_command = vec!["/bin/sh".to_string()];
    let (handler, _) = test_handler(config);
    let (mut session, mut probe) = open_session(&handler, "test").await;

    session.on_env_request(0, "foo", "bar").await.unwrap();
    session
        .on_pty_request(1, "xterm", 80, 25, 800, 600, &[])
        .await
        .unwrap();
    session.on_shell(2).await.expect("shell should start");

    read_until(&mut probe.stdout, b"# ").await;

    session.on_window(3, 120, 25, 800, 600).await.unwrap();
    probe.stdin.write_all(b"tput cols\n").await.unwrap();
    read_until(&mut probe.stdout, b"120\r\n").await;

    probe
        .stdin
        .write_all(b"echo \"Hello world!\"\n")
        .await
        .unwrap();
    read_until(&mut probe.stdout, b"Hello world!\r\n").await;

    probe.stdin.write_all(b"exit\n").await.unwrap();
    let status = probe.exit_status.await.expect("exit status should arrive");
    assert_eq!(status, 0);

    handler.on_disconnect().await;
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_signal_delivery_through_the_agent() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let (handler, _) = test_handler(Config::default());
    let (mut session, mut probe) = open_session(&handler, "test").await;

    session
        .on_pty_request(0, "xterm", 80, 25, 800, 600, &[])
        .await
        .unwrap();
    session
        .on_exec_request(
            1,
            "sleep infinity & PID=$!; trap \"kill $PID\" USR1; wait; echo 'USR1 received'",
        )
        .await
        .expect("exec should start");

    tokio::time::sleep(Duration::from_secs(1)).await;
    session.on_signal(2, "USR1").await.expect("signal delivery");

    let status = probe.exit_status.await.expect("exit status should arrive");
    assert_eq!(status, 0);
    read_until(&mut probe.stdout, b"USR1 received\r\n").await;

    handler.on_disconnect().await;
}

#[tokio::test]
#[serial]
#[tag(integration)]
async fn test_unreachable_engine_fails_within_the_start_timeout() {
    let mut config = Config::default();
    config.connection.host = "tcp://127.0.0.1:1".to_string();
    config.timeouts.container_start = Duration::from_secs(2);
    let (handler, _) = test_handler(config);

    let started = std::time::Instant::now();
    let result = handler.on_handshake_success("test").await;
    assert!(result.is_err(), "handshake against nothing should fail");
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "failure should be bounded by the container start timeout"
    );
}
