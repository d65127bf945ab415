//! One provisioned container.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::{Config as ContainerSpec, NetworkingConfig};
use bollard::exec::CreateExecOptions;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::Config;
use crate::engine::client::EngineClient;
use crate::engine::codec;
use crate::engine::retry::retry;
use crate::engine::{EngineError, Result};

use super::execution::Execution;

/// Handle to one container created by this backend.
///
/// Cloning the handle is cheap; all clones refer to the same container. In
/// connection mode one container is shared by every channel of the
/// connection, in session mode each channel owns its own.
#[derive(Clone)]
pub struct Container {
    client: EngineClient,
    config: Arc<Config>,
    id: String,
    tty: bool,
}

impl Container {
    /// Create a container from the configured launch spec.
    ///
    /// The effective spec is a copy of the configured container spec with
    /// the handler `labels` merged in, `env` appended as `K=V` pairs and the
    /// command set to the idle command. When `tty` is given (session mode)
    /// the std streams are attached, stdin is opened for a single consumer
    /// and `cmd` overrides the command instead.
    pub(crate) async fn create(
        client: &EngineClient,
        labels: &HashMap<String, String>,
        env: &HashMap<String, String>,
        tty: Option<bool>,
        cmd: Option<Vec<String>>,
        deadline: Instant,
    ) -> Result<Container> {
        let config = client.config().clone();
        debug!("Creating container...");
        let spec = build_container_spec(&config, labels, env, tty, cmd);
        let launch = &config.execution.launch;
        let name = match launch.containername.as_str() {
            "" => None,
            name => Some(name),
        };

        let id = retry(
            "create container",
            deadline,
            client.metrics(),
            || client.create_container(spec.clone(), name, launch.platform.as_deref()),
        )
        .await
        .inspect_err(|err| error!("failed to create container, giving up ({})", err))?;

        Ok(Container {
            client: client.clone(),
            tty: tty.unwrap_or(spec.tty.unwrap_or(false)),
            config,
            id,
        })
    }

    /// The engine-assigned container ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn client(&self) -> &EngineClient {
        &self.client
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Start the container.
    pub(crate) async fn start(&self, deadline: Instant) -> Result<()> {
        debug!("Starting container...");
        retry("start container", deadline, self.client.metrics(), || {
            self.client.start_container(&self.id)
        })
        .await
        .inspect_err(|err| error!("failed to start container, giving up ({})", err))
    }

    /// Attach to the container's main process.
    ///
    /// This is the launch path of session mode: the program is the container
    /// init, so the resulting execution carries PID 1 and no exec ID.
    pub(crate) async fn attach(&self, deadline: Instant) -> Result<Execution> {
        debug!("Attaching to container...");
        let io = retry("attach to container", deadline, self.client.metrics(), || {
            self.client.attach_container(&self.id)
        })
        .await
        .inspect_err(|err| error!("failed to attach to container, giving up ({})", err))?;

        Ok(Execution::new(self.clone(), None, self.tty, 1, io))
    }

    /// Create an exec running `program` inside the container.
    ///
    /// With guest agent support the program is wrapped in
    /// `agent console --pid --`, which makes the agent announce the child
    /// PID on stdout before replacing itself with the program; the PID is
    /// consumed here and used later for signal delivery.
    pub(crate) async fn create_exec(
        &self,
        program: Vec<String>,
        env: &HashMap<String, String>,
        tty: bool,
        deadline: Instant,
    ) -> Result<Execution> {
        debug!("Creating exec...");
        let agent_enabled = !self.config.execution.disable_agent;
        let options = self.build_exec_options(program, env, tty);

        let exec_id = retry("create exec", deadline, self.client.metrics(), || {
            self.client.create_exec(&self.id, options.clone())
        })
        .await
        .inspect_err(|err| error!("failed to create exec, giving up ({})", err))?;

        debug!("Attaching exec...");
        let mut io = retry("attach to exec", deadline, self.client.metrics(), || {
            self.client.attach_exec(&exec_id, tty)
        })
        .await
        .inspect_err(|err| error!("failed to attach to exec, giving up ({})", err))?;

        let mut pid = 0;
        if agent_enabled {
            let (read_pid, leftover) =
                tokio::time::timeout_at(deadline, codec::read_pid(&mut io.output, tty))
                    .await
                    .map_err(|_| EngineError::Timeout)?
                    .inspect_err(|err| {
                        error!("failed to read process ID from the guest agent ({})", err)
                    })?;
            pid = read_pid;
            io.leftover = leftover;
        }

        Ok(Execution::new(self.clone(), Some(exec_id), tty, pid, io))
    }

    fn build_exec_options(
        &self,
        program: Vec<String>,
        env: &HashMap<String, String>,
        tty: bool,
    ) -> CreateExecOptions<String> {
        let cmd = if self.config.execution.disable_agent {
            program
        } else {
            let mut cmd = vec![
                self.config.execution.agent_path.clone(),
                "console".to_string(),
                "--pid".to_string(),
                "--".to_string(),
            ];
            cmd.extend(program);
            cmd
        };
        CreateExecOptions {
            tty: Some(tty),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            env: Some(env_to_pairs(env)),
            cmd: Some(cmd),
            ..Default::default()
        }
    }

    /// Deliver `signal` to the container's init process.
    pub(crate) async fn kill(&self, signal: &str, deadline: Instant) -> Result<()> {
        debug!("Sending signal {} to container...", signal);
        retry("send signal to container", deadline, self.client.metrics(), || {
            self.client.kill_container(&self.id, signal)
        })
        .await
        .inspect_err(|err| {
            error!(
                "cannot send {} signal to container {} ({})",
                signal, self.id, err
            )
        })
    }

    /// Remove the container. A container the engine no longer knows about
    /// counts as removed.
    pub(crate) async fn remove(&self, deadline: Instant) -> Result<()> {
        debug!("Removing container...");
        retry("remove container", deadline, self.client.metrics(), || async {
            match self.client.inspect_container(&self.id).await {
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
                Ok(_) => {}
            }
            match self.client.remove_container(&self.id, true).await {
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            }
        })
        .await
        .inspect_err(|err| error!("failed to remove container, giving up ({})", err))
    }
}

#[cfg(test)]
impl Container {
    pub(crate) fn for_tests(client: EngineClient, id: &str, tty: bool) -> Container {
        let config = client.config().clone();
        Container {
            client,
            config,
            id: id.to_string(),
            tty,
        }
    }
}

/// Derive the effective container spec for creation: a copy of the
/// configured spec with the handler labels, environment and command merged
/// in.
fn build_container_spec(
    config: &Config,
    labels: &HashMap<String, String>,
    env: &HashMap<String, String>,
    tty: Option<bool>,
    cmd: Option<Vec<String>>,
) -> ContainerSpec<String> {
    let launch = &config.execution.launch;
    let base = launch.container.clone().unwrap_or_default();
    let mut spec = ContainerSpec::<String> {
        hostname: base.hostname,
        domainname: base.domainname,
        user: base.user,
        attach_stdin: base.attach_stdin,
        attach_stdout: base.attach_stdout,
        attach_stderr: base.attach_stderr,
        exposed_ports: base.exposed_ports,
        tty: base.tty,
        open_stdin: base.open_stdin,
        stdin_once: base.stdin_once,
        env: base.env,
        cmd: base.cmd,
        healthcheck: base.healthcheck,
        image: base.image,
        volumes: base.volumes,
        working_dir: base.working_dir,
        entrypoint: base.entrypoint,
        network_disabled: base.network_disabled,
        labels: base.labels,
        stop_signal: base.stop_signal,
        stop_timeout: base.stop_timeout,
        shell: base.shell,
        host_config: launch.host.clone(),
        networking_config: launch.network.clone().map(|network| NetworkingConfig {
            endpoints_config: network.endpoints_config,
        }),
        ..Default::default()
    };

    let mut merged_labels = spec.labels.take().unwrap_or_default();
    merged_labels.extend(labels.clone());
    spec.labels = Some(merged_labels);

    spec.cmd = Some(config.execution.idle_command.clone());

    let mut merged_env = spec.env.take().unwrap_or_default();
    merged_env.extend(env_to_pairs(env));
    spec.env = Some(merged_env);

    if let Some(tty) = tty {
        spec.tty = Some(tty);
        spec.attach_stdin = Some(true);
        spec.attach_stdout = Some(true);
        spec.attach_stderr = Some(true);
        spec.open_stdin = Some(true);
        spec.stdin_once = Some(true);
        spec.cmd = cmd;
    }

    spec
}

fn env_to_pairs(env: &HashMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_spec_for_connection_mode_runs_idle_command() {
        let config = Config::default();
        let spec = build_container_spec(
            &config,
            &labels(&[("containerssh_username", "test")]),
            &HashMap::new(),
            None,
            None,
        );
        assert_eq!(spec.cmd, Some(config.execution.idle_command.clone()));
        assert_eq!(
            spec.labels.unwrap().get("containerssh_username"),
            Some(&"test".to_string())
        );
        assert!(spec.tty.is_none());
    }

    #[test]
    fn test_spec_for_session_mode_overrides_command() {
        let config = Config::default();
        let spec = build_container_spec(
            &config,
            &HashMap::new(),
            &labels(&[("FOO", "bar")]),
            Some(true),
            Some(vec!["/bin/sh".to_string()]),
        );
        assert_eq!(spec.cmd, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(spec.tty, Some(true));
        assert_eq!(spec.open_stdin, Some(true));
        assert_eq!(spec.stdin_once, Some(true));
        assert!(spec.env.unwrap().contains(&"FOO=bar".to_string()));
    }

    #[test]
    fn test_spec_preserves_configured_labels_and_env() {
        let mut config = Config::default();
        let container = config.execution.launch.container.as_mut().unwrap();
        container.labels = Some(labels(&[("team", "ops")]));
        container.env = Some(vec!["BASE=1".to_string()]);

        let spec = build_container_spec(
            &config,
            &labels(&[("containerssh_ip", "127.0.0.1")]),
            &labels(&[("EXTRA", "2")]),
            None,
            None,
        );
        let spec_labels = spec.labels.unwrap();
        assert_eq!(spec_labels.get("team"), Some(&"ops".to_string()));
        assert_eq!(
            spec_labels.get("containerssh_ip"),
            Some(&"127.0.0.1".to_string())
        );
        let env = spec.env.unwrap();
        assert!(env.contains(&"BASE=1".to_string()));
        assert!(env.contains(&"EXTRA=2".to_string()));
    }
}
