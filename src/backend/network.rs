//! Per-connection handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::config::{Config, ExecutionMode};
use crate::engine::client::EngineClient;
use crate::engine::EngineError;
use crate::metrics::BackendMetrics;
use crate::sshserver::{
    AuthResult, NetworkConnectionHandler, SessionChannel, SessionChannelHandler,
    SshConnectionHandler,
};

use super::channel::ChannelHandler;
use super::container::Container;
use super::{image, ChannelError};

pub(crate) const LABEL_CONNECTION_ID: &str = "containerssh_connection_id";
pub(crate) const LABEL_IP: &str = "containerssh_ip";
pub(crate) const LABEL_USERNAME: &str = "containerssh_username";

pub(crate) struct NetworkState {
    pub(crate) username: Option<String>,
    pub(crate) engine: Option<EngineClient>,
    pub(crate) container: Option<Container>,
    pub(crate) labels: HashMap<String, String>,
    pub(crate) disconnected: bool,
}

struct Inner {
    client_addr: SocketAddr,
    connection_id: String,
    config: Arc<Config>,
    metrics: BackendMetrics,
    state: Mutex<NetworkState>,
    done: watch::Sender<bool>,
}

/// Handler for one SSH network connection.
///
/// This backend never authenticates: the auth callbacks report themselves
/// unavailable and an upstream handler decides. After a successful handshake
/// the handler connects to the engine, applies the image pull policy and, in
/// connection mode, provisions the connection's container.
#[derive(Clone)]
pub struct NetworkHandler {
    inner: Arc<Inner>,
}

impl NetworkHandler {
    pub(crate) fn new(
        client_addr: SocketAddr,
        connection_id: String,
        config: Config,
        metrics: BackendMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client_addr,
                connection_id,
                config: Arc::new(config),
                metrics,
                state: Mutex::new(NetworkState {
                    username: None,
                    engine: None,
                    container: None,
                    labels: HashMap::new(),
                    disconnected: false,
                }),
                done: watch::Sender::new(false),
            }),
        }
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub(crate) async fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.state.lock().await
    }

    /// Wait until the connection has been torn down.
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

    /// Construct the engine client on first use.
    async fn setup_engine(&self, state: &mut NetworkState) -> Result<EngineClient, EngineError> {
        if let Some(engine) = &state.engine {
            return Ok(engine.clone());
        }
        let engine =
            EngineClient::connect(self.inner.config.clone(), self.inner.metrics.clone()).await?;
        state.engine = Some(engine.clone());
        Ok(engine)
    }

    fn build_labels(&self, username: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(
            LABEL_CONNECTION_ID.to_string(),
            self.inner.connection_id.clone(),
        );
        labels.insert(LABEL_IP.to_string(), self.inner.client_addr.ip().to_string());
        labels.insert(LABEL_USERNAME.to_string(), username.to_string());
        labels
    }
}

#[async_trait]
impl NetworkConnectionHandler for NetworkHandler {
    async fn on_auth_password(&self, _username: &str, _password: &[u8]) -> AuthResult {
        AuthResult::Unavailable {
            reason: "backend does not authenticate".to_string(),
        }
    }

    async fn on_auth_pubkey(&self, _username: &str, _public_key: &str) -> AuthResult {
        AuthResult::Unavailable {
            reason: "backend does not authenticate".to_string(),
        }
    }

    async fn on_handshake_success(
        &self,
        username: &str,
    ) -> Result<Box<dyn SshConnectionHandler>, EngineError> {
        let mut state = self.state().await;
        let deadline = Instant::now() + self.inner.config.timeouts.container_start;
        state.username = Some(username.to_string());

        let engine = self.setup_engine(&mut state).await?;
        image::ensure_image(&engine, deadline).await?;

        let labels = self.build_labels(username);
        state.labels = labels.clone();

        if self.inner.config.execution.mode == ExecutionMode::Connection {
            let container = Container::create(
                &engine,
                &labels,
                &HashMap::new(),
                None,
                None,
                deadline,
            )
            .await?;
            state.container = Some(container.clone());
            container.start(deadline).await?;
        }

        Ok(Box::new(ConnectionHandler {
            network: self.clone(),
        }))
    }

    async fn on_disconnect(&self) {
        let deadline = Instant::now() + self.inner.config.timeouts.container_stop;
        let mut state = self.state().await;
        state.disconnected = true;
        if let Some(container) = state.container.take() {
            let _ = container.remove(deadline).await;
        }
        let _ = self.inner.done.send(true);
    }
}

/// Handler for the authenticated connection: hands out channel handlers.
struct ConnectionHandler {
    network: NetworkHandler,
}

#[async_trait]
impl SshConnectionHandler for ConnectionHandler {
    async fn on_session_channel(
        &self,
        channel_id: u64,
        _extra_data: &[u8],
        channel: SessionChannel,
    ) -> Result<Box<dyn SessionChannelHandler>, ChannelError> {
        Ok(Box::new(ChannelHandler::new(
            self.network.clone(),
            channel_id,
            channel,
        )))
    }
}
