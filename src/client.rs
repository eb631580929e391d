use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::{ClientOptions, Config, HostEndpoint};
use crate::domains::message::{Envelope, Request, Response};
use crate::domains::paths;
use crate::error::{Result, StationLinkError};
use crate::interfaces::receivers::Receiver;
use crate::interfaces::security::MessageValidator;
use crate::interfaces::storage::DeliveryStore;
use crate::interfaces::transport::Transport;
use crate::providers::file_store::FileDeliveryStore;
use crate::providers::security::PlaceholderValidator;
use crate::receivers::client_default::DefaultClientReceiver;
use crate::services::codec::FrameCodec;
use crate::services::connection::{Connection, ConnectionEvents, ConnectionSettings};
use crate::services::keepalive::KeepaliveSnapshot;
use crate::services::transport::LocalTransport;

pub struct ClientBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn DeliveryStore>>,
    validator: Option<Arc<dyn MessageValidator>>,
    receivers: Vec<Arc<dyn Receiver>>,
}

impl ClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn receiver(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.receivers.push(receiver);
        self
    }

    pub fn build(self) -> Result<ClientConnection> {
        let options = self.options;
        options.validate()?;
        let codec = FrameCodec::new(options.messaging.max_frame_bytes)?;
        let validator = match self.validator {
            Some(validator) => validator,
            None => Arc::new(PlaceholderValidator::new(
                options.messaging.load_secure_token()?,
            )),
        };
        let store = self.store.unwrap_or_else(|| {
            Arc::new(FileDeliveryStore::new(options.messaging.storage_root.clone()))
        });
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalTransport));

        let settings = ConnectionSettings {
            codec,
            messaging: options.messaging.clone(),
            reconnect_on_timeout: options.reconnect_on_timeout,
            validator,
            store,
        };
        let state = Arc::new_cyclic(|me: &Weak<ClientState>| {
            let events: Weak<dyn ConnectionEvents> = me.clone();
            ClientState {
                me: me.clone(),
                connection: Arc::new(Connection::new(settings, events)),
                options,
                transport,
                cursor: AtomicUsize::new(0),
                attempts: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }
        });

        let connection = &state.connection;
        connection.set_logical_id(Some(state.options.client_id.clone()));
        connection.register_receiver(Arc::new(DefaultClientReceiver::new(Arc::downgrade(
            connection,
        ))));
        for receiver in self.receivers {
            connection.register_receiver(receiver);
        }
        Ok(ClientConnection { state })
    }
}

/// Client side of a station link: dials the configured hosts in order,
/// authenticates, and reconnects after failures while keep-alive is enabled.
#[derive(Clone)]
pub struct ClientConnection {
    state: Arc<ClientState>,
}

impl ClientConnection {
    pub fn builder(options: ClientOptions) -> ClientBuilder {
        ClientBuilder {
            options,
            transport: None,
            store: None,
            validator: None,
            receivers: Vec::new(),
        }
    }

    pub fn new(options: ClientOptions) -> Result<Self> {
        Self::builder(options).build()
    }

    pub fn from_config_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::from_file(path)?;
        let client = config
            .client
            .as_ref()
            .ok_or_else(|| StationLinkError::Config("missing client section".to_string()))?;
        Self::new(ClientOptions::try_from(client)?)
    }

    pub fn client_id(&self) -> &str {
        &self.state.options.client_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.state.connection
    }

    pub fn register_receiver(&self, receiver: Arc<dyn Receiver>) {
        self.state.connection.register_receiver(receiver);
    }

    /// Connects to the first reachable host. With keep-alive disabled a
    /// failed attempt is returned; otherwise attempts continue every
    /// `reconnect_delay` until one succeeds or the client is closed.
    pub async fn connect(&self) -> Result<()> {
        let state = &self.state;
        state.closed.store(false, Ordering::SeqCst);
        loop {
            match state.establish().await {
                Ok(()) => return Ok(()),
                Err(err) if !state.options.keep_connection_alive => return Err(err),
                Err(_) => {
                    tokio::time::sleep(state.options.reconnect_delay).await;
                    if state.closed.load(Ordering::SeqCst) {
                        return Err(StationLinkError::Runtime("client was closed".to_string()));
                    }
                }
            }
        }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.state.connection.send(envelope).await
    }

    pub async fn send_and_await(&self, envelope: Envelope, timeout: Option<Duration>) -> Result<Envelope> {
        self.state.connection.send_and_await(envelope, timeout).await
    }

    pub async fn reply(&self, to: &Envelope, response: Response) -> Result<()> {
        self.state.connection.reply(to, response).await
    }

    /// Drops the stream. Unless the client was closed, keep-alive triggers a
    /// reconnect.
    pub async fn disconnect(&self) {
        self.state.connection.disconnect(true).await;
    }

    /// Disconnects without reconnecting.
    pub async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.connection.disconnect(false).await;
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        true
    }

    pub fn current_host_index(&self) -> usize {
        self.state.cursor.load(Ordering::SeqCst)
    }

    pub fn current_host(&self) -> Option<&HostEndpoint> {
        self.state.options.hosts.get(self.current_host_index())
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn keepalive_stats(&self) -> KeepaliveSnapshot {
        self.state.connection.keepalive_stats()
    }
}

struct ClientState {
    me: Weak<ClientState>,
    options: ClientOptions,
    transport: Arc<dyn Transport>,
    connection: Arc<Connection>,
    cursor: AtomicUsize,
    attempts: AtomicU64,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl ClientState {
    /// One attempt against the host under the cursor. A failure moves the
    /// cursor to the next host, wrapping around.
    async fn establish(&self) -> Result<()> {
        self.connection.disconnect(false).await;

        let hosts = &self.options.hosts;
        let index = self.cursor.load(Ordering::SeqCst) % hosts.len().max(1);
        let host = hosts
            .get(index)
            .ok_or_else(|| StationLinkError::Config("no host available to connect".to_string()))?;
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match self.transport.connect(&host.host, host.port).await {
            Ok(stream) => {
                self.connected.store(true, Ordering::SeqCst);
                self.connection.attach(stream).await;
                info!(client_id = %self.options.client_id, host = %host, "connected");
                Ok(())
            }
            Err(err) => {
                self.cursor.store((index + 1) % hosts.len(), Ordering::SeqCst);
                warn!(client_id = %self.options.client_id, host = %host, error = %err, "connection attempt failed");
                Err(err)
            }
        }
    }

    async fn reconnect(self: Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        while self.options.keep_connection_alive && !self.closed.load(Ordering::SeqCst) {
            tokio::time::sleep(self.options.reconnect_delay).await;
            if self.closed.load(Ordering::SeqCst) || self.establish().await.is_ok() {
                break;
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    async fn authenticate(&self) -> bool {
        let request = Request::new(paths::AUTHENTICATE)
            .with_authentication(&self.options.user, &self.options.password);
        match self
            .connection
            .send_and_await(Envelope::request(request), None)
            .await
        {
            Ok(reply) => {
                let response = reply.response.unwrap_or_default();
                if !response.success {
                    warn!(
                        client_id = %self.options.client_id,
                        reason = ?response.error_message,
                        "authentication rejected"
                    );
                }
                response.success
            }
            Err(err) => {
                warn!(client_id = %self.options.client_id, error = %err, "authentication failed");
                false
            }
        }
    }
}

#[async_trait]
impl ConnectionEvents for ClientState {
    async fn on_connected(&self) {
        if self.authenticate().await {
            info!(client_id = %self.options.client_id, "session established");
            self.on_session_started().await;
        }
    }

    async fn on_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) || !self.options.keep_connection_alive {
            return;
        }
        if let Some(state) = self.me.upgrade() {
            tokio::spawn(state.reconnect());
        }
    }

    async fn on_session_started(&self) {
        self.connection.reload_pending().await;
    }

    fn record_transaction(&self, event: &str, at: OffsetDateTime) {
        debug!(client_id = %self.options.client_id, event, %at, "transaction");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        true
    }
}
