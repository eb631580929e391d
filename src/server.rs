use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, ServerOptions};
use crate::domains::message::{Envelope, Response};
use crate::error::{Result, StationLinkError};
use crate::interfaces::receivers::{Forwarder, Receiver};
use crate::interfaces::security::{Authenticator, MessageValidator};
use crate::interfaces::storage::DeliveryStore;
use crate::interfaces::transport::BoxedStream;
use crate::providers::file_store::FileDeliveryStore;
use crate::providers::security::{PlaceholderValidator, StaticCredentials};
use crate::receivers::authenticator::AuthenticatorReceiver;
use crate::services::codec::FrameCodec;
use crate::services::connection::{Connection, ConnectionEvents, ConnectionSettings};

/// Timestamps of an authenticated client's session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    pub connection_id: String,
    pub connected_at: OffsetDateTime,
    pub last_transaction_at: Option<OffsetDateTime>,
}

/// One accepted client as seen by the server.
pub struct ServerConnection {
    me: Weak<ServerConnection>,
    connection: Arc<Connection>,
    listener: Weak<Listener>,
    peer_addr: Option<SocketAddr>,
    authenticated: AtomicBool,
    session: Mutex<Option<ClientSession>>,
    properties: StdRwLock<HashMap<String, String>>,
}

impl ServerConnection {
    pub fn id(&self) -> &str {
        self.connection.id()
    }

    pub fn logical_id(&self) -> Option<String> {
        self.connection.logical_id()
    }

    pub fn set_logical_id(&self, logical_id: Option<String>) {
        self.connection.set_logical_id(logical_id);
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn session(&self) -> Option<ClientSession> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records the session and re-sends anything still pending for the
    /// client's logical id.
    pub async fn start_session(&self) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(ClientSession {
            connection_id: self.id().to_string(),
            connected_at: OffsetDateTime::now_utc(),
            last_transaction_at: None,
        });
        self.on_session_started().await;
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn register_receiver(&self, receiver: Arc<dyn Receiver>) {
        self.connection.register_receiver(receiver);
    }

    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.connection.send(envelope).await
    }

    pub async fn send_and_await(&self, envelope: Envelope, timeout: Option<Duration>) -> Result<Envelope> {
        self.connection.send_and_await(envelope, timeout).await
    }

    pub async fn reply(&self, to: &Envelope, response: Response) -> Result<()> {
        self.connection.reply(to, response).await
    }

    /// Delivers an envelope from another client without re-stamping its sender.
    pub async fn relay(&self, envelope: Envelope) -> Result<()> {
        self.connection.relay(envelope).await
    }

    pub async fn disconnect(&self, notify: bool) {
        self.connection.disconnect(notify).await;
    }
}

#[async_trait]
impl ConnectionEvents for ServerConnection {
    async fn on_connected(&self) {
        debug!(connection_id = %self.id(), peer = ?self.peer_addr, "client attached");
    }

    async fn on_disconnected(&self) {
        if let (Some(listener), Some(me)) = (self.listener.upgrade(), self.me.upgrade()) {
            listener.evict(&me).await;
        }
    }

    async fn on_session_started(&self) {
        self.connection.reload_pending().await;
    }

    fn record_transaction(&self, event: &str, at: OffsetDateTime) {
        if !self.is_authenticated() {
            return;
        }
        if let Some(session) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            session.last_transaction_at = Some(at);
        }
        debug!(connection_id = %self.id(), event, "transaction recorded");
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn is_authenticated(&self) -> bool {
        ServerConnection::is_authenticated(self)
    }
}

struct ListenerForwarder {
    listener: Weak<Listener>,
}

#[async_trait]
impl Forwarder for ListenerForwarder {
    async fn forward_message(&self, target: &str, envelope: Envelope) -> Result<bool> {
        let Some(listener) = self.listener.upgrade() else {
            return Err(StationLinkError::ForwardUnavailable(
                "listener has been dropped".to_string(),
            ));
        };
        listener.send_to_one(target, envelope).await?;
        Ok(true)
    }
}

pub struct ListenerBuilder {
    options: ServerOptions,
    store: Option<Arc<dyn DeliveryStore>>,
    validator: Option<Arc<dyn MessageValidator>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    receivers: Vec<Arc<dyn Receiver>>,
}

impl ListenerBuilder {
    pub fn store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Registered on every accepted connection after the authenticator.
    pub fn receiver(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.receivers.push(receiver);
        self
    }

    /// Validates the options without opening a socket.
    pub fn build(self) -> Result<Arc<Listener>> {
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
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(StaticCredentials::default()));

        Ok(Arc::new_cyclic(|me| Listener {
            me: me.clone(),
            options,
            codec,
            validator,
            store,
            authenticator,
            receivers: self.receivers,
            connections: RwLock::new(HashMap::new()),
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            running: AtomicBool::new(false),
        }))
    }

    /// Builds the listener and binds its socket.
    pub async fn bind(self) -> Result<Arc<Listener>> {
        let listener = self.build()?;
        listener.bind().await?;
        Ok(listener)
    }
}

/// Accepts clients, keeps the registry of live connections and relays
/// envelopes between them.
pub struct Listener {
    me: Weak<Listener>,
    options: ServerOptions,
    codec: FrameCodec,
    validator: Arc<dyn MessageValidator>,
    store: Arc<dyn DeliveryStore>,
    authenticator: Arc<dyn Authenticator>,
    receivers: Vec<Arc<dyn Receiver>>,
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
    socket: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Listener {
    pub fn builder(options: ServerOptions) -> ListenerBuilder {
        ListenerBuilder {
            options,
            store: None,
            validator: None,
            authenticator: None,
            receivers: Vec::new(),
        }
    }

    pub fn from_config_path<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let config = Config::from_file(path)?;
        let server = config
            .server
            .as_ref()
            .ok_or_else(|| StationLinkError::Config("missing server section".to_string()))?;
        Self::builder(ServerOptions::try_from(server)?).build()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Binds the configured address with `max_connections` as the backlog.
    pub async fn bind(&self) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", self.options.bind_address, self.options.port)
            .parse()
            .map_err(|e| StationLinkError::Config(format!("invalid bind address: {e}")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| StationLinkError::Transport(e.to_string()))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| StationLinkError::Transport(e.to_string()))?;
        socket
            .bind(addr)
            .map_err(|e| StationLinkError::Transport(e.to_string()))?;
        let listener = socket
            .listen(self.options.max_connections)
            .map_err(|e| StationLinkError::Transport(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StationLinkError::Transport(e.to_string()))?;

        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        info!(%local_addr, "listener bound");
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the accept loop on the bound socket.
    pub fn start(&self) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| StationLinkError::Runtime("listener is not bound".to_string()))?;
        let me = self.me.clone();
        self.running.store(true, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match socket.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let Some(listener) = me.upgrade() else {
                    break;
                };
                let _ = stream.set_nodelay(true);
                listener.accept_connection(Box::new(stream), Some(peer)).await;
            }
        });
        *self.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Registers and attaches an accepted stream. Connections that have not
    /// authenticated within the grace period are evicted.
    pub async fn accept_connection(
        &self,
        stream: BoxedStream,
        peer_addr: Option<SocketAddr>,
    ) -> Arc<ServerConnection> {
        let settings = ConnectionSettings {
            codec: self.codec,
            messaging: self.options.messaging.clone(),
            reconnect_on_timeout: false,
            validator: self.validator.clone(),
            store: self.store.clone(),
        };
        let server_connection = Arc::new_cyclic(|me: &Weak<ServerConnection>| {
            let events: Weak<dyn ConnectionEvents> = me.clone();
            ServerConnection {
                me: me.clone(),
                connection: Arc::new(Connection::new(settings, events)),
                listener: self.me.clone(),
                peer_addr,
                authenticated: AtomicBool::new(false),
                session: Mutex::new(None),
                properties: StdRwLock::new(HashMap::new()),
            }
        });

        let connection = server_connection.connection();
        connection.register_receiver(Arc::new(AuthenticatorReceiver::new(
            Arc::downgrade(&server_connection),
            self.authenticator.clone(),
        )));
        for receiver in &self.receivers {
            connection.register_receiver(receiver.clone());
        }
        connection.set_forwarder(Arc::new(ListenerForwarder {
            listener: self.me.clone(),
        }));

        self.connections
            .write()
            .await
            .insert(server_connection.id().to_string(), server_connection.clone());
        connection.attach(stream).await;
        info!(connection_id = %server_connection.id(), peer = ?peer_addr, "client accepted");

        self.schedule_grace_check(&server_connection);
        server_connection
    }

    fn schedule_grace_check(&self, connection: &Arc<ServerConnection>) {
        let grace = self.options.unauthenticated_grace;
        let listener = self.me.clone();
        let connection = Arc::downgrade(connection);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let (Some(listener), Some(connection)) = (listener.upgrade(), connection.upgrade()) else {
                return;
            };
            if !connection.is_authenticated() {
                info!(connection_id = %connection.id(), "evicting unauthenticated connection");
                listener.evict(&connection).await;
            }
        });
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn find_by_logical_id(&self, logical_id: &str) -> Option<Arc<ServerConnection>> {
        self.connections
            .read()
            .await
            .values()
            .find(|connection| connection.logical_id().as_deref() == Some(logical_id))
            .cloned()
    }

    /// Sends `envelope` to every registered connection concurrently and
    /// returns how many writes succeeded. Failures are logged, never raised.
    pub async fn send_to_all(&self, envelope: Envelope) -> usize {
        let targets: Vec<Arc<ServerConnection>> =
            self.connections.read().await.values().cloned().collect();
        let results = join_all(
            targets
                .iter()
                .map(|connection| connection.send(envelope.clone())),
        )
        .await;

        let mut delivered = 0;
        for (connection, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => warn!(connection_id = %connection.id(), error = %err, "broadcast failed"),
            }
        }
        delivered
    }

    /// Relays `envelope` to the first connection whose logical id matches.
    pub async fn send_to_one(&self, logical_id: &str, envelope: Envelope) -> Result<()> {
        if envelope.wait_response {
            return Err(StationLinkError::Unsupported(
                "envelopes waiting for a response cannot be forwarded".to_string(),
            ));
        }
        let target = self
            .find_by_logical_id(logical_id)
            .await
            .ok_or_else(|| StationLinkError::NotFound(format!("no connection for {logical_id}")))?;
        target.relay(envelope).await
    }

    /// Disconnects and unregisters one connection. Safe to call twice.
    pub async fn evict(&self, connection: &ServerConnection) {
        connection.disconnect(false).await;
        if self
            .connections
            .write()
            .await
            .remove(connection.id())
            .is_some()
        {
            info!(connection_id = %connection.id(), logical_id = ?connection.logical_id(), "connection removed");
        }
    }

    /// Evicts every connection whose property `key` equals `value`.
    pub async fn evict_by_property(&self, key: &str, value: &str) -> usize {
        let matching: Vec<Arc<ServerConnection>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|connection| connection.property(key).as_deref() == Some(value))
            .cloned()
            .collect();
        for connection in &matching {
            self.evict(connection).await;
        }
        matching.len()
    }

    /// Stops accepting and evicts every connection.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        let all: Vec<Arc<ServerConnection>> =
            self.connections.read().await.values().cloned().collect();
        for connection in &all {
            self.evict(connection).await;
        }
        info!(evicted = all.len(), "listener stopped");
    }
}
