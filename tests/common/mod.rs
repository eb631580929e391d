#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

use stationlink::config::{ClientOptions, HostEndpoint, ServerOptions};
use stationlink::error::{Result, StationLinkError};
use stationlink::interfaces::receivers::Receiver;
use stationlink::interfaces::security::MessageValidator;
use stationlink::interfaces::transport::{BoxedStream, Transport};
use stationlink::server::{Listener, ListenerBuilder};
use stationlink::Envelope;

/// Collects every envelope handed to it.
#[derive(Default)]
pub struct RecordingReceiver {
    seen: Mutex<Vec<(Envelope, bool)>>,
}

impl RecordingReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn received(&self) -> Vec<Envelope> {
        self.seen
            .lock()
            .await
            .iter()
            .map(|(envelope, _)| envelope.clone())
            .collect()
    }

    pub async fn with_path(&self, path: &str) -> Vec<Envelope> {
        self.received()
            .await
            .into_iter()
            .filter(|envelope| envelope.path() == Some(path))
            .collect()
    }

    pub async fn wait_for_path(&self, path: &str, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.with_path(path).await.into_iter().next() {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_id(&self, id: &str, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.received().await.into_iter().find(|e| e.id == id) {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Receiver for RecordingReceiver {
    async fn on_message_received(&self, envelope: Envelope, authenticated: bool) -> Result<()> {
        self.seen.lock().await.push((envelope, authenticated));
        Ok(())
    }
}

/// Counts deliveries and fails every one of them.
#[derive(Default)]
pub struct FailingReceiver {
    calls: AtomicUsize,
}

impl FailingReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Receiver for FailingReceiver {
    async fn on_message_received(&self, envelope: Envelope, _authenticated: bool) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StationLinkError::Runtime(format!("cannot handle {}", envelope.id)))
    }
}

/// Panics on every delivery.
pub struct PanickingReceiver;

#[async_trait]
impl Receiver for PanickingReceiver {
    async fn on_message_received(&self, envelope: Envelope, _authenticated: bool) -> Result<()> {
        panic!("receiver blew up on {}", envelope.id);
    }
}

/// Shared-secret validator that counts every integrity check. With no secret
/// it trusts nothing.
pub struct CountingValidator {
    secret: Option<String>,
    checks: AtomicUsize,
}

impl CountingValidator {
    pub fn trusting(secret: &str) -> Arc<Self> {
        Arc::new(Self {
            secret: Some(secret.to_string()),
            checks: AtomicUsize::new(0),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            secret: None,
            checks: AtomicUsize::new(0),
        })
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl MessageValidator for CountingValidator {
    fn generate_token(&self, _source_id: Option<&str>) -> String {
        self.secret.clone().unwrap_or_default()
    }

    fn is_trusted(&self, _source_id: Option<&str>, token: Option<&str>) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.secret.is_some() && token == self.secret.as_deref()
    }
}

/// In-memory transport. Ports listed in `failing` refuse the dial, as do the
/// first `fail_first` attempts; successful dials hand the far end of a duplex
/// pipe to the test.
pub struct PipeTransport {
    failing: HashSet<u16>,
    fail_first: AtomicUsize,
    pub attempts: Mutex<Vec<(String, u16)>>,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl PipeTransport {
    pub fn new(failing: &[u16], fail_first: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            failing: failing.iter().copied().collect(),
            fail_first: AtomicUsize::new(fail_first),
            attempts: Mutex::new(Vec::new()),
            peers: tx,
        });
        (transport, rx)
    }

    pub async fn attempt_count(&self) -> usize {
        self.attempts.lock().await.len()
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        self.attempts.lock().await.push((host.to_string(), port));
        let forced = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if forced || self.failing.contains(&port) {
            return Err(StationLinkError::Transport(format!("refused {host}:{port}")));
        }
        let (local, remote) = tokio::io::duplex(1 << 20);
        let _ = self.peers.send(remote);
        Ok(Box::new(local))
    }
}

pub fn server_options(storage: &Path) -> ServerOptions {
    let mut options = ServerOptions::new(0);
    options.bind_address = "127.0.0.1".to_string();
    options.messaging.request_timeout = Duration::from_secs(5);
    options.messaging.storage_root = storage.join("server");
    options
}

pub async fn start_server(builder: ListenerBuilder) -> (Arc<Listener>, SocketAddr) {
    let listener = builder.bind().await.unwrap();
    listener.start().unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub fn client_options(client_id: &str, hosts: Vec<HostEndpoint>, storage: &Path) -> ClientOptions {
    let mut options = ClientOptions::new(client_id, hosts);
    options.reconnect_delay = Duration::from_millis(50);
    options.messaging.request_timeout = Duration::from_secs(5);
    options.messaging.storage_root = storage.join(client_id);
    options
}

pub fn endpoint(addr: SocketAddr) -> HostEndpoint {
    HostEndpoint::new(addr.ip().to_string(), addr.port())
}

/// Polls `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
