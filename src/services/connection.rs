//! The connection engine shared by clients and server-side connections.
//!
//! A [`Connection`] owns one attached byte stream at a time. Attaching spawns a
//! read loop and starts the keepalive monitor; the variant that owns the
//! connection observes lifecycle changes through [`ConnectionEvents`].
//!
//! Inbound envelopes are processed in this order:
//!
//! 1. probe requests are answered with the reply sentinel, probe replies
//!    resolve the outstanding probe
//! 2. in secure mode, untrusted requests get a failure reply and stop here;
//!    untrusted replies fail their pending request instead
//! 3. envelopes addressed to another identity go to the forwarder
//! 4. delivery confirmations release the durable outbox entry
//! 5. replies resolve their pending request
//! 6. everything else is handed to the registered receivers on a separate
//!    task, in registration order; a receiver that errors or panics does not
//!    keep the envelope from the ones after it
//! 7. secure-delivery envelopes are confirmed back to the sender

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use time::OffsetDateTime;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MessagingOptions;
use crate::domains::message::{Envelope, Response};
use crate::error::{Result, StationLinkError};
use crate::interfaces::receivers::{Forwarder, Receiver};
use crate::interfaces::security::MessageValidator;
use crate::interfaces::storage::DeliveryStore;
use crate::interfaces::transport::BoxedStream;
use crate::services::codec::{write_frame, FrameCodec, Inbound, PROBE_REPLY, PROBE_REQUEST};
use crate::services::keepalive::{KeepaliveMonitor, KeepaliveSnapshot, KeepaliveStats};
use crate::services::outbox::DurableOutbox;
use crate::services::pending::{PendingRequests, NO_CONNECTION_MESSAGE};

pub const UNTRUSTED_MESSAGE: &str = "The integrity of this message is not trusted.";
pub const FORWARDING_NOT_IMPLEMENTED: &str = "Forwarding message is not implemented for this client!";

/// Lifecycle hooks implemented by the owner of a [`Connection`].
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// Runs on its own task right after a stream is attached.
    async fn on_connected(&self);
    /// Runs on its own task after an unexpected disconnect.
    async fn on_disconnected(&self);
    async fn on_session_started(&self);
    fn record_transaction(&self, event: &str, at: OffsetDateTime);
    fn is_connected(&self) -> bool;
    fn is_authenticated(&self) -> bool;
}

pub struct ConnectionSettings {
    pub codec: FrameCodec,
    pub messaging: MessagingOptions,
    pub reconnect_on_timeout: bool,
    pub validator: Arc<dyn MessageValidator>,
    pub store: Arc<dyn DeliveryStore>,
}

type Writer = WriteHalf<BoxedStream>;
type Reader = ReadHalf<BoxedStream>;

pub struct Connection {
    id: String,
    logical_id: RwLock<Option<String>>,
    codec: FrameCodec,
    request_timeout: Duration,
    secure_messages: bool,
    reconnect_on_timeout: bool,
    validator: Arc<dyn MessageValidator>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    attached: AtomicBool,
    generation: AtomicU64,
    receivers: RwLock<Vec<Arc<dyn Receiver>>>,
    forwarder: RwLock<Option<Arc<dyn Forwarder>>>,
    pending: PendingRequests,
    outbox: DurableOutbox,
    keepalive: KeepaliveMonitor,
    probe_stats: Arc<KeepaliveStats>,
    outstanding_probe: Mutex<Option<String>>,
    events: Weak<dyn ConnectionEvents>,
}

impl Connection {
    pub fn new(settings: ConnectionSettings, events: Weak<dyn ConnectionEvents>) -> Self {
        let keepalive = KeepaliveMonitor::new(settings.messaging.keepalive_interval);
        let probe_stats = keepalive.stats_handle();
        Self {
            id: Uuid::new_v4().to_string(),
            logical_id: RwLock::new(None),
            codec: settings.codec,
            request_timeout: settings.messaging.request_timeout,
            secure_messages: settings.messaging.secure_messages,
            reconnect_on_timeout: settings.reconnect_on_timeout,
            validator: settings.validator,
            writer: tokio::sync::Mutex::new(None),
            reader_task: Mutex::new(None),
            attached: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            receivers: RwLock::new(Vec::new()),
            forwarder: RwLock::new(None),
            pending: PendingRequests::new(),
            outbox: DurableOutbox::new(settings.store),
            keepalive,
            probe_stats,
            outstanding_probe: Mutex::new(None),
            events,
        }
    }

    /// Internal identity, unique per connection object.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn logical_id(&self) -> Option<String> {
        self.logical_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_logical_id(&self, logical_id: Option<String>) {
        *self.logical_id.write().unwrap_or_else(PoisonError::into_inner) =
            logical_id.filter(|id| !id.is_empty());
    }

    pub fn register_receiver(&self, receiver: Arc<dyn Receiver>) {
        self.receivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(receiver);
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn set_forwarder(&self, forwarder: Arc<dyn Forwarder>) {
        *self.forwarder.write().unwrap_or_else(PoisonError::into_inner) = Some(forwarder);
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn outbox(&self) -> &DurableOutbox {
        &self.outbox
    }

    pub fn keepalive(&self) -> &KeepaliveMonitor {
        &self.keepalive
    }

    pub fn keepalive_stats(&self) -> KeepaliveSnapshot {
        self.keepalive.stats()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Attached and reported connected by the owning variant.
    pub fn is_connected(&self) -> bool {
        self.is_attached()
            && self
                .events
                .upgrade()
                .is_some_and(|events| events.is_connected())
    }

    pub fn is_authenticated(&self) -> bool {
        self.events
            .upgrade()
            .is_some_and(|events| events.is_authenticated())
    }

    /// Takes ownership of `stream`, starts the read loop and the keepalive
    /// monitor, then fires `on_connected`.
    pub async fn attach(self: &Arc<Self>, stream: BoxedStream) {
        let (reader, writer) = tokio::io::split(stream);
        let generation = {
            let mut guard = self.writer.lock().await;
            *guard = Some(writer);
            self.attached.store(true, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let task = tokio::spawn(self.clone().read_loop(reader, generation));
        if let Some(previous) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }

        self.keepalive.start(Arc::downgrade(self));
        debug!(connection_id = %self.id, generation, "stream attached");

        if let Some(events) = self.events.upgrade() {
            tokio::spawn(async move { events.on_connected().await });
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: Reader, generation: u64) {
        loop {
            match self.codec.read_inbound(&mut reader).await {
                Ok(inbound) => self.handle_inbound(inbound).await,
                Err(err) => {
                    if self.generation.load(Ordering::SeqCst) == generation {
                        info!(
                            connection_id = %self.id,
                            logical_id = ?self.logical_id(),
                            error = %err,
                            "read loop ended"
                        );
                        self.disconnect(true).await;
                    }
                    break;
                }
            }
        }
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::ProbeRequest => {
                if let Err(err) = self
                    .transmit(vec![Bytes::from_static(PROBE_REPLY.as_bytes())])
                    .await
                {
                    debug!(connection_id = %self.id, error = %err, "could not answer probe");
                }
            }
            Inbound::ProbeReply => {
                let probe = self
                    .outstanding_probe
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(id) = probe {
                    if self.pending.resolve(&id, Some(Response::success())) {
                        self.probe_stats.record_reply();
                    }
                }
            }
            Inbound::Envelope(envelope) => self.process_envelope(envelope).await,
        }
    }

    async fn process_envelope(&self, envelope: Envelope) {
        if self.secure_messages
            && !self
                .validator
                .is_trusted(envelope.source_id.as_deref(), envelope.validation_token.as_deref())
        {
            let err = StationLinkError::Untrusted(envelope.id.clone());
            warn!(
                connection_id = %self.id,
                source_id = ?envelope.source_id,
                error = %err,
                "rejecting message"
            );
            if envelope.request.is_some() && envelope.response.is_none() {
                self.reply_or_log(&envelope, Response::failure(UNTRUSTED_MESSAGE)).await;
            } else {
                // Never answer a reply. The waiter, if any, gets the failure.
                self.pending
                    .resolve(&envelope.id, Some(Response::failure(UNTRUSTED_MESSAGE)));
            }
            return;
        }

        let own_id = self.logical_id();
        if let Some(target) = envelope
            .target()
            .filter(|target| own_id.as_deref() != Some(*target))
        {
            let target = target.to_string();
            self.forward(&target, envelope).await;
            return;
        }

        if envelope.confirming_delivery {
            match self.outbox.confirm(own_id.as_deref(), &envelope.id).await {
                Ok(tracked) => debug!(message_id = %envelope.id, tracked, "delivery confirmed"),
                Err(err) => warn!(message_id = %envelope.id, error = %err, "could not release confirmed message"),
            }
            return;
        }

        self.pending.resolve(&envelope.id, envelope.response.clone());

        let events = self.events.upgrade();
        if let Some(events) = &events {
            events.record_transaction("Message received", OffsetDateTime::now_utc());
        }
        let authenticated = events.is_some_and(|events| events.is_authenticated());

        let receivers = self
            .receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let secure_delivery = envelope.secure_delivery;
        let confirmation = secure_delivery.then(|| Envelope::confirmation_of(&envelope));
        if !receivers.is_empty() {
            let connection_id = self.id.clone();
            tokio::spawn(async move {
                for receiver in receivers {
                    let outcome = AssertUnwindSafe(
                        receiver.on_message_received(envelope.clone(), authenticated),
                    )
                    .catch_unwind()
                    .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(connection_id = %connection_id, message_id = %envelope.id, error = %err, "receiver failed");
                        }
                        Err(_) => {
                            warn!(connection_id = %connection_id, message_id = %envelope.id, "receiver panicked");
                        }
                    }
                }
            });
        }

        if let Some(confirmation) = confirmation {
            if let Err(err) = self.send(confirmation).await {
                warn!(connection_id = %self.id, error = %err, "could not confirm delivery");
            }
        }
    }

    async fn forward(&self, target: &str, envelope: Envelope) {
        let forwarder = self
            .forwarder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(forwarder) = forwarder else {
            self.reply_or_log(&envelope, Response::failure(FORWARDING_NOT_IMPLEMENTED))
                .await;
            return;
        };

        let secure_delivery = envelope.secure_delivery;
        let confirmation = secure_delivery.then(|| Envelope::confirmation_of(&envelope));
        match forwarder.forward_message(target, envelope.clone()).await {
            Ok(true) => {
                debug!(connection_id = %self.id, message_id = %envelope.id, target, "message forwarded");
                if let Some(confirmation) = confirmation {
                    if let Err(err) = self.send(confirmation).await {
                        warn!(connection_id = %self.id, error = %err, "could not confirm forwarded delivery");
                    }
                }
            }
            Ok(false) => {
                let message = format!("Message could not be forwarded to {target}");
                self.reply_or_log(&envelope, Response::failure(message)).await;
            }
            Err(err) => {
                warn!(connection_id = %self.id, message_id = %envelope.id, target, error = %err, "forwarding failed");
                self.reply_or_log(&envelope, Response::failure(err.to_string()))
                    .await;
            }
        }
    }

    async fn reply_or_log(&self, to: &Envelope, response: Response) {
        if let Err(err) = self.reply(to, response).await {
            warn!(connection_id = %self.id, message_id = %to.id, error = %err, "could not send reply");
        }
    }

    /// Sends `response` back under the id of `to`.
    pub async fn reply(&self, to: &Envelope, response: Response) -> Result<()> {
        self.send(Envelope::reply_to(to, None, Some(response))).await
    }

    /// Stamps, persists when secure delivery is requested, and writes the
    /// envelope. Probes are written as the bare sentinel.
    pub async fn send(&self, mut envelope: Envelope) -> Result<()> {
        if envelope.is_probe {
            return self
                .transmit(vec![Bytes::from_static(PROBE_REQUEST.as_bytes())])
                .await;
        }
        let source_id = self.logical_id();
        envelope.validation_token = Some(self.validator.generate_token(source_id.as_deref()));
        envelope.source_id = source_id;
        envelope.message_date_time = Some(OffsetDateTime::now_utc());
        self.send_stamped(envelope).await
    }

    /// Writes an envelope received from another connection, keeping the
    /// original sender's identity.
    pub async fn relay(&self, mut envelope: Envelope) -> Result<()> {
        if envelope.message_date_time.is_none() {
            envelope.message_date_time = Some(OffsetDateTime::now_utc());
        }
        self.send_stamped(envelope).await
    }

    async fn send_stamped(&self, envelope: Envelope) -> Result<()> {
        let json = envelope.to_json()?;
        if envelope.secure_delivery && !envelope.confirming_delivery {
            self.outbox
                .persist(self.logical_id().as_deref(), &envelope, &json)
                .await?;
        }
        let frames = self.codec.split_text(&json)?;
        self.transmit(frames).await
    }

    async fn transmit(&self, frames: Vec<Bytes>) -> Result<()> {
        if !self.is_attached() {
            return Err(StationLinkError::Transport(
                "connection is not established".to_string(),
            ));
        }
        if let Err(err) = self.write_raw(frames).await {
            warn!(connection_id = %self.id, logical_id = ?self.logical_id(), error = %err, "write failed");
            self.disconnect(true).await;
            return Err(err);
        }
        Ok(())
    }

    async fn write_raw(&self, frames: Vec<Bytes>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            StationLinkError::Transport("connection is not established".to_string())
        })?;
        for frame in &frames {
            write_frame(writer, frame).await?;
        }
        Ok(())
    }

    /// Sends `envelope` with `waitResponse` set and waits for the reply.
    ///
    /// `timeout` falls back to the configured request timeout. On timeout the
    /// error carries a synthesized failure reply; a disconnect while waiting
    /// ends the wait with `ConnectionLost`.
    pub async fn send_and_await(
        &self,
        mut envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        envelope.wait_response = true;
        let entry = self.pending.register(&envelope);

        if let Err(err) = self.send(envelope.clone()).await {
            self.pending.cancel(&envelope.id);
            return Err(match err {
                StationLinkError::Transport(_) => {
                    envelope.response = Some(Response::failure(NO_CONNECTION_MESSAGE));
                    StationLinkError::ConnectionLost {
                        id: envelope.id.clone(),
                        reply: Box::new(envelope),
                    }
                }
                other => other,
            });
        }

        let timeout = timeout.unwrap_or(self.request_timeout);
        let result = self.pending.await_response(entry, timeout).await;
        if let Err(err) = &result {
            if err.is_timeout() {
                warn!(connection_id = %self.id, message_id = %envelope.id, ?timeout, "no response in time");
                if self.reconnect_on_timeout {
                    self.disconnect(true).await;
                }
            }
        }
        result
    }

    /// Writes a probe and tracks it as the outstanding probe.
    pub async fn send_probe(&self) -> Result<()> {
        let probe = Envelope::probe();
        drop(self.pending.register(&probe));
        let previous = self
            .outstanding_probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(probe.id.clone());
        if let Some(previous) = previous {
            self.pending.cancel(&previous);
        }
        self.probe_stats.record_probe();
        self.send(probe).await
    }

    /// Re-sends everything the outbox still holds for this connection's
    /// logical id.
    pub async fn reload_pending(&self) {
        let Some(owner) = self.logical_id() else {
            return;
        };
        let envelopes = match self.outbox.reload_pending(&owner).await {
            Ok(envelopes) => envelopes,
            Err(err) => {
                warn!(connection_id = %self.id, logical_id = %owner, error = %err, "could not reload pending messages");
                return;
            }
        };
        if !envelopes.is_empty() {
            info!(connection_id = %self.id, logical_id = %owner, count = envelopes.len(), "re-sending pending messages");
        }
        for envelope in envelopes {
            if let Err(err) = self.relay(envelope).await {
                warn!(connection_id = %self.id, error = %err, "could not re-send pending message");
            }
        }
    }

    /// Tears the stream down. With `notify`, `on_disconnected` runs on a new
    /// task if the connection was attached.
    pub async fn disconnect(&self, notify: bool) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let was_attached = self.attached.swap(false, Ordering::SeqCst);
        self.keepalive.stop();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        self.pending.fail_all();
        self.outstanding_probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if was_attached {
            info!(connection_id = %self.id, logical_id = ?self.logical_id(), "disconnected");
            if notify {
                if let Some(events) = self.events.upgrade() {
                    tokio::spawn(async move { events.on_disconnected().await });
                }
            }
        }

        // Last: this may be the read loop's own task.
        let reader = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}
