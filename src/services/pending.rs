use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::domains::message::{Envelope, Response};
use crate::error::{Result, StationLinkError};

pub const NO_CONNECTION_MESSAGE: &str = "No connection available";

type Waiter = oneshot::Sender<Option<Response>>;

/// A request that has been registered and is waiting for its reply.
pub struct PendingEntry {
    envelope: Envelope,
    reply: oneshot::Receiver<Option<Response>>,
}

impl PendingEntry {
    pub fn id(&self) -> &str {
        &self.envelope.id
    }
}

/// Correlates sent envelopes with their replies by envelope id.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, envelope: &Envelope) -> PendingEntry {
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(envelope.id.clone(), tx);
        PendingEntry {
            envelope: envelope.clone(),
            reply: rx,
        }
    }

    /// Hands `response` to the waiter registered under `id`.
    ///
    /// Returns false when nothing was waiting; a second resolve for the same
    /// id is therefore a no-op.
    pub fn resolve(&self, id: &str, response: Option<Response>) -> bool {
        let Some(waiter) = self.waiters().remove(id) else {
            return false;
        };
        let _ = waiter.send(response);
        true
    }

    pub fn cancel(&self, id: &str) {
        self.waiters().remove(id);
    }

    /// Drops every waiter; their awaits end with `ConnectionLost`.
    pub fn fail_all(&self) {
        self.waiters().clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.waiters().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `timeout` for the reply. Never blocks anything but the caller.
    pub async fn await_response(&self, entry: PendingEntry, timeout: Duration) -> Result<Envelope> {
        let PendingEntry {
            mut envelope,
            reply,
        } = entry;
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(response)) => {
                envelope.response = response;
                Ok(envelope)
            }
            Ok(Err(_)) => {
                envelope.response = Some(Response::failure(NO_CONNECTION_MESSAGE));
                Err(StationLinkError::ConnectionLost {
                    id: envelope.id.clone(),
                    reply: Box::new(envelope),
                })
            }
            Err(_) => {
                self.cancel(&envelope.id);
                let seconds = timeout.as_secs();
                envelope.response = Some(Response::failure(format!(
                    "Time exceeded for a response. DefinedTimeout={}ms",
                    timeout.as_millis()
                )));
                Err(StationLinkError::Timeout {
                    id: envelope.id.clone(),
                    seconds,
                    reply: Box::new(envelope),
                })
            }
        }
    }
}
