use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::warn;

use crate::domains::message::Envelope;
use crate::error::{Result, StationLinkError};
use crate::interfaces::storage::DeliveryStore;

/// Secure-delivery envelopes persisted until the peer confirms them.
pub struct DurableOutbox {
    store: Arc<dyn DeliveryStore>,
    in_flight: Mutex<HashMap<String, Envelope>>,
}

impl DurableOutbox {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, Envelope>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `json` (the serialized `envelope`) under its owner before it
    /// is transmitted.
    pub async fn persist(&self, owner: Option<&str>, envelope: &Envelope, json: &str) -> Result<()> {
        let owner = owner.filter(|owner| !owner.is_empty()).ok_or_else(|| {
            StationLinkError::Config(
                "a logical id is required before sending secure-delivery messages".to_string(),
            )
        })?;
        let encoded = BASE64.encode(json);
        self.store.save(owner, &envelope.id, &encoded).await?;
        self.in_flight().insert(envelope.id.clone(), envelope.clone());
        Ok(())
    }

    /// Drops the envelope once the peer acknowledged it. Unknown ids are a no-op.
    pub async fn confirm(&self, owner: Option<&str>, id: &str) -> Result<bool> {
        let tracked = self.in_flight().remove(id).is_some();
        if let Some(owner) = owner.filter(|owner| !owner.is_empty()) {
            self.store.remove(owner, id).await?;
        }
        Ok(tracked)
    }

    /// Everything persisted for `owner`, in storage enumeration order.
    /// Unreadable entries are logged and skipped.
    pub async fn reload_pending(&self, owner: &str) -> Result<Vec<Envelope>> {
        let stored = self.store.list(owner).await?;
        let mut envelopes = Vec::with_capacity(stored.len());
        for (id, encoded) in stored {
            match decode_entry(&encoded) {
                Ok(envelope) => envelopes.push(envelope),
                Err(err) => warn!(owner, id = %id, error = %err, "skipping unreadable pending message"),
            }
        }
        Ok(envelopes)
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.in_flight().contains_key(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.in_flight().len()
    }
}

fn decode_entry(encoded: &str) -> Result<Envelope> {
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|e| StationLinkError::Serialization(e.to_string()))?;
    let text = String::from_utf8(raw).map_err(|e| StationLinkError::Serialization(e.to_string()))?;
    Envelope::from_json(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::message::Request;
    use crate::providers::memory::MemoryDeliveryStore;

    fn secure_envelope() -> Envelope {
        Envelope::request(Request::new("chatMessage").with_text("keep me")).with_secure_delivery()
    }

    #[tokio::test]
    async fn persist_requires_an_owner() {
        let outbox = DurableOutbox::new(Arc::new(MemoryDeliveryStore::new()));
        let envelope = secure_envelope();
        let json = envelope.to_json().unwrap();

        let err = outbox.persist(None, &envelope, &json).await.unwrap_err();
        assert!(matches!(err, StationLinkError::Config(_)));
        let err = outbox.persist(Some(""), &envelope, &json).await.unwrap_err();
        assert!(matches!(err, StationLinkError::Config(_)));
    }

    #[tokio::test]
    async fn confirm_is_idempotent() {
        let store = Arc::new(MemoryDeliveryStore::new());
        let outbox = DurableOutbox::new(store.clone());
        let envelope = secure_envelope();
        let json = envelope.to_json().unwrap();

        outbox.persist(Some("station"), &envelope, &json).await.unwrap();
        assert!(outbox.is_tracked(&envelope.id));
        assert_eq!(store.len("station").await, 1);

        assert!(outbox.confirm(Some("station"), &envelope.id).await.unwrap());
        let after_first = (outbox.tracked_count(), store.len("station").await);
        assert!(!outbox.confirm(Some("station"), &envelope.id).await.unwrap());
        assert_eq!((outbox.tracked_count(), store.len("station").await), after_first);
        assert_eq!(after_first, (0, 0));
    }

    #[tokio::test]
    async fn reload_decodes_what_was_persisted() {
        let store = Arc::new(MemoryDeliveryStore::new());
        let first = DurableOutbox::new(store.clone());
        let envelope = secure_envelope();
        let json = envelope.to_json().unwrap();
        first.persist(Some("station"), &envelope, &json).await.unwrap();
        store.save("station", "broken", "!!not base64!!").await.unwrap();

        let restarted = DurableOutbox::new(store);
        let reloaded = restarted.reload_pending("station").await.unwrap();
        assert_eq!(reloaded, vec![envelope]);
        assert!(restarted.reload_pending("other").await.unwrap().is_empty());
    }
}
