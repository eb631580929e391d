use async_trait::async_trait;

use crate::domains::message::Envelope;
use crate::error::Result;

/// Invoked for every inbound envelope that the engine does not consume itself
/// (probes, forwards and delivery confirmations never reach receivers).
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn on_message_received(&self, envelope: Envelope, authenticated: bool) -> Result<()>;
}

/// Delivers an envelope addressed to another logical identity.
///
/// `Ok(false)` means the target could not be reached; the engine answers the
/// original sender with a failure response either way.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward_message(&self, target: &str, envelope: Envelope) -> Result<bool>;
}
