use async_trait::async_trait;

use crate::error::Result;

/// Durable, per-owner storage for envelopes awaiting delivery confirmation.
///
/// `encoded` is the base64 form of the canonical JSON text.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn save(&self, owner: &str, id: &str, encoded: &str) -> Result<()>;
    async fn remove(&self, owner: &str, id: &str) -> Result<()>;
    async fn list(&self, owner: &str) -> Result<Vec<(String, String)>>;
}
