use std::sync::Weak;

use async_trait::async_trait;
use tracing::debug;

use crate::domains::message::{Envelope, Response};
use crate::domains::paths;
use crate::error::Result;
use crate::interfaces::receivers::Receiver;
use crate::services::connection::Connection;

/// Answers identity queries from the server. The reply's `sourceId` carries
/// the client's logical id.
pub struct DefaultClientReceiver {
    connection: Weak<Connection>,
}

impl DefaultClientReceiver {
    pub fn new(connection: Weak<Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl Receiver for DefaultClientReceiver {
    async fn on_message_received(&self, envelope: Envelope, _authenticated: bool) -> Result<()> {
        let Some(connection) = self.connection.upgrade() else {
            return Ok(());
        };

        match envelope.path() {
            Some(paths::REQUEST_CLIENT_ID) => {
                let response = Response {
                    path: Some(paths::REQUEST_CLIENT_ID.to_string()),
                    ..Response::success()
                };
                connection.reply(&envelope, response).await
            }
            Some(path) => {
                debug!(connection_id = %connection.id(), path, "request left to application receivers");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
