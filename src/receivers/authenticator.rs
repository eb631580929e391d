use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domains::message::{Envelope, Response};
use crate::domains::paths;
use crate::error::Result;
use crate::interfaces::receivers::Receiver;
use crate::interfaces::security::Authenticator;
use crate::server::ServerConnection;

pub const INVALID_CREDENTIALS: &str = "Credentials are not correct!";

/// Server-side gatekeeper registered on every accepted connection.
///
/// `testConnection` is always answered. Until the connection authenticates,
/// only `auth` requests are handled and everything else is dropped.
pub struct AuthenticatorReceiver {
    connection: Weak<ServerConnection>,
    authenticator: Arc<dyn Authenticator>,
}

impl AuthenticatorReceiver {
    pub fn new(connection: Weak<ServerConnection>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            connection,
            authenticator,
        }
    }
}

#[async_trait]
impl Receiver for AuthenticatorReceiver {
    async fn on_message_received(&self, envelope: Envelope, authenticated: bool) -> Result<()> {
        let Some(connection) = self.connection.upgrade() else {
            return Ok(());
        };
        let Some(request) = envelope.request.as_ref() else {
            if let Some(response) = &envelope.response {
                debug!(connection_id = %connection.id(), message_id = %envelope.id, success = response.success, "response received");
            }
            return Ok(());
        };

        if request.path == paths::TEST_CONNECTION {
            return connection.reply(&envelope, Response::success()).await;
        }
        if authenticated {
            return Ok(());
        }
        if request.path != paths::AUTHENTICATE {
            debug!(connection_id = %connection.id(), path = %request.path, "ignoring request from unauthenticated connection");
            return Ok(());
        }

        let accepted = request
            .authentication
            .as_ref()
            .is_some_and(|credentials| self.authenticator.authenticate(credentials));
        if !accepted {
            warn!(connection_id = %connection.id(), source_id = ?envelope.source_id, "authentication rejected");
            return connection
                .reply(&envelope, Response::failure(INVALID_CREDENTIALS))
                .await;
        }

        connection.set_authenticated(true);
        connection.set_logical_id(envelope.source_id.clone());
        info!(connection_id = %connection.id(), logical_id = ?envelope.source_id, "client authenticated");
        connection.reply(&envelope, Response::success()).await?;
        connection.start_session().await;
        Ok(())
    }
}
