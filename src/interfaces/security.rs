use crate::domains::message::Authentication;

/// Integrity hook for secure mode.
pub trait MessageValidator: Send + Sync {
    fn generate_token(&self, source_id: Option<&str>) -> String;
    fn is_trusted(&self, source_id: Option<&str>, token: Option<&str>) -> bool;
}

/// Credential check used by the server's default receiver.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, authentication: &Authentication) -> bool;
}
