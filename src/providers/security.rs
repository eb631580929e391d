use crate::domains::message::Authentication;
use crate::interfaces::security::{Authenticator, MessageValidator};

/// Default integrity hook: emits an empty token and, once secure mode is on,
/// trusts nothing until a real validator is plugged in.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderValidator {
    secret: Option<String>,
}

impl PlaceholderValidator {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

impl MessageValidator for PlaceholderValidator {
    fn generate_token(&self, _source_id: Option<&str>) -> String {
        String::new()
    }

    fn is_trusted(&self, _source_id: Option<&str>, _token: Option<&str>) -> bool {
        false
    }
}

/// Fixed user/password pair. Not meant for production use.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    user: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

impl Default for StaticCredentials {
    fn default() -> Self {
        Self::new("admin", "admin")
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, authentication: &Authentication) -> bool {
        authentication.user == self.user && authentication.password == self.password
    }
}
