pub mod authenticator;
pub mod client_default;
