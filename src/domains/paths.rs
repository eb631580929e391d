//! Well-known request paths understood by the default receivers.

pub const REQUEST_CLIENT_ID: &str = "requestClientId";
pub const AUTHENTICATE: &str = "auth";
pub const SHARE_FILES: &str = "shareFiles";
pub const CHAT_MESSAGE: &str = "chatMessage";
pub const TEST_CONNECTION: &str = "testConnection";
