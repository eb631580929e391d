use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Result, StationLinkError};

/// Hard ceiling on a single frame, imposed by the 16-bit length prefix.
pub const MAX_FRAME_CEILING: usize = 65535;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16400;
pub const DEFAULT_CLIENT_TIMEOUT_SECONDS: u64 = 60 * 5;
pub const DEFAULT_SERVER_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_KEEPALIVE_SECONDS: u64 = 30;
pub const DEFAULT_RECONNECT_DELAY_SECONDS: u64 = 10;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;
pub const DEFAULT_GRACE_SECONDS: u64 = 5 * 60;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagingConfig {
    pub max_frame_bytes: Option<usize>,
    pub request_timeout_seconds: Option<u64>,
    pub secure_messages: Option<bool>,
    pub secure_token_path: Option<String>,
    pub keepalive_interval_seconds: Option<u64>,
    pub storage_root: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsConfig {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub client_id: String,
    pub hosts: Vec<HostConfig>,
    pub keep_connection_alive: Option<bool>,
    pub reconnect_delay_seconds: Option<u64>,
    pub reconnect_on_timeout: Option<bool>,
    pub credentials: Option<CredentialsConfig>,
    pub messaging: Option<MessagingConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub port: u16,
    pub max_connections: Option<u32>,
    pub unauthenticated_grace_seconds: Option<u64>,
    pub messaging: Option<MessagingConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub client: Option<ClientConfig>,
    pub server: Option<ServerConfig>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| StationLinkError::Config(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| StationLinkError::Config(e.to_string()))?;
        Ok(config)
    }
}

/// Runtime settings shared by both connection variants.
#[derive(Debug, Clone)]
pub struct MessagingOptions {
    pub max_frame_bytes: usize,
    pub request_timeout: Duration,
    pub secure_messages: bool,
    pub secure_token_path: Option<PathBuf>,
    pub keepalive_interval: Duration,
    pub storage_root: PathBuf,
}

impl MessagingOptions {
    pub fn client_defaults() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECONDS),
            secure_messages: false,
            secure_token_path: None,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECONDS),
            storage_root: PathBuf::from("./client-messages"),
        }
    }

    pub fn server_defaults() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECONDS),
            storage_root: PathBuf::from("./server-messages"),
            ..Self::client_defaults()
        }
    }

    fn apply(mut self, config: Option<&MessagingConfig>) -> Self {
        let Some(config) = config else {
            return self;
        };
        if let Some(value) = config.max_frame_bytes {
            self.max_frame_bytes = value;
        }
        if let Some(value) = config.request_timeout_seconds {
            self.request_timeout = Duration::from_secs(value);
        }
        if let Some(value) = config.secure_messages {
            self.secure_messages = value;
        }
        if let Some(value) = &config.secure_token_path {
            self.secure_token_path = Some(PathBuf::from(value));
        }
        if let Some(value) = config.keepalive_interval_seconds {
            self.keepalive_interval = Duration::from_secs(value);
        }
        if let Some(value) = &config.storage_root {
            self.storage_root = PathBuf::from(value);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_bytes == 0 {
            return Err(StationLinkError::Config(
                "max frame bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_frame_bytes > MAX_FRAME_CEILING {
            return Err(StationLinkError::Config(format!(
                "the amount of bytes allowed per frame is {MAX_FRAME_CEILING} and {} was configured",
                self.max_frame_bytes
            )));
        }
        if self.keepalive_interval.is_zero() {
            return Err(StationLinkError::Config(
                "keepalive interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads the base64 token file when secure mode is on.
    pub fn load_secure_token(&self) -> Result<Option<String>> {
        if !self.secure_messages {
            return Ok(None);
        }
        let path = self.secure_token_path.as_ref().ok_or_else(|| {
            StationLinkError::Config("secure messages require a secure token path".to_string())
        })?;
        let encoded = fs::read_to_string(path)
            .map_err(|_| StationLinkError::Config("secure token could not be loaded".to_string()))?;
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| StationLinkError::Config("secure token could not be loaded".to_string()))?;
        String::from_utf8(raw)
            .map(Some)
            .map_err(|_| StationLinkError::Config("secure token could not be loaded".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
}

impl HostEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`.
    pub fn parse(value: &str) -> Result<Self> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| StationLinkError::Config(format!("invalid host address: {value}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| StationLinkError::Config(format!("invalid port in {value}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    pub hosts: Vec<HostEndpoint>,
    pub keep_connection_alive: bool,
    pub reconnect_delay: Duration,
    pub reconnect_on_timeout: bool,
    pub user: String,
    pub password: String,
    pub messaging: MessagingOptions,
}

impl ClientOptions {
    pub fn new(client_id: impl Into<String>, hosts: Vec<HostEndpoint>) -> Self {
        Self {
            client_id: client_id.into(),
            hosts,
            keep_connection_alive: true,
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECONDS),
            reconnect_on_timeout: false,
            user: "admin".to_string(),
            password: "admin".to_string(),
            messaging: MessagingOptions::client_defaults(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(StationLinkError::Config(
                "no host available to connect".to_string(),
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(StationLinkError::Config("client id must not be empty".to_string()));
        }
        self.messaging.validate()
    }
}

impl TryFrom<&ClientConfig> for ClientOptions {
    type Error = StationLinkError;

    fn try_from(config: &ClientConfig) -> Result<Self> {
        let hosts = config
            .hosts
            .iter()
            .map(|host| HostEndpoint::new(host.host.clone(), host.port))
            .collect();
        let mut options = ClientOptions::new(config.client_id.clone(), hosts);
        if let Some(value) = config.keep_connection_alive {
            options.keep_connection_alive = value;
        }
        if let Some(value) = config.reconnect_delay_seconds {
            options.reconnect_delay = Duration::from_secs(value);
        }
        if let Some(value) = config.reconnect_on_timeout {
            options.reconnect_on_timeout = value;
        }
        if let Some(credentials) = &config.credentials {
            options.user = credentials.user.clone();
            options.password = credentials.password.clone();
        }
        options.messaging = MessagingOptions::client_defaults().apply(config.messaging.as_ref());
        options.validate()?;
        Ok(options)
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_address: String,
    pub port: u16,
    pub max_connections: u32,
    pub unauthenticated_grace: Duration,
    pub messaging: MessagingOptions,
}

impl ServerOptions {
    pub fn new(port: u16) -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            unauthenticated_grace: Duration::from_secs(DEFAULT_GRACE_SECONDS),
            messaging: MessagingOptions::server_defaults(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(StationLinkError::Config(
                "max connections must be greater than zero".to_string(),
            ));
        }
        self.messaging.validate()
    }
}

impl TryFrom<&ServerConfig> for ServerOptions {
    type Error = StationLinkError;

    fn try_from(config: &ServerConfig) -> Result<Self> {
        let mut options = ServerOptions::new(config.port);
        if let Some(value) = &config.bind_address {
            options.bind_address = value.clone();
        }
        if let Some(value) = config.max_connections {
            options.max_connections = value;
        }
        if let Some(value) = config.unauthenticated_grace_seconds {
            options.unauthenticated_grace = Duration::from_secs(value);
        }
        options.messaging = MessagingOptions::server_defaults().apply(config.messaging.as_ref());
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn oversized_frame_limit_is_rejected() {
        let mut options = MessagingOptions::client_defaults();
        options.max_frame_bytes = MAX_FRAME_CEILING + 1;
        let err = options.validate().unwrap_err();
        assert!(matches!(err, StationLinkError::Config(_)));

        options.max_frame_bytes = MAX_FRAME_CEILING;
        options.validate().unwrap();
    }

    #[test]
    fn client_config_requires_hosts() {
        let config = ClientConfig {
            client_id: "station".to_string(),
            hosts: Vec::new(),
            keep_connection_alive: None,
            reconnect_delay_seconds: None,
            reconnect_on_timeout: None,
            credentials: None,
            messaging: None,
        };
        assert!(ClientOptions::try_from(&config).is_err());
    }

    #[test]
    fn loads_json_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "client": {{
                    "client_id": "station-7",
                    "hosts": [{{"host": "10.0.0.1", "port": 1035}}, {{"host": "10.0.0.2", "port": 1035}}],
                    "reconnect_delay_seconds": 2,
                    "messaging": {{"max_frame_bytes": 4096}}
                }},
                "server": {{"port": 1035}}
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        let client = ClientOptions::try_from(config.client.as_ref().unwrap()).unwrap();
        assert_eq!(client.hosts.len(), 2);
        assert_eq!(client.reconnect_delay, Duration::from_secs(2));
        assert!(client.keep_connection_alive);
        assert_eq!(client.messaging.max_frame_bytes, 4096);
        assert_eq!(client.messaging.request_timeout, Duration::from_secs(300));

        let server = ServerOptions::try_from(config.server.as_ref().unwrap()).unwrap();
        assert_eq!(server.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(server.unauthenticated_grace, Duration::from_secs(300));
        assert_eq!(server.messaging.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn secure_token_is_base64_decoded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", BASE64.encode("s3cret")).unwrap();
        let mut options = MessagingOptions::server_defaults();
        assert_eq!(options.load_secure_token().unwrap(), None);

        options.secure_messages = true;
        options.secure_token_path = Some(file.path().to_path_buf());
        assert_eq!(options.load_secure_token().unwrap().as_deref(), Some("s3cret"));

        options.secure_token_path = Some(PathBuf::from("/definitely/missing/token"));
        assert!(options.load_secure_token().is_err());
    }

    #[test]
    fn parses_host_endpoints() {
        let host = HostEndpoint::parse("127.0.0.1:1035").unwrap();
        assert_eq!(host, HostEndpoint::new("127.0.0.1", 1035));
        assert_eq!(host.to_string(), "127.0.0.1:1035");
        assert!(HostEndpoint::parse("nope").is_err());
    }
}
