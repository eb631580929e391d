use thiserror::Error;

use crate::domains::message::Envelope;

#[derive(Debug, Error)]
pub enum StationLinkError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no response for message {id} within {seconds}s")]
    Timeout {
        id: String,
        seconds: u64,
        reply: Box<Envelope>,
    },
    #[error("connection lost while waiting for message {id}")]
    ConnectionLost { id: String, reply: Box<Envelope> },
    #[error("untrusted message: {0}")]
    Untrusted(String),
    #[error("forwarding unavailable: {0}")]
    ForwardUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl StationLinkError {
    /// The synthesized failure reply carried by wait errors.
    pub fn reply(&self) -> Option<&Envelope> {
        match self {
            Self::Timeout { reply, .. } | Self::ConnectionLost { reply, .. } => Some(reply),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, StationLinkError>;
