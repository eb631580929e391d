pub mod client;
pub mod config;
pub mod domains;
pub mod error;
pub mod interfaces;
pub mod providers;
pub mod receivers;
pub mod server;
pub mod services;

pub use crate::client::{ClientBuilder, ClientConnection};
pub use crate::config::{ClientOptions, Config, HostEndpoint, MessagingOptions, ServerOptions};
pub use crate::domains::message::{Envelope, FileAttachment, Request, Response};
pub use crate::error::{Result, StationLinkError};
pub use crate::server::{ClientSession, Listener, ListenerBuilder, ServerConnection};
pub use crate::services::connection::{Connection, ConnectionEvents};
