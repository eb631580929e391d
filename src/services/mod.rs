pub mod codec;
pub mod connection;
pub mod keepalive;
pub mod outbox;
pub mod pending;
pub mod transport;
