use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, StationLinkError};
use crate::interfaces::transport::{BoxedStream, Transport};

/// Plain TCP dialer used by clients unless a transport is injected.
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        if host.trim().is_empty() {
            return Err(StationLinkError::Config(format!(
                "host for port {port} is empty"
            )));
        }
        let stream = TcpStream::connect((host, port)).await.map_err(|err| {
            StationLinkError::Transport(format!("could not connect to {host}:{port}: {err}"))
        })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(host, port, error = %err, "could not disable nagle");
        }
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_dial_names_the_host() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = match LocalTransport.connect("127.0.0.1", port).await {
            Ok(_) => panic!("nothing listens on port {port}"),
            Err(err) => err,
        };
        assert!(matches!(err, StationLinkError::Transport(_)));
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
    }

    #[tokio::test]
    async fn empty_host_is_a_config_error() {
        let err = match LocalTransport.connect(" ", 5000).await {
            Ok(_) => panic!("empty host must not dial"),
            Err(err) => err,
        };
        assert!(matches!(err, StationLinkError::Config(_)));
    }

    #[tokio::test]
    async fn dials_a_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        assert!(LocalTransport.connect("127.0.0.1", port).await.is_ok());
        accept.await.unwrap().unwrap();
    }
}
