//! Producer transport
//!
//! Producers own a boxed byte stream. The [`Connector`] seam lets tests swap
//! TCP for in-memory streams.

use super::uri::Uri;
use crate::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte stream usable as a producer transport
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> TransportStream for T {}

/// Owned transport stream
pub type BoxedStream = Box<dyn TransportStream>;

/// Opens transport streams to producer URIs
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve `uri` to socket addresses
    async fn resolve(&self, uri: &Uri) -> Result<Vec<SocketAddr>> {
        uri.resolve().await
    }

    /// Connect to `uri` within `timeout`
    async fn connect(&self, uri: &Uri, timeout: Duration) -> Result<BoxedStream>;
}

/// TCP connector
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, uri: &Uri, timeout: Duration) -> Result<BoxedStream> {
        let addr = (uri.host.as_str(), uri.port);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == IoErrorKind::ConnectionRefused => {
                return Err(Error::topology(format!("Connection refused by {}", uri)));
            }
            Ok(Err(e)) => {
                return Err(Error::topology(format!("Cannot connect to {}: {}", uri, e)));
            }
            Err(_) => {
                return Err(Error::timeout(format!(
                    "Connect to {} timed out after {}ms",
                    uri,
                    timeout.as_millis()
                )));
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let uri = Uri::parse(&format!("vgx://127.0.0.1:{}", port), "vgx").unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        TcpConnector.connect(&uri, Duration::from_secs(1)).await.unwrap();
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_refused() {
        // Bind then drop to find a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let uri = Uri::parse(&format!("vgx://127.0.0.1:{}", port), "vgx").unwrap();
        let err = TcpConnector
            .connect(&uri, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Topology);
    }
}
