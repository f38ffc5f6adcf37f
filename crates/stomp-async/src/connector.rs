//! The TCP/TLS seam of the event-driven client.

use std::io;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use stomp_protocol::failover::Broker;

/// Anything the client can read and write frames over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens the byte stream toward a broker, bounded by `timeout`.
///
/// [`TcpConnector`] is the plain-TCP implementation; TLS for `ssl://`
/// brokers is a caller-provided implementation wrapping the socket.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        broker: Broker,
        timeout: Option<Duration>,
    ) -> BoxFuture<'static, io::Result<BoxedTransport>>;
}

/// Plain TCP.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        broker: Broker,
        timeout: Option<Duration>,
    ) -> BoxFuture<'static, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let connect = TcpStream::connect((broker.host.as_str(), broker.port));
            let stream = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, connect)
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out")
                    })??,
                None => connect.await?,
            };
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedTransport)
        })
    }
}
