use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use crate::endpoint::Endpoint;
use crate::protocol::error::{QueryError, Result};
use crate::protocol::{Envelope, Protocol};
use crate::transport::codec::FramedCodec;
use crate::transport::{expect_protocol, map_io_error, with_timeout, Transport};

/// TCP binding for tensor query.
///
/// Every envelope is framed with a 4-byte big-endian length prefix, so a
/// command split across reads is reassembled before it is decoded:
///
/// ```text
/// [4-byte length] [command][protocol][payload]
/// ```
///
/// # Example
///
/// ```no_run
/// use tensor_query_common::transport::{TcpLink, Transport};
/// use tensor_query_common::protocol::{Envelope, Protocol};
/// use tensor_query_common::Endpoint;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let timeout = Duration::from_secs(1);
/// let mut link = TcpLink::connect(&Endpoint::tcp("127.0.0.1", 4953), timeout).await?;
/// link.send(&Envelope::end(Protocol::Tcp), timeout).await?;
/// link.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct TcpLink {
    framed: Option<Framed<TcpStream, FramedCodec>>,
    peer: SocketAddr,
}

impl TcpLink {
    /// Wraps an accepted stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        Self {
            framed: Some(Framed::new(stream, FramedCodec::new())),
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn framed(&mut self) -> Result<&mut Framed<TcpStream, FramedCodec>> {
        self.framed.as_mut().ok_or(QueryError::ConnectionClosed)
    }
}

impl Transport for TcpLink {
    /// Resolves the endpoint and tries each address until one connects.
    ///
    /// The whole attempt, including every address tried, shares one deadline.
    async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        expect_protocol(endpoint, Protocol::Tcp)?;
        let deadline = Instant::now() + timeout;
        let address = endpoint.address();

        let addrs: Vec<SocketAddr> = with_timeout(timeout, async {
            tokio::net::lookup_host(&address)
                .await
                .map(|addrs| addrs.collect())
                .map_err(|e| QueryError::AddressInvalid(format!("'{}': {}", address, e)))
        })
        .await?;

        if addrs.is_empty() {
            return Err(QueryError::AddressInvalid(format!(
                "'{}' resolved to no addresses",
                address
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    tracing::debug!("Connected to {} ({})", endpoint, addr);
                    return Ok(Self::from_stream(stream, addr));
                }
                Ok(Err(e)) => last_err = Some(map_connect_error(e, addr, timeout)),
                Err(_) => last_err = Some(QueryError::timeout(timeout)),
            }
        }

        Err(last_err.unwrap_or_else(|| QueryError::timeout(timeout)))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn is_open(&self) -> bool {
        self.framed.is_some()
    }

    /// Writes one frame and flushes it; partial writes are retried by the sink
    /// until the frame is out or the bound expires.
    async fn send(&mut self, envelope: &Envelope, timeout: Duration) -> Result<()> {
        let framed = self.framed()?;
        with_timeout(timeout, async {
            framed.send(envelope).await.map_err(|e| match e {
                QueryError::Io(io) => map_io_error(io, timeout, "writing frame"),
                other => other,
            })
        })
        .await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Envelope> {
        let framed = self.framed()?;
        with_timeout(timeout, async {
            match framed.next().await {
                Some(Ok(envelope)) => Ok(envelope),
                Some(Err(QueryError::Io(io))) => Err(map_io_error(io, timeout, "reading frame")),
                Some(Err(e)) => Err(e),
                // Peer closed the stream
                None => Err(QueryError::ConnectionClosed),
            }
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(framed) = self.framed.take() {
            let mut stream = framed.into_inner();
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Shutdown of {} failed: {}", self.peer, e);
            }
        }
        Ok(())
    }
}

fn map_connect_error(err: std::io::Error, addr: SocketAddr, timeout: Duration) -> QueryError {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::NetworkUnreachable
        | ErrorKind::HostUnreachable => QueryError::Refused(format!("{}: {}", addr, err)),
        ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => {
            QueryError::AddressInvalid(format!("{}: {}", addr, err))
        }
        ErrorKind::TimedOut => QueryError::timeout(timeout),
        _ => QueryError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataInfo, TensorInfo, TensorLayout, TensorType};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn link_pair() -> (TcpLink, TcpLink) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::tcp("127.0.0.1", port);
        let connect = TcpLink::connect(&endpoint, TIMEOUT);
        let (client, accepted) = tokio::join!(connect, listener.accept());
        let (stream, peer) = accepted.unwrap();
        (client.unwrap(), TcpLink::from_stream(stream, peer))
    }

    #[tokio::test]
    async fn test_send_receive_over_loopback() {
        let (mut client, mut server) = link_pair().await;
        let info = DataInfo::new(TensorLayout::single(TensorInfo::new(
            TensorType::UInt8,
            vec![2, 2],
        )));

        client
            .send(&Envelope::start(Protocol::Tcp, info.clone()), TIMEOUT)
            .await
            .unwrap();
        client
            .send(&Envelope::data(Protocol::Tcp, vec![1u8, 2, 3, 4]), TIMEOUT)
            .await
            .unwrap();

        let start = server.receive(TIMEOUT).await.unwrap();
        assert_eq!(start.data_info().unwrap(), &info);
        let data = server.receive(TIMEOUT).await.unwrap();
        assert_eq!(data.chunk().unwrap().as_ref(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (_client, mut server) = link_pair().await;
        let result = server.receive(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(QueryError::Timeout(50))));
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_closed() {
        let (mut client, mut server) = link_pair().await;
        client.close().await.unwrap();
        let result = server.receive(TIMEOUT).await;
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut client, _server) = link_pair().await;
        assert!(client.close().await.is_ok());
        assert!(client.close().await.is_ok());
        assert!(!client.is_open());
        let result = client.send(&Envelope::end(Protocol::Tcp), TIMEOUT).await;
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_frames_carry_length_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = TcpLink::connect(&Endpoint::tcp("127.0.0.1", port), TIMEOUT)
            .await
            .unwrap();
        let (mut raw, _) = listener.accept().await.unwrap();

        client
            .send(&Envelope::approve(Protocol::Tcp), TIMEOUT)
            .await
            .unwrap();

        let mut buf = [0u8; 6];
        raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 2, 3, 0]);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpLink::connect(&Endpoint::tcp("127.0.0.1", port), TIMEOUT).await;
        assert!(matches!(result, Err(QueryError::Refused(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_protocol() {
        let result = TcpLink::connect(&Endpoint::udp("127.0.0.1", 1), TIMEOUT).await;
        assert!(matches!(result, Err(QueryError::UnsupportedTransport(_))));
    }
}
