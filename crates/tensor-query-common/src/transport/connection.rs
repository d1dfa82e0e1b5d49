use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::protocol::error::{QueryError, Result};
use crate::protocol::{Envelope, Protocol};
use crate::stats::TransferStats;
use crate::transport::memory::MemoryTransport;
use crate::transport::{MqttLink, TcpLink, Transport, UdpLink};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identifier of a connection within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Closes a connection from another task.
///
/// In-flight `send`/`receive` on the connection return `ConnectionClosed`
/// as soon as the handle fires.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub(crate) enum Link {
    Tcp(TcpLink),
    Udp(UdpLink),
    Mqtt(MqttLink),
    Memory(MemoryTransport),
}

macro_rules! dispatch {
    ($link:expr, $inner:ident => $body:expr) => {
        match $link {
            Link::Tcp($inner) => $body,
            Link::Udp($inner) => $body,
            Link::Mqtt($inner) => $body,
            Link::Memory($inner) => $body,
        }
    };
}

/// The connection handle callers own.
///
/// A connection is created for one protocol, possibly unopened, and opened
/// either by [`connect`](Transport::connect) / [`open`](Self::open) or by a
/// server accept. Every envelope received is checked against that protocol.
/// Closing is idempotent, and closing a never-opened connection is a no-op.
///
/// # Example
///
/// ```no_run
/// use tensor_query_common::{Endpoint, Protocol, QueryConnection, Envelope, Transport};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let timeout = Duration::from_secs(1);
/// let mut conn = QueryConnection::connect(&Endpoint::udp("127.0.0.1", 4953), timeout).await?;
/// conn.send(&Envelope::end(Protocol::Udp), timeout).await?;
/// conn.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct QueryConnection {
    id: ConnectionId,
    protocol: Protocol,
    link: Option<Link>,
    closed: CancellationToken,
    stats: Arc<TransferStats>,
}

impl QueryConnection {
    /// An unopened connection for `protocol`.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            id: ConnectionId::next(),
            protocol,
            link: None,
            closed: CancellationToken::new(),
            stats: Arc::new(TransferStats::new()),
        }
    }

    pub(crate) fn with_link(protocol: Protocol, link: Link) -> Self {
        let mut conn = Self::new(protocol);
        conn.link = Some(link);
        conn
    }

    /// Opens this connection to `endpoint`.
    ///
    /// Opening an already open connection closes the old link first.
    pub async fn open(&mut self, endpoint: &Endpoint, timeout: Duration) -> Result<()> {
        if endpoint.protocol != self.protocol {
            return Err(QueryError::UnsupportedTransport(format!(
                "{} connection cannot open {}",
                self.protocol, endpoint
            )));
        }
        self.close().await?;

        let link = match self.protocol {
            Protocol::Tcp => Link::Tcp(TcpLink::connect(endpoint, timeout).await?),
            Protocol::Udp => Link::Udp(UdpLink::connect(endpoint, timeout).await?),
            Protocol::Mqtt => Link::Mqtt(MqttLink::connect(endpoint, timeout).await?),
        };
        self.link = Some(link);
        self.closed = CancellationToken::new();
        tracing::debug!("Connection {} opened to {}", self.id, endpoint);
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            token: self.closed.clone(),
        }
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    fn link(&mut self) -> Result<&mut Link> {
        if self.closed.is_cancelled() {
            return Err(QueryError::ConnectionClosed);
        }
        self.link.as_mut().ok_or(QueryError::ConnectionClosed)
    }
}

impl Transport for QueryConnection {
    async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let mut conn = Self::new(endpoint.protocol);
        conn.open(endpoint, timeout).await?;
        Ok(conn)
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
            && self
                .link
                .as_ref()
                .is_some_and(|link| dispatch!(link, inner => inner.is_open()))
    }

    async fn send(&mut self, envelope: &Envelope, timeout: Duration) -> Result<()> {
        if envelope.protocol() != self.protocol {
            return Err(QueryError::UnsupportedTransport(format!(
                "{} envelope on a {} connection",
                envelope.protocol(),
                self.protocol
            )));
        }
        let closed = self.closed.clone();
        let link = self.link()?;

        tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(QueryError::ConnectionClosed),
            result = async {
                dispatch!(link, inner => inner.send(envelope, timeout).await)
            } => result?,
        }

        self.stats.record_sent(envelope);
        tracing::debug!("Connection {} sent {}", self.id, envelope.kind());
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Envelope> {
        let closed = self.closed.clone();
        let link = self.link()?;

        let envelope = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(QueryError::ConnectionClosed),
            result = async { dispatch!(link, inner => inner.receive(timeout).await) } => result?,
        };

        if envelope.protocol() != self.protocol {
            return Err(QueryError::Malformed(format!(
                "{} envelope received on a {} connection",
                envelope.protocol(),
                self.protocol
            )));
        }
        self.stats.record_received(&envelope);
        tracing::debug!("Connection {} received {}", self.id, envelope.kind());
        Ok(envelope)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.cancel();
        if let Some(mut link) = self.link.take() {
            dispatch!(&mut link, inner => inner.close().await)?;
            tracing::debug!("Connection {} closed", self.id);
        }
        Ok(())
    }
}

impl fmt::Debug for QueryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConnection")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("open", &self.is_open())
            .finish()
    }
}

impl From<TcpLink> for QueryConnection {
    fn from(link: TcpLink) -> Self {
        Self::with_link(Protocol::Tcp, Link::Tcp(link))
    }
}

impl From<UdpLink> for QueryConnection {
    fn from(link: UdpLink) -> Self {
        Self::with_link(Protocol::Udp, Link::Udp(link))
    }
}

impl From<MqttLink> for QueryConnection {
    fn from(link: MqttLink) -> Self {
        Self::with_link(Protocol::Mqtt, Link::Mqtt(link))
    }
}

impl From<MemoryTransport> for QueryConnection {
    fn from(link: MemoryTransport) -> Self {
        Self::with_link(link.protocol(), Link::Memory(link))
    }
}
