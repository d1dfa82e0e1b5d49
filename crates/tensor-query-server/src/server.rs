use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tensor_query_common::transport::{MqttAcceptor, TcpLink, UdpAcceptor};
use tensor_query_common::{
    ConnectionId, Endpoint, Protocol, QueryConnection, QueryError, Result, TensorLayout,
    Transport,
};

use crate::config::ServerConfig;
use crate::connections::ConnectionTable;
use crate::policy::{SinkConfig, StreamPolicy};
use crate::session::{ReceivedBuffer, ServerSession};

/// Bound listener of one transport kind.
enum Acceptor {
    Tcp(TcpListener),
    Udp(UdpAcceptor),
    Mqtt(MqttAcceptor),
}

impl Acceptor {
    async fn accept(&mut self) -> Result<QueryConnection> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!("Accepted TCP connection from {}", peer);
                Ok(TcpLink::from_stream(stream, peer).into())
            }
            Acceptor::Udp(acceptor) => Ok(acceptor.accept().await?.into()),
            Acceptor::Mqtt(acceptor) => Ok(acceptor.accept().await?.into()),
        }
    }

    fn shutdown(&mut self) {
        match self {
            Acceptor::Tcp(_) => {}
            Acceptor::Udp(acceptor) => acceptor.shutdown(),
            Acceptor::Mqtt(acceptor) => acceptor.shutdown(),
        }
    }
}

/// Where the server is set up.
#[derive(Debug, Default)]
struct Binding {
    protocol: Option<Protocol>,
    local_addr: Option<SocketAddr>,
    port: u16,
    /// `None` until the first setup; cancelled by `free`.
    shutdown: Option<CancellationToken>,
}

/// Tensor query server.
///
/// The server is an explicit object: [`init`](Self::init) creates it with
/// nothing bound, [`setup`](Self::setup) binds one transport,
/// [`accept`](Self::accept) hands out connections and [`free`](Self::free)
/// releases everything. Share it through an `Arc` to accept from several
/// tasks; concurrent accepts are serialized.
///
/// # Example
///
/// ```no_run
/// use tensor_query_common::Protocol;
/// use tensor_query_server::{AcceptAll, QueryServer};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Arc::new(QueryServer::init());
/// server.setup(Protocol::Tcp, "127.0.0.1", 0).await?;
/// println!("listening on port {}", server.current_port());
///
/// let (sink, mut buffers) = tokio::sync::mpsc::channel(16);
/// let serving = server.clone();
/// tokio::spawn(async move { serving.serve(AcceptAll, sink).await });
///
/// while let Some(received) = buffers.recv().await {
///     println!("{} bytes from {}", received.buffer.len(), received.connection);
/// }
/// server.free().await?;
/// # Ok(())
/// # }
/// ```
pub struct QueryServer {
    config: ServerConfig,
    acceptor: tokio::sync::Mutex<Option<Acceptor>>,
    binding: Mutex<Binding>,
    connections: ConnectionTable,
    sink_config: SinkConfig,
}

impl QueryServer {
    /// Creates a server with nothing bound.
    pub fn init() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            acceptor: tokio::sync::Mutex::new(None),
            binding: Mutex::new(Binding::default()),
            connections: ConnectionTable::new(),
            sink_config: SinkConfig::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the server to `(host, port)` over `protocol`.
    ///
    /// Port 0 picks a free port, see [`current_port`](Self::current_port).
    /// For MQTT, `(host, port)` is the broker. Setting up an already set up
    /// server frees it first.
    pub async fn setup(&self, protocol: Protocol, host: &str, port: u16) -> Result<()> {
        self.free().await?;

        let (acceptor, local_addr) = match protocol {
            Protocol::Tcp => {
                let listener = self.bind_tcp(host, port).await?;
                let local_addr = listener.local_addr()?;
                (Acceptor::Tcp(listener), Some(local_addr))
            }
            Protocol::Udp => {
                let acceptor = UdpAcceptor::bind(host, port, self.config.accept_backlog).await?;
                let local_addr = acceptor.local_addr();
                (Acceptor::Udp(acceptor), Some(local_addr))
            }
            Protocol::Mqtt => {
                let acceptor = MqttAcceptor::bind(
                    host,
                    port,
                    self.config.accept_backlog,
                    self.config.bind_timeout,
                )
                .await?;
                (Acceptor::Mqtt(acceptor), None)
            }
        };

        let mut guard = self.acceptor.lock().await;
        *guard = Some(acceptor);
        {
            let mut binding = self.binding();
            binding.protocol = Some(protocol);
            binding.port = local_addr.map(|addr| addr.port()).unwrap_or(port);
            binding.local_addr = local_addr;
            binding.shutdown = Some(CancellationToken::new());
        }
        drop(guard);

        tracing::info!(
            "Server set up on {}",
            Endpoint::new(protocol, host, self.current_port())
        );
        Ok(())
    }

    async fn bind_tcp(&self, host: &str, port: u16) -> Result<TcpListener> {
        let address = Endpoint::tcp(host, port).address();
        let bind_failed = |e: std::io::Error| QueryError::BindFailed(format!("{}: {}", address, e));

        let addr = tokio::net::lookup_host(&address)
            .await
            .map_err(bind_failed)?
            .next()
            .ok_or_else(|| QueryError::BindFailed(format!("{}: no usable address", address)))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_failed)?;
        socket.set_reuseaddr(true).map_err(bind_failed)?;
        socket.bind(addr).map_err(bind_failed)?;
        socket.listen(self.config.listen_backlog).map_err(bind_failed)
    }

    /// Waits for the next connection, at most `timeout` if given.
    ///
    /// Concurrent calls are served one at a time and each returns its own
    /// connection. [`free`](Self::free) interrupts a waiting call with
    /// `ServerClosed`.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<QueryConnection> {
        let shutdown = self
            .binding()
            .shutdown
            .clone()
            .ok_or(QueryError::NotConfigured)?;

        let waiting = async {
            let mut guard = tokio::select! {
                _ = shutdown.cancelled() => return Err(QueryError::ServerClosed),
                guard = self.acceptor.lock() => guard,
            };
            if shutdown.is_cancelled() {
                return Err(QueryError::ServerClosed);
            }
            let acceptor = guard.as_mut().ok_or(QueryError::ServerClosed)?;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(QueryError::ServerClosed),
                accepted = acceptor.accept() => accepted,
            }
        };

        let connection = match timeout {
            Some(bound) => match tokio::time::timeout(bound, waiting).await {
                Ok(result) => result?,
                Err(_) => return Err(QueryError::timeout(bound)),
            },
            None => waiting.await?,
        };

        self.connections.insert(connection.id(), connection.close_handle());
        tracing::info!("Accepted {} connection {}", connection.protocol(), connection.id());
        Ok(connection)
    }

    /// Accepts connections until the server is freed, running one
    /// [`ServerSession`] task per connection.
    pub async fn serve<P: StreamPolicy>(
        &self,
        policy: P,
        sink: mpsc::Sender<ReceivedBuffer>,
    ) -> Result<()> {
        let policy = Arc::new(policy);
        loop {
            let connection = match self.accept(None).await {
                Ok(connection) => connection,
                Err(QueryError::ServerClosed) => {
                    tracing::info!("Accept loop stopped");
                    return Ok(());
                }
                Err(e) if e.is_recoverable() => continue,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    return Err(e);
                }
            };

            let session = ServerSession::new(connection, policy.clone(), self.config.io_timeout)
                .with_idle_limit(self.config.idle_limit);
            let sink = sink.clone();
            tokio::spawn(async move {
                session.run(sink).await;
            });
        }
    }

    /// Releases the listener and closes every accepted connection.
    ///
    /// Safe to call repeatedly, before setup, or after a failed setup.
    pub async fn free(&self) -> Result<()> {
        if let Some(shutdown) = self.binding().shutdown.as_ref() {
            shutdown.cancel();
        }

        let released = self.acceptor.lock().await.take();
        if let Some(mut acceptor) = released {
            acceptor.shutdown();
            let closed = self.connections.close_all();
            tracing::info!("Server freed, closed {} connections", closed);
        } else {
            self.connections.close_all();
        }

        let mut binding = self.binding();
        binding.protocol = None;
        binding.local_addr = None;
        binding.port = 0;
        Ok(())
    }

    /// Transport the server is set up for.
    pub fn protocol(&self) -> Option<Protocol> {
        self.binding().protocol
    }

    /// Bound socket address, `None` when not bound or behind a broker.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.binding().local_addr
    }

    /// Bound port (the broker port for MQTT), 0 when not set up.
    pub fn current_port(&self) -> u16 {
        self.binding().port
    }

    /// Forces one accepted connection closed.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        self.connections.close(id)
    }

    pub fn open_connections(&self) -> usize {
        self.connections.open_count()
    }

    /// Publishes the layout the consumer expects.
    pub fn set_sink_config(&self, layout: Option<TensorLayout>) {
        self.sink_config.set(layout);
    }

    pub fn sink_config(&self) -> Option<TensorLayout> {
        self.sink_config.get()
    }

    /// Shared handle to the sink config, e.g. for
    /// [`MatchSinkConfig`](crate::MatchSinkConfig).
    pub fn sink_config_handle(&self) -> SinkConfig {
        self.sink_config.clone()
    }

    fn binding(&self) -> std::sync::MutexGuard<'_, Binding> {
        self.binding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for QueryServer {
    fn default() -> Self {
        Self::init()
    }
}
