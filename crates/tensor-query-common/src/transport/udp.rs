use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::protocol::error::{QueryError, Result};
use crate::protocol::{Envelope, Protocol, MAX_DATAGRAM_SIZE};
use crate::transport::codec::CommandCodec;
use crate::transport::{expect_protocol, map_io_error, with_timeout, Transport};

/// Datagrams buffered per server-side connection before new ones are dropped.
const ROUTE_CAPACITY: usize = 1024;

/// Inbox of one server-side link. `serial` tells successive links of the
/// same peer apart.
#[derive(Clone)]
struct Route {
    serial: u64,
    inbox: mpsc::Sender<Bytes>,
}

/// Per-peer routes of a bound server socket.
type Routes = Arc<Mutex<HashMap<SocketAddr, Route>>>;

enum Inbound {
    /// Client side: the socket is connected to exactly one peer.
    Socket,
    /// Server side: the dispatcher forwards this peer's datagrams.
    Routed {
        datagrams: mpsc::Receiver<Bytes>,
        serial: u64,
        routes: Routes,
    },
}

/// UDP binding for tensor query.
///
/// One datagram carries exactly one envelope, so there is no length prefix.
/// Envelopes larger than [`MAX_DATAGRAM_SIZE`] are rejected instead of
/// being fragmented.
pub struct UdpLink {
    socket: Option<Arc<UdpSocket>>,
    peer: SocketAddr,
    inbound: Inbound,
}

impl UdpLink {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn socket(&self) -> Result<&Arc<UdpSocket>> {
        self.socket.as_ref().ok_or(QueryError::ConnectionClosed)
    }

    /// Removes this link's route, leaving a newer route of the same peer alone.
    fn deregister(&mut self) {
        if let Inbound::Routed {
            datagrams,
            serial,
            routes,
        } = &mut self.inbound
        {
            datagrams.close();
            let mut routes = lock(routes);
            if routes
                .get(&self.peer)
                .is_some_and(|current| current.serial == *serial)
            {
                routes.remove(&self.peer);
            }
        }
    }
}

impl Transport for UdpLink {
    /// Binds an ephemeral socket and connects it to the peer.
    ///
    /// There is no handshake; the first reply to a START is the caller's
    /// acknowledgment and is bounded by the caller's receive timeout.
    async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        expect_protocol(endpoint, Protocol::Udp)?;
        let address = endpoint.address();

        let peer = with_timeout(timeout, async {
            tokio::net::lookup_host(&address)
                .await
                .map_err(|e| QueryError::AddressInvalid(format!("'{}': {}", address, e)))?
                .next()
                .ok_or_else(|| {
                    QueryError::AddressInvalid(format!("'{}' resolved to no addresses", address))
                })
        })
        .await?;

        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket
            .connect(peer)
            .await
            .map_err(|e| QueryError::AddressInvalid(format!("{}: {}", peer, e)))?;

        tracing::debug!("UDP socket {:?} connected to {}", socket.local_addr().ok(), peer);

        Ok(Self {
            socket: Some(Arc::new(socket)),
            peer,
            inbound: Inbound::Socket,
        })
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    async fn send(&mut self, envelope: &Envelope, timeout: Duration) -> Result<()> {
        let datagram = CommandCodec::encode_unit(envelope, MAX_DATAGRAM_SIZE)?;
        let socket = self.socket()?;
        let peer = self.peer;
        let connected = matches!(self.inbound, Inbound::Socket);

        let sent = with_timeout(timeout, async {
            let result = if connected {
                socket.send(&datagram).await
            } else {
                socket.send_to(&datagram, peer).await
            };
            result.map_err(|e| map_io_error(e, timeout, "sending datagram"))
        })
        .await?;

        if sent != datagram.len() {
            return Err(QueryError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, datagram.len()),
            )));
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Envelope> {
        let socket = self.socket.clone().ok_or(QueryError::ConnectionClosed)?;

        let datagram = match &mut self.inbound {
            Inbound::Socket => {
                with_timeout(timeout, async {
                    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                    let len = socket
                        .recv(&mut buf)
                        .await
                        .map_err(|e| map_io_error(e, timeout, "receiving datagram"))?;
                    buf.truncate(len);
                    Ok(Bytes::from(buf))
                })
                .await?
            }
            Inbound::Routed { datagrams, .. } => {
                with_timeout(timeout, async {
                    datagrams.recv().await.ok_or(QueryError::ConnectionClosed)
                })
                .await?
            }
        };

        CommandCodec::decode(datagram)
    }

    async fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            self.deregister();
        }
        Ok(())
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        if self.socket.is_some() {
            self.deregister();
        }
    }
}

/// Server side of UDP: one bound socket shared by every peer.
///
/// A dispatcher task reads datagrams and routes them by source address. The
/// first datagram from an unknown peer creates a new [`UdpLink`], which is
/// handed out by [`accept`](Self::accept).
pub struct UdpAcceptor {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<UdpLink>,
    routes: Routes,
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl UdpAcceptor {
    /// Binds the server socket and starts the dispatcher.
    ///
    /// `backlog` bounds how many new peers may wait for `accept`.
    pub async fn bind(host: &str, port: u16, backlog: usize) -> Result<Self> {
        let address = Endpoint::udp(host, port).address();
        let socket = UdpSocket::bind(&address)
            .await
            .map_err(|e| QueryError::BindFailed(format!("{}: {}", address, e)))?;
        let local_addr = socket.local_addr()?;

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (accept_tx, incoming) = mpsc::channel(backlog.max(1));
        let shutdown = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatch(
            Arc::new(socket),
            routes.clone(),
            accept_tx,
            shutdown.clone(),
        ));

        tracing::debug!("UDP acceptor bound to {}", local_addr);

        Ok(Self {
            local_addr,
            incoming,
            routes,
            shutdown,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the first datagram of a new peer.
    pub async fn accept(&mut self) -> Result<UdpLink> {
        self.incoming.recv().await.ok_or(QueryError::ServerClosed)
    }

    /// Stops the dispatcher; every routed link then reports `ConnectionClosed`.
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.incoming.close();
        lock(&self.routes).clear();
    }
}

impl Drop for UdpAcceptor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.dispatcher.abort();
    }
}

async fn dispatch(
    socket: Arc<UdpSocket>,
    routes: Routes,
    accept_tx: mpsc::Sender<UdpLink>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut next_serial = 0u64;

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here; the socket stays usable.
                tracing::debug!("UDP receive error: {}", e);
                continue;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);

        let existing = lock(&routes).get(&peer).cloned();
        let route = match existing {
            Some(route) => route,
            None => {
                let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
                let route = Route {
                    serial: next_serial,
                    inbox: tx,
                };
                next_serial += 1;
                let link = UdpLink {
                    socket: Some(socket.clone()),
                    peer,
                    inbound: Inbound::Routed {
                        datagrams: rx,
                        serial: route.serial,
                        routes: routes.clone(),
                    },
                };
                lock(&routes).insert(peer, route.clone());
                match accept_tx.try_send(link) {
                    Ok(()) => tracing::debug!("New UDP peer {}", peer),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Dropping the link removes its route again.
                        tracing::warn!("Accept backlog full, dropping datagram from {}", peer);
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
                route
            }
        };

        match route.inbox.try_send(datagram) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Connection inbox for {} full, dropping datagram", peer);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let mut routes = lock(&routes);
                if routes.get(&peer).is_some_and(|r| r.serial == route.serial) {
                    routes.remove(&peer);
                }
            }
        }
    }

    tracing::debug!("UDP dispatcher stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
