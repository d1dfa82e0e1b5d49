//! Tensor Query Transport Layer
//!
//! This module provides the command codec and one binding per transport kind,
//! all behind the [`Transport`] trait.
//!
//! # Components
//!
//! - **[`CommandCodec`]** / **[`FramedCodec`]**: Envelope encoding, plus length-prefixed framing for streams
//! - **[`TcpLink`]**: Reliable stream socket
//! - **[`UdpLink`]** / **[`UdpAcceptor`]**: Datagram socket, demultiplexed by peer on the server side
//! - **[`MqttLink`]** / **[`MqttAcceptor`]**: Broker session with a per-client topic pair
//! - **[`QueryConnection`]**: The connection handle callers own, dispatching to one of the links
//! - **[`MemoryTransport`]**: In-process pair, for exercising sessions without sockets
//!
//! # Timeouts
//!
//! Every suspension point takes an explicit bound. An expired bound yields
//! `QueryError::Timeout`, never an indefinite wait.

pub mod codec;
pub mod connection;
pub mod memory;
pub mod mqtt;
pub mod tcp;
pub mod udp;

pub use codec::{CommandCodec, FramedCodec};
pub use connection::{CloseHandle, ConnectionId, QueryConnection};
pub use memory::MemoryTransport;
pub use mqtt::{MqttAcceptor, MqttLink};
pub use tcp::TcpLink;
pub use udp::{UdpAcceptor, UdpLink};


use std::future::Future;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::protocol::error::{QueryError, Result};
use crate::protocol::{Envelope, Protocol};

/// Uniform connect/send/receive/close over one transport kind.
///
/// Sessions and the server only depend on this trait. Each transport kind is
/// a separate implementing type.
pub trait Transport: Send {
    /// Open a connection to `endpoint`, waiting at most `timeout`.
    fn connect(endpoint: &Endpoint, timeout: Duration) -> impl Future<Output = Result<Self>> + Send
    where
        Self: Sized;

    /// Transport kind this connection runs on.
    fn protocol(&self) -> Protocol;

    /// Whether send/receive may still succeed.
    fn is_open(&self) -> bool;

    /// Transmit one envelope.
    fn send(
        &mut self,
        envelope: &Envelope,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next complete envelope.
    fn receive(&mut self, timeout: Duration) -> impl Future<Output = Result<Envelope>> + Send;

    /// Release the connection. Closing twice, or before opening, is a no-op.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Runs `fut`, mapping an expired bound to `QueryError::Timeout`.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::timeout(timeout)),
    }
}

/// Map IO errors to transport error variants
///
/// - Timeouts -> `Timeout`
/// - Would block -> `WouldBlock`
/// - Reset/aborted/EOF -> `ConnectionClosed`
/// - Refused -> `Refused`
/// - Other IO errors -> `Io`
pub(crate) fn map_io_error(err: std::io::Error, timeout: Duration, context: &str) -> QueryError {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut => QueryError::timeout(timeout),
        ErrorKind::WouldBlock => QueryError::WouldBlock,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => {
            tracing::debug!("{}: connection lost ({})", context, err);
            QueryError::ConnectionClosed
        }
        ErrorKind::ConnectionRefused => QueryError::Refused(format!("{}: {}", context, err)),
        _ => QueryError::Io(err),
    }
}

/// Protocol check shared by the concrete links.
pub(crate) fn expect_protocol(endpoint: &Endpoint, protocol: Protocol) -> Result<()> {
    if endpoint.protocol == protocol {
        Ok(())
    } else {
        Err(QueryError::UnsupportedTransport(format!(
            "{} link cannot open {}",
            protocol, endpoint
        )))
    }
}
