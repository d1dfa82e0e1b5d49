use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::endpoint::Endpoint;
use crate::protocol::error::{QueryError, Result};
use crate::protocol::{Envelope, Protocol};
use crate::transport::codec::CommandCodec;
use crate::transport::{with_timeout, Transport};

/// In-process transport: two connected ends exchanging encoded envelopes.
///
/// Envelopes go through the same codec and unit-size checks as the socket
/// bindings, so sessions can be tested without a network. Closing either end
/// makes the other one see `ConnectionClosed`.
pub struct MemoryTransport {
    protocol: Protocol,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    /// Two connected ends tagged with `protocol`.
    pub fn pair(protocol: Protocol) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                protocol,
                outbound: Some(a_tx),
                inbound: b_rx,
            },
            Self {
                protocol,
                outbound: Some(b_tx),
                inbound: a_rx,
            },
        )
    }
}

impl Transport for MemoryTransport {
    async fn connect(endpoint: &Endpoint, _timeout: Duration) -> Result<Self> {
        Err(QueryError::UnsupportedTransport(format!(
            "in-process transport cannot open {}",
            endpoint
        )))
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn is_open(&self) -> bool {
        self.outbound.is_some()
    }

    async fn send(&mut self, envelope: &Envelope, _timeout: Duration) -> Result<()> {
        let unit = CommandCodec::encode_unit(envelope, self.protocol.max_unit_size())?;
        let outbound = self.outbound.as_ref().ok_or(QueryError::ConnectionClosed)?;
        outbound.send(unit).map_err(|_| QueryError::ConnectionClosed)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Envelope> {
        if self.outbound.is_none() {
            return Err(QueryError::ConnectionClosed);
        }
        let unit = with_timeout(timeout, async {
            self.inbound.recv().await.ok_or(QueryError::ConnectionClosed)
        })
        .await?;
        CommandCodec::decode(unit)
    }

    async fn close(&mut self) -> Result<()> {
        self.outbound = None;
        self.inbound.close();
        Ok(())
    }
}
