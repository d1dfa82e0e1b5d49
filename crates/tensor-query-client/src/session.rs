//! Sender side of one connection.

use bytes::Bytes;
use std::time::Duration;

use tensor_query_common::{
    CloseReason, Command, ConnectionId, DataInfo, Decision, Envelope, Negotiation,
    NegotiationState, QueryConnection, QueryError, Result, Role, StatsSnapshot, TensorBuffer,
    Transport,
};

/// Drives the sender-side negotiation over one connection.
///
/// A stream is `start` → `send_data`* → `end`. After `end` the connection
/// stays open and the next `start` begins a new stream. A denial, a protocol
/// violation or any transport error closes the connection, after which every
/// call returns `ConnectionClosed`.
pub struct ClientSession<T: Transport = QueryConnection> {
    connection: T,
    machine: Negotiation,
    io_timeout: Duration,
}

impl<T: Transport> ClientSession<T> {
    pub fn new(connection: T, io_timeout: Duration) -> Self {
        Self {
            connection,
            machine: Negotiation::new(Role::Sender),
            io_timeout,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.machine.state()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn connection(&self) -> &T {
        &self.connection
    }

    /// Proposes a stream and waits for the server's decision.
    ///
    /// Called while streaming, this renegotiates the stream. A denial closes
    /// the connection.
    pub async fn start(&mut self, info: DataInfo) -> Result<Decision> {
        let protocol = self.connection.protocol();
        self.transmit(&Envelope::start(protocol, info)).await?;

        let reply = match self.connection.receive(self.io_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                self.release(CloseReason::Transport).await;
                return Err(e);
            }
        };
        if let Err(e) = self.machine.on_receive(reply.command()) {
            self.release(CloseReason::Violation).await;
            return Err(e);
        }

        match reply.command() {
            Command::TransferApprove => {
                tracing::debug!("Stream approved");
                Ok(Decision::Approve)
            }
            _ => {
                tracing::info!("Stream denied by server");
                self.release(CloseReason::Denied).await;
                Ok(Decision::Deny)
            }
        }
    }

    /// Sends payload bytes, split into chunks that fit one transport unit.
    pub async fn send_data(&mut self, data: impl Into<Bytes>) -> Result<()> {
        let mut data = data.into();
        let max_chunk = self.connection.protocol().max_chunk_size();
        let protocol = self.connection.protocol();

        loop {
            let chunk = data.split_to(data.len().min(max_chunk));
            self.transmit(&Envelope::data(protocol, chunk)).await?;
            if data.is_empty() {
                return Ok(());
            }
        }
    }

    /// Ends the stream. The connection stays open.
    pub async fn end(&mut self) -> Result<()> {
        let protocol = self.connection.protocol();
        self.transmit(&Envelope::end(protocol)).await
    }

    /// Sends one complete buffer as its own stream: START, DATA, END.
    ///
    /// Returns the server's decision; nothing but START is sent on a denial.
    pub async fn push(&mut self, buffer: TensorBuffer) -> Result<Decision> {
        match buffer.info.expected_size() {
            Some(size) if size == buffer.data.len() as u64 => {}
            expected => {
                return Err(QueryError::Malformed(format!(
                    "buffer of {} bytes does not match layout {} ({:?} bytes)",
                    buffer.data.len(),
                    buffer.info.layout,
                    expected
                )))
            }
        }

        let decision = self.start(buffer.info).await?;
        if decision.is_approved() {
            self.send_data(buffer.data).await?;
            self.end().await?;
        }
        Ok(decision)
    }

    /// Closes the connection. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.machine.close(CloseReason::Local);
        self.connection.close().await
    }

    /// Checks `envelope` against the machine, then puts it on the wire.
    async fn transmit(&mut self, envelope: &Envelope) -> Result<()> {
        if self.machine.can_restart() {
            self.machine = Negotiation::new(Role::Sender);
        }
        if !self.connection.is_open() {
            self.machine.close(CloseReason::PeerClosed);
            return Err(QueryError::ConnectionClosed);
        }

        match self.machine.on_send(envelope.command()) {
            Ok(_) => {}
            Err(QueryError::ConnectionClosed) => return Err(QueryError::ConnectionClosed),
            Err(e) => {
                self.release(CloseReason::Violation).await;
                return Err(e);
            }
        }

        if let Err(e) = self.connection.send(envelope, self.io_timeout).await {
            self.release(CloseReason::Transport).await;
            return Err(e);
        }
        Ok(())
    }

    async fn release(&mut self, reason: CloseReason) {
        self.machine.close(reason);
        if let Err(e) = self.connection.close().await {
            tracing::debug!("Closing connection failed: {}", e);
        }
    }
}

impl ClientSession<QueryConnection> {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.connection.stats().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor_query_common::transport::MemoryTransport;
    use tensor_query_common::{CommandKind, Protocol, TensorInfo, TensorLayout, TensorType};

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn info(dims: &[u32]) -> DataInfo {
        DataInfo::new(TensorLayout::single(TensorInfo::new(TensorType::UInt8, dims.to_vec())))
    }

    fn session(protocol: Protocol) -> (ClientSession<MemoryTransport>, MemoryTransport) {
        let (client, server) = MemoryTransport::pair(protocol);
        (ClientSession::new(client, TIMEOUT), server)
    }

    #[tokio::test]
    async fn test_approve_then_stream() {
        let (mut session, mut server) = session(Protocol::Tcp);
        server
            .send(&Envelope::approve(Protocol::Tcp), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(session.start(info(&[4])).await.unwrap(), Decision::Approve);
        assert_eq!(session.state(), NegotiationState::Streaming);
        session.send_data(vec![1u8, 2, 3, 4]).await.unwrap();
        session.end().await.unwrap();
        assert_eq!(session.state(), NegotiationState::Closed(CloseReason::Ended));
        assert!(session.is_open());

        assert_eq!(server.receive(TIMEOUT).await.unwrap().kind(), CommandKind::TransferStart);
        assert_eq!(server.receive(TIMEOUT).await.unwrap().chunk().unwrap().len(), 4);
        assert_eq!(server.receive(TIMEOUT).await.unwrap(), Envelope::end(Protocol::Tcp));
    }

    #[tokio::test]
    async fn test_deny_sends_no_data() {
        let (mut session, mut server) = session(Protocol::Tcp);
        server
            .send(&Envelope::deny(Protocol::Tcp), TIMEOUT)
            .await
            .unwrap();

        let decision = session
            .push(TensorBuffer::new(info(&[2]), vec![0u8, 0]))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny);
        assert!(!session.is_open());

        let result = session.send_data(vec![0u8; 2]).await;
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));

        // Only the START made it to the wire.
        assert_eq!(server.receive(TIMEOUT).await.unwrap().kind(), CommandKind::TransferStart);
        assert!(matches!(
            server.receive(TIMEOUT).await,
            Err(QueryError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_data_before_approve_is_rejected_locally() {
        let (mut session, mut server) = session(Protocol::Tcp);
        let result = session.send_data(vec![1u8]).await;
        assert!(matches!(result, Err(QueryError::ProtocolViolation { .. })));
        assert_eq!(session.state(), NegotiationState::Closed(CloseReason::Violation));
        assert!(matches!(
            server.receive(TIMEOUT).await,
            Err(QueryError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_missing_decision_times_out_and_closes() {
        let (mut session, _server) = session(Protocol::Udp);
        let result = session.start(info(&[1])).await;
        assert!(matches!(result, Err(QueryError::Timeout(500))));
        assert_eq!(session.state(), NegotiationState::Closed(CloseReason::Transport));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_violation() {
        let (mut session, mut server) = session(Protocol::Tcp);
        server
            .send(&Envelope::end(Protocol::Tcp), TIMEOUT)
            .await
            .unwrap();
        let result = session.start(info(&[1])).await;
        assert!(matches!(result, Err(QueryError::ProtocolViolation { .. })));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_large_data_is_chunked() {
        let (mut session, mut server) = session(Protocol::Udp);
        server
            .send(&Envelope::approve(Protocol::Udp), TIMEOUT)
            .await
            .unwrap();
        session.start(info(&[200_000])).await.unwrap();

        session.send_data(vec![1u8; 200_000]).await.unwrap();
        server.receive(TIMEOUT).await.unwrap();

        let max = Protocol::Udp.max_chunk_size();
        let mut total = 0;
        while total < 200_000 {
            let chunk = server.receive(TIMEOUT).await.unwrap();
            let len = chunk.chunk().unwrap().len();
            assert!(len <= max);
            total += len;
        }
        assert_eq!(total, 200_000);
    }

    #[tokio::test]
    async fn test_new_stream_after_end() {
        let (mut session, mut server) = session(Protocol::Tcp);
        for _ in 0..2 {
            server
                .send(&Envelope::approve(Protocol::Tcp), TIMEOUT)
                .await
                .unwrap();
            let buffer = TensorBuffer::new(info(&[3]), vec![1u8, 2, 3]);
            let decision = session.push(buffer).await.unwrap();
            assert_eq!(decision, Decision::Approve);
        }
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_push_rejects_size_mismatch() {
        let (mut session, _server) = session(Protocol::Tcp);
        let result = session.push(TensorBuffer::new(info(&[4]), vec![0u8; 3])).await;
        assert!(matches!(result, Err(QueryError::Malformed(_))));
        assert_eq!(session.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut session, _server) = session(Protocol::Tcp);
        assert!(session.close().await.is_ok());
        assert!(session.close().await.is_ok());
        let result = session.end().await;
        assert!(matches!(result, Err(QueryError::ConnectionClosed)));
    }
}
