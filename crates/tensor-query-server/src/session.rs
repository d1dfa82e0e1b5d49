//! Receiver side of one accepted connection.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tensor_query_common::{
    CloseReason, Command, ConnectionId, DataInfo, Decision, Negotiation, NegotiationState,
    QueryConnection, QueryError, Result, Role, StreamAssembler, TensorBuffer, Transport,
};

use crate::policy::StreamPolicy;

/// A reconstructed buffer and the connection it arrived on.
#[derive(Debug, Clone)]
pub struct ReceivedBuffer {
    pub connection: ConnectionId,
    pub buffer: TensorBuffer,
}

/// What one step of a [`ServerSession`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A START was answered.
    Negotiated { info: DataInfo, decision: Decision },
    /// A DATA chunk completed zero or more buffers.
    Buffers(Vec<TensorBuffer>),
    /// The stream ended; the connection stays open for a new START.
    Ended,
    /// The connection is released.
    Closed(CloseReason),
}

/// Drives the receiver-side negotiation for one connection.
///
/// Each START is put to the [`StreamPolicy`] and answered with APPROVE or
/// DENY. DATA chunks are reassembled into [`TensorBuffer`]s. After a graceful
/// END a fresh negotiation starts on the same connection; a denial, a
/// violation or a transport error releases the connection.
///
/// UDP and MQTT peers can vanish without a trace, so on those transports
/// [`run`](Self::run) also releases a connection that stays idle past the
/// idle limit.
pub struct ServerSession<P> {
    connection: QueryConnection,
    policy: Arc<P>,
    machine: Negotiation,
    assembler: StreamAssembler,
    io_timeout: Duration,
    idle_limit: Option<Duration>,
}

impl<P: StreamPolicy> ServerSession<P> {
    pub fn new(connection: QueryConnection, policy: Arc<P>, io_timeout: Duration) -> Self {
        Self {
            connection,
            policy,
            machine: Negotiation::new(Role::Receiver),
            assembler: StreamAssembler::new(),
            io_timeout,
            idle_limit: None,
        }
    }

    pub fn with_idle_limit(mut self, limit: Option<Duration>) -> Self {
        self.idle_limit = limit;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn state(&self) -> NegotiationState {
        self.machine.state()
    }

    pub fn connection(&self) -> &QueryConnection {
        &self.connection
    }

    /// Processes the next command from the peer.
    ///
    /// A `Timeout` while idle leaves the session usable; every other error
    /// has already released the connection when it is returned.
    pub async fn next_event(&mut self) -> Result<SessionEvent> {
        if self.machine.can_restart() {
            self.machine = Negotiation::new(Role::Receiver);
        }
        if let NegotiationState::Closed(reason) = self.machine.state() {
            return Ok(SessionEvent::Closed(reason));
        }

        let idle = self.machine.state() == NegotiationState::Idle;
        let envelope = match self.connection.receive(self.io_timeout).await {
            Ok(envelope) => envelope,
            Err(e) if idle && e.is_recoverable() => return Err(e),
            Err(QueryError::ConnectionClosed) if idle => {
                self.release(CloseReason::PeerClosed).await;
                return Ok(SessionEvent::Closed(CloseReason::PeerClosed));
            }
            Err(e) => {
                self.release(CloseReason::Transport).await;
                return Err(e);
            }
        };

        let transition = match self.machine.on_receive(envelope.command()) {
            Ok(transition) => transition,
            Err(e) => {
                self.release(CloseReason::Violation).await;
                return Err(e);
            }
        };

        match envelope.into_command() {
            Command::TransferStart(info) => {
                let id = self.id();
                if transition.is_renegotiation() {
                    tracing::info!("Connection {} renegotiating stream as {}", id, info.layout);
                }
                let decision = match self.assembler.start(info.clone()) {
                    Ok(()) => self.policy.decide(id, &info),
                    Err(e) => {
                        tracing::warn!("Connection {} proposed an unusable stream: {}", id, e);
                        Decision::Deny
                    }
                };
                self.respond(decision).await?;
                Ok(SessionEvent::Negotiated { info, decision })
            }
            Command::TransferData(chunk) => match self.assembler.push(chunk) {
                Ok(buffers) => Ok(SessionEvent::Buffers(buffers)),
                Err(e) => {
                    self.release(CloseReason::Violation).await;
                    Err(e)
                }
            },
            Command::TransferEnd => {
                self.assembler.finish();
                Ok(SessionEvent::Ended)
            }
            other => {
                // The receiver machine never admits a decision from the peer.
                self.release(CloseReason::Violation).await;
                Err(QueryError::ProtocolViolation {
                    state: transition.from,
                    command: other.kind(),
                })
            }
        }
    }

    /// Runs the session to completion, forwarding buffers to `sink`.
    pub async fn run(mut self, sink: mpsc::Sender<ReceivedBuffer>) -> CloseReason {
        let id = self.id();
        let mut last_heard = Instant::now();
        loop {
            let event = match self.next_event().await {
                Ok(event) => {
                    last_heard = Instant::now();
                    event
                }
                Err(e) if e.is_recoverable() && !self.machine.is_closed() => {
                    if self.idle_expired(last_heard) {
                        tracing::info!("Connection {} idle since {:?}", id, last_heard.elapsed());
                        self.release(CloseReason::Idle).await;
                        return CloseReason::Idle;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!("Connection {} failed: {}", id, e);
                    return match self.machine.state() {
                        NegotiationState::Closed(reason) => reason,
                        _ => CloseReason::Transport,
                    };
                }
            };

            match event {
                SessionEvent::Negotiated { info, decision } => {
                    tracing::info!("Connection {} stream {}: {:?}", id, info.layout, decision);
                }
                SessionEvent::Buffers(buffers) => {
                    for buffer in buffers {
                        let received = ReceivedBuffer {
                            connection: id,
                            buffer,
                        };
                        if sink.send(received).await.is_err() {
                            tracing::warn!("Buffer consumer is gone, closing connection {}", id);
                            self.release(CloseReason::Local).await;
                            return CloseReason::Local;
                        }
                    }
                }
                SessionEvent::Ended => tracing::debug!("Connection {} stream ended", id),
                SessionEvent::Closed(reason) => {
                    tracing::info!("Connection {} closed: {}", id, reason);
                    return reason;
                }
            }
        }
    }

    /// Closes the connection and the stream.
    pub async fn close(&mut self) {
        self.release(CloseReason::Local).await;
    }

    async fn respond(&mut self, decision: Decision) -> Result<()> {
        let envelope = decision.envelope(self.connection.protocol());
        if let Err(e) = self.machine.on_send(envelope.command()) {
            self.release(CloseReason::Violation).await;
            return Err(e);
        }
        if let Err(e) = self.connection.send(&envelope, self.io_timeout).await {
            self.release(CloseReason::Transport).await;
            return Err(e);
        }
        if decision == Decision::Deny {
            self.release(CloseReason::Denied).await;
        }
        Ok(())
    }

    /// Stream transports report a departed peer themselves.
    fn idle_expired(&self, last_heard: Instant) -> bool {
        match self.idle_limit {
            Some(limit) if !self.connection.protocol().is_stream() => {
                last_heard.elapsed() >= limit
            }
            _ => false,
        }
    }

    async fn release(&mut self, reason: CloseReason) {
        self.machine.close(reason);
        self.assembler.finish();
        if let Err(e) = self.connection.close().await {
            tracing::debug!("Closing connection {} failed: {}", self.id(), e);
        }
    }
}
