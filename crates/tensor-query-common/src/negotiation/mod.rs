//! Per-stream negotiation
//!
//! Every stream starts with a handshake before payload flows:
//!
//! ```text
//! Idle --START--> AwaitingDecision --APPROVE--> Streaming --END--> Closed
//!                        |                        |  ^
//!                        +--DENY--> Closed        +--+ DATA
//! ```
//!
//! [`Negotiation`] is a pure state machine: it validates each command a peer
//! sends or receives and reports the transition, but performs no I/O. The
//! same table serves both ends; [`Role`] picks which direction each command
//! must travel in.
//!
//! A START while streaming renegotiates the stream: the metadata is replaced
//! and the machine goes back to waiting for a decision. A graceful END closes
//! the stream but not the connection, so a fresh machine may start on it.

mod assembler;

pub use assembler::{StreamAssembler, TensorBuffer};


use std::fmt;

use crate::protocol::error::{QueryError, Result};
use crate::protocol::{Command, CommandKind, DataInfo, Envelope, Protocol};

/// Which end of the stream a machine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Proposes streams and pushes data (the client).
    Sender,
    /// Admits or rejects streams and consumes data (the server).
    Receiver,
}

/// A receiver's answer to a proposed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn is_approved(self) -> bool {
        matches!(self, Decision::Approve)
    }

    /// The envelope announcing this decision.
    pub fn envelope(self, protocol: Protocol) -> Envelope {
        match self {
            Decision::Approve => Envelope::approve(protocol),
            Decision::Deny => Envelope::deny(protocol),
        }
    }
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// TRANSFER_END after streaming
    Ended,
    /// The receiver answered TRANSFER_DENY
    Denied,
    /// A command arrived or was attempted out of order
    Violation,
    /// The transport failed
    Transport,
    /// This side closed the connection
    Local,
    /// The peer closed the connection
    PeerClosed,
    /// A connectionless peer stayed silent past the idle limit
    Idle,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Ended => "ended",
            CloseReason::Denied => "denied",
            CloseReason::Violation => "protocol violation",
            CloseReason::Transport => "transport error",
            CloseReason::Local => "closed locally",
            CloseReason::PeerClosed => "closed by peer",
            CloseReason::Idle => "idle limit reached",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingDecision,
    Streaming,
    Closed(CloseReason),
}

impl NegotiationState {
    pub fn is_closed(self) -> bool {
        matches!(self, NegotiationState::Closed(_))
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => f.write_str("idle"),
            NegotiationState::AwaitingDecision => f.write_str("awaiting decision"),
            NegotiationState::Streaming => f.write_str("streaming"),
            NegotiationState::Closed(reason) => write!(f, "closed ({})", reason),
        }
    }
}

/// A state change reported by [`Negotiation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: NegotiationState,
    pub to: NegotiationState,
}

impl Transition {
    /// A START that replaced the metadata of a running stream.
    pub fn is_renegotiation(&self) -> bool {
        self.from == NegotiationState::Streaming && self.to == NegotiationState::AwaitingDecision
    }
}

/// Direction a command travels relative to the machine's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone)]
pub struct Negotiation {
    role: Role,
    state: NegotiationState,
    info: Option<DataInfo>,
}

impl Negotiation {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            info: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Metadata of the current (or last) proposed stream.
    pub fn info(&self) -> Option<&DataInfo> {
        self.info.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.state == NegotiationState::Streaming
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Only a gracefully ended stream leaves its connection usable.
    pub fn can_restart(&self) -> bool {
        self.state == NegotiationState::Closed(CloseReason::Ended)
    }

    /// Validates a command this side is about to put on the wire.
    ///
    /// Sending on a closed stream is `ConnectionClosed` and leaves the
    /// machine as it is.
    pub fn on_send(&mut self, command: &Command) -> Result<Transition> {
        if self.state.is_closed() {
            return Err(QueryError::ConnectionClosed);
        }
        self.apply(command, Direction::Outgoing)
    }

    /// Validates a command that arrived from the peer.
    pub fn on_receive(&mut self, command: &Command) -> Result<Transition> {
        if self.state.is_closed() {
            return Err(QueryError::ProtocolViolation {
                state: self.state,
                command: command.kind(),
            });
        }
        self.apply(command, Direction::Incoming)
    }

    /// Forces the stream closed, e.g. after a transport error. Closing an
    /// already closed stream keeps its original reason.
    pub fn close(&mut self, reason: CloseReason) -> Transition {
        let from = self.state;
        if !from.is_closed() {
            self.state = NegotiationState::Closed(reason);
        }
        Transition {
            from,
            to: self.state,
        }
    }

    fn apply(&mut self, command: &Command, direction: Direction) -> Result<Transition> {
        use NegotiationState::*;

        // Who originates each command: the sender proposes, streams and ends,
        // the receiver decides.
        let from_sender = match command.kind() {
            CommandKind::TransferStart
            | CommandKind::TransferData
            | CommandKind::TransferEnd => true,
            CommandKind::TransferApprove | CommandKind::TransferDeny => false,
        };
        let own_command = direction == Direction::Outgoing;
        let direction_ok = from_sender == (own_command == (self.role == Role::Sender));

        let next = match (self.state, command) {
            _ if !direction_ok => None,
            (Idle | Streaming, Command::TransferStart(info)) => {
                self.info = Some(info.clone());
                Some(AwaitingDecision)
            }
            (AwaitingDecision, Command::TransferApprove) => Some(Streaming),
            (AwaitingDecision, Command::TransferDeny) => Some(Closed(CloseReason::Denied)),
            (Streaming, Command::TransferData(_)) => Some(Streaming),
            (Streaming, Command::TransferEnd) => Some(Closed(CloseReason::Ended)),
            _ => None,
        };

        let from = self.state;
        match next {
            Some(to) => {
                self.state = to;
                Ok(Transition { from, to })
            }
            None => {
                tracing::warn!(
                    "{} {} while {} violates the negotiation",
                    match direction {
                        Direction::Outgoing => "Sending",
                        Direction::Incoming => "Receiving",
                    },
                    command.kind(),
                    from
                );
                self.state = Closed(CloseReason::Violation);
                Err(QueryError::ProtocolViolation {
                    state: from,
                    command: command.kind(),
                })
            }
        }
    }
}
