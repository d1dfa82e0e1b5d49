//! Tensor Query Common Types and Transport
//!
//! This crate provides the protocol definitions, command codec, transport
//! bindings and negotiation state machine shared by the tensor query server
//! and client.
//!
//! # Overview
//!
//! Tensor query lets one process push live, typed tensor buffers to remote
//! sinks. Every stream is negotiated before any payload flows:
//!
//! ```text
//! client                      server
//!   | ---- TRANSFER_START ----> |   (tensor layout + timing)
//!   | <--- TRANSFER_APPROVE --- |   (or TRANSFER_DENY, connection released)
//!   | ---- TRANSFER_DATA -----> |   (one or more chunks)
//!   | ---- TRANSFER_END ------> |
//! ```
//!
//! # Components
//!
//! - [`protocol`] - Tensor layout, command envelope and error types
//! - [`transport`] - Command codec plus TCP, UDP and MQTT bindings
//! - [`negotiation`] - Per-stream state machine and chunk reassembly
//! - [`stats`] - Per-connection transfer counters
//!
//! # Wire Format
//!
//! ```text
//! [command: u8][protocol: u8][payload]
//! ```
//!
//! Stream transports prefix every envelope with a 4-byte big-endian length.
//! Datagram and publish/subscribe transports use the unit boundary instead.

pub mod endpoint;
pub mod negotiation;
pub mod protocol;
pub mod stats;
pub mod transport;

pub use endpoint::{Endpoint, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TIMEOUT};
pub use negotiation::{
    CloseReason, Decision, Negotiation, NegotiationState, Role, StreamAssembler, TensorBuffer,
    Transition,
};
pub use protocol::*;
pub use stats::{StatsSnapshot, TransferStats};
pub use transport::{CloseHandle, ConnectionId, QueryConnection, Transport};
