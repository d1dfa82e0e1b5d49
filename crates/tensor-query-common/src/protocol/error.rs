use thiserror::Error;

use crate::negotiation::NegotiationState;
use crate::protocol::command::CommandKind;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation would block")]
    WouldBlock,

    #[error("Malformed command: {0}")]
    Malformed(String),

    #[error("Failed to bind: {0}")]
    BindFailed(String),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Invalid address: {0}")]
    AddressInvalid(String),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Server closed")]
    ServerClosed,

    #[error("Server is not set up")]
    NotConfigured,

    #[error("Protocol violation: {command} is not allowed while {state}")]
    ProtocolViolation {
        state: NegotiationState,
        command: CommandKind,
    },

    #[error("Payload too large: {size} bytes (max {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Wrong payload: {actual} does not carry {expected} payload")]
    WrongPayload {
        expected: CommandKind,
        actual: CommandKind,
    },

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueryError {
    /// Builds a `Timeout` from the bound that expired.
    pub fn timeout(bound: std::time::Duration) -> Self {
        QueryError::Timeout(bound.as_millis() as u64)
    }

    /// Whether the caller may retry the same operation on the same connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QueryError::Timeout(_) | QueryError::WouldBlock)
    }
}

impl From<rumqttc::ClientError> for QueryError {
    fn from(err: rumqttc::ClientError) -> Self {
        // The request channel only fails once the event loop is gone.
        tracing::debug!("MQTT request rejected: {}", err);
        QueryError::ConnectionClosed
    }
}

impl From<rumqttc::ConnectionError> for QueryError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        QueryError::Mqtt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
