use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::error::{QueryError, Result};
use crate::protocol::tensor::TensorLayout;

/// Largest frame accepted on a stream transport and largest declared DATA size (64 MB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest envelope published on the MQTT broker (1 MB).
pub const MAX_MQTT_PAYLOAD: usize = 1024 * 1024;

/// Bytes a DATA envelope spends on its header: command, protocol and size.
pub const DATA_HEADER_LEN: usize = 1 + 1 + 8;

/// Transport a connection runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0,
    Udp = 1,
    Mqtt = 2,
}

impl Protocol {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Protocol::Tcp),
            1 => Some(Protocol::Udp),
            2 => Some(Protocol::Mqtt),
            _ => None,
        }
    }

    /// Stream transports need a length prefix to find frame boundaries.
    pub fn is_stream(self) -> bool {
        matches!(self, Protocol::Tcp)
    }

    /// Largest encoded envelope one transport unit can carry.
    pub fn max_unit_size(self) -> usize {
        match self {
            Protocol::Tcp => MAX_PAYLOAD_SIZE,
            Protocol::Udp => MAX_DATAGRAM_SIZE,
            Protocol::Mqtt => MAX_MQTT_PAYLOAD,
        }
    }

    /// Largest DATA chunk that still fits in one transport unit.
    pub fn max_chunk_size(self) -> usize {
        self.max_unit_size() - DATA_HEADER_LEN
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "mqtt" => Ok(Protocol::Mqtt),
            _ => Err(QueryError::UnsupportedTransport(s.to_string())),
        }
    }
}

/// The only message types legal on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    TransferStart = 0,
    TransferData = 1,
    TransferEnd = 2,
    TransferApprove = 3,
    TransferDeny = 4,
}

impl CommandKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CommandKind::TransferStart),
            1 => Some(CommandKind::TransferData),
            2 => Some(CommandKind::TransferEnd),
            3 => Some(CommandKind::TransferApprove),
            4 => Some(CommandKind::TransferDeny),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandKind::TransferStart => "TRANSFER_START",
            CommandKind::TransferData => "TRANSFER_DATA",
            CommandKind::TransferEnd => "TRANSFER_END",
            CommandKind::TransferApprove => "TRANSFER_APPROVE",
            CommandKind::TransferDeny => "TRANSFER_DENY",
        })
    }
}

/// Stream metadata carried by `TRANSFER_START`.
///
/// Holds the tensor layout plus the timing a receiver needs to rebuild buffer
/// timestamps without a separate clock sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataInfo {
    pub layout: TensorLayout,
    /// Pipeline-relative origin timestamp
    pub base_time: i64,
    /// Clock value when the buffer was sent
    pub sent_time: i64,
    pub duration: u64,
    pub dts: u64,
    pub pts: u64,
}

impl DataInfo {
    pub fn new(layout: TensorLayout) -> Self {
        Self {
            layout,
            ..Default::default()
        }
    }

    pub fn with_base_time(mut self, base_time: i64) -> Self {
        self.base_time = base_time;
        self
    }

    pub fn with_sent_time(mut self, sent_time: i64) -> Self {
        self.sent_time = sent_time;
        self
    }

    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_timestamps(mut self, dts: u64, pts: u64) -> Self {
        self.dts = dts;
        self.pts = pts;
        self
    }

    /// Bytes one complete buffer of this stream occupies.
    pub fn expected_size(&self) -> Option<u64> {
        self.layout.total_byte_size()
    }
}

/// A command and its payload.
///
/// Only `TransferStart` and `TransferData` carry a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TransferStart(DataInfo),
    TransferData(Bytes),
    TransferEnd,
    TransferApprove,
    TransferDeny,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::TransferStart(_) => CommandKind::TransferStart,
            Command::TransferData(_) => CommandKind::TransferData,
            Command::TransferEnd => CommandKind::TransferEnd,
            Command::TransferApprove => CommandKind::TransferApprove,
            Command::TransferDeny => CommandKind::TransferDeny,
        }
    }
}

/// One wire-level message: a command tagged with the transport it travels on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    protocol: Protocol,
    command: Command,
}

impl Envelope {
    pub fn new(protocol: Protocol, command: Command) -> Self {
        Self { protocol, command }
    }

    pub fn start(protocol: Protocol, info: DataInfo) -> Self {
        Self::new(protocol, Command::TransferStart(info))
    }

    pub fn data(protocol: Protocol, chunk: impl Into<Bytes>) -> Self {
        Self::new(protocol, Command::TransferData(chunk.into()))
    }

    pub fn end(protocol: Protocol) -> Self {
        Self::new(protocol, Command::TransferEnd)
    }

    pub fn approve(protocol: Protocol) -> Self {
        Self::new(protocol, Command::TransferApprove)
    }

    pub fn deny(protocol: Protocol) -> Self {
        Self::new(protocol, Command::TransferDeny)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn into_command(self) -> Command {
        self.command
    }

    /// Stream metadata of a `TRANSFER_START`; any other command is an error.
    pub fn data_info(&self) -> Result<&DataInfo> {
        match &self.command {
            Command::TransferStart(info) => Ok(info),
            other => Err(QueryError::WrongPayload {
                expected: CommandKind::TransferStart,
                actual: other.kind(),
            }),
        }
    }

    /// Chunk of a `TRANSFER_DATA`; any other command is an error.
    pub fn chunk(&self) -> Result<&Bytes> {
        match &self.command {
            Command::TransferData(chunk) => Ok(chunk),
            other => Err(QueryError::WrongPayload {
                expected: CommandKind::TransferData,
                actual: other.kind(),
            }),
        }
    }
}
