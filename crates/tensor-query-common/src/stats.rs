//! Per-connection transfer counters.
//!
//! Counters are lock-free atomics updated on the send/receive hot path and
//! read as a serializable [`StatsSnapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{Command, Envelope};

/// Commands and payload bytes moved over one connection.
#[derive(Debug, Default)]
pub struct TransferStats {
    commands_sent: AtomicU64,
    commands_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, envelope: &Envelope) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        if let Command::TransferData(chunk) = envelope.command() {
            self.bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
    }

    pub fn record_received(&self, envelope: &Envelope) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
        if let Command::TransferData(chunk) = envelope.command() {
            self.bytes_received
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
    }

    /// Payload bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransferStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub commands_sent: u64,
    pub commands_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;

    #[test]
    fn test_counts_only_data_bytes() {
        let stats = TransferStats::new();
        stats.record_sent(&Envelope::end(Protocol::Tcp));
        stats.record_sent(&Envelope::data(Protocol::Tcp, vec![0u8; 12]));
        stats.record_received(&Envelope::approve(Protocol::Tcp));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.commands_sent, 2);
        assert_eq!(snapshot.bytes_sent, 12);
        assert_eq!(snapshot.commands_received, 1);
        assert_eq!(snapshot.bytes_received, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = StatsSnapshot {
            commands_sent: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["commands_sent"], 3);
        assert_eq!(json["bytes_received"], 0);
    }
}
