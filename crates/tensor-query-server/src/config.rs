//! Server configuration.

use std::time::Duration;
use tensor_query_common::DEFAULT_TIMEOUT;

const DEFAULT_IDLE_LIMIT: Duration = Duration::from_secs(60);

/// Tunables of a [`QueryServer`](crate::QueryServer).
///
/// # Example
///
/// ```
/// use tensor_query_server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new()
///     .with_listen_backlog(64)
///     .with_io_timeout(Duration::from_secs(1));
/// assert_eq!(config.listen_backlog, 64);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Pending TCP connections the kernel queues before `accept`
    pub listen_backlog: u32,
    /// New UDP peers or MQTT clients queued before `accept`
    pub accept_backlog: usize,
    /// Bound for each send and receive of a session
    pub io_timeout: Duration,
    /// Bound for connecting and subscribing to the MQTT broker during setup
    pub bind_timeout: Duration,
    /// How long a UDP or MQTT peer may stay silent between streams before its
    /// connection is released; `None` keeps it forever
    pub idle_limit: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_backlog: 16,
            accept_backlog: 16,
            io_timeout: DEFAULT_TIMEOUT,
            bind_timeout: DEFAULT_TIMEOUT,
            idle_limit: Some(DEFAULT_IDLE_LIMIT),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.bind_timeout = timeout;
        self
    }

    pub fn with_idle_limit(mut self, limit: Option<Duration>) -> Self {
        self.idle_limit = limit;
        self
    }
}
