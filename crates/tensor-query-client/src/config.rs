use std::time::Duration;
use tensor_query_common::{Endpoint, Protocol, DEFAULT_TIMEOUT};

/// Where and how a [`QueryClient`](crate::QueryClient) connects.
///
/// Defaults to TCP on `localhost:4953` with 5 second bounds.
///
/// # Example
///
/// ```
/// use tensor_query_client::ClientConfig;
/// use tensor_query_common::Protocol;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_protocol(Protocol::Udp)
///     .with_port(5000)
///     .with_connect_timeout(Duration::from_millis(100));
/// assert_eq!(config.endpoint.to_string(), "udp://localhost:5000");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Bound for opening the connection
    pub connect_timeout: Duration,
    /// Bound for each send and for waiting on the server's decision
    pub io_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            connect_timeout: DEFAULT_TIMEOUT,
            io_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.endpoint.protocol = protocol;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.endpoint.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.endpoint.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}
