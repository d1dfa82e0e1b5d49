use tensor_query_common::{QueryConnection, Result, Transport};

use crate::config::ClientConfig;
use crate::session::ClientSession;

/// Tensor query client.
///
/// Opens one connection per [`connect`](Self::connect) call; each
/// connection is driven by its own [`ClientSession`].
///
/// # Example
///
/// ```no_run
/// use tensor_query_client::{ClientConfig, QueryClient};
/// use tensor_query_common::{DataInfo, Decision, TensorBuffer, TensorInfo, TensorLayout, TensorType};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = QueryClient::new(ClientConfig::default().with_port(4953));
/// let mut session = client.connect().await?;
///
/// let layout = TensorLayout::single(TensorInfo::new(TensorType::Float32, vec![1, 1, 1, 1]));
/// let buffer = TensorBuffer::new(DataInfo::new(layout), vec![0u8; 4]);
/// if session.push(buffer).await? == Decision::Deny {
///     eprintln!("server refused the stream");
/// }
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct QueryClient {
    config: ClientConfig,
}

impl QueryClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a connection to the configured endpoint, bounded by the
    /// connect timeout.
    pub async fn connect(&self) -> Result<ClientSession> {
        let connection =
            QueryConnection::connect(&self.config.endpoint, self.config.connect_timeout).await?;
        tracing::info!(
            "Connected to {} as connection {}",
            self.config.endpoint,
            connection.id()
        );
        Ok(ClientSession::new(connection, self.config.io_timeout))
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}
