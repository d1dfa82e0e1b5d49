// Copyright 2025 Tensor Query Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Tensor Query CLI
//!
//! Command-line front end for tensor query.
//!
//! - `tensor-query serve`: run a server that logs every received buffer
//! - `tensor-query send`: push zero-filled buffers and print the connection
//!   stats as JSON
//!
//! ## Tensor layouts
//!
//! A layout is given as dimensions separated by `:` and tensors separated by
//! `,`, with one element type per tensor (or one type for all of them):
//!
//! ```bash
//! tensor-query send --dims 3:224:224,1:1000 --type uint8,float32
//! ```

use argh::FromArgs;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use tensor_query_client::{ClientConfig, QueryClient};
use tensor_query_common::{
    DataInfo, Decision, Endpoint, Protocol, QueryError, StatsSnapshot, TensorBuffer, TensorInfo,
    TensorLayout, TensorType, DEFAULT_PORT,
};
use tensor_query_server::{DenyAll, MatchSinkConfig, QueryServer};

#[cfg(test)]
mod tests;

/// Tensor query - stream tensors between processes
#[derive(FromArgs, Debug)]
pub struct Cli {
    #[argh(subcommand)]
    pub command: Commands,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Serve(ServeArgs),
    Send(SendArgs),
}

/// run a server and log every received buffer
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve")]
pub struct ServeArgs {
    /// transport: tcp, udp or mqtt (default tcp)
    #[argh(option, default = "Protocol::Tcp")]
    pub protocol: Protocol,

    /// host to bind, or the broker host for mqtt (default localhost)
    #[argh(option, default = "\"localhost\".into()")]
    pub host: String,

    /// port to bind, 0 for a random one (default 4953)
    #[argh(option, default = "DEFAULT_PORT")]
    pub port: u16,

    /// only approve streams with these dimensions, e.g. 1:1:1:1
    #[argh(option)]
    pub dims: Option<String>,

    /// element types of the expected layout (default float32)
    #[argh(option, long = "type", default = "\"float32\".into()")]
    pub types: String,

    /// deny every stream
    #[argh(switch)]
    pub deny: bool,
}

/// push zero-filled buffers to a server
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "send")]
pub struct SendArgs {
    /// transport: tcp, udp or mqtt (default tcp)
    #[argh(option, default = "Protocol::Tcp")]
    pub protocol: Protocol,

    /// server host, or the broker host for mqtt (default localhost)
    #[argh(option, default = "\"localhost\".into()")]
    pub host: String,

    /// server port (default 4953)
    #[argh(option, default = "DEFAULT_PORT")]
    pub port: u16,

    /// tensor dimensions (default 1:1:1:1)
    #[argh(option, default = "\"1:1:1:1\".into()")]
    pub dims: String,

    /// element types (default float32)
    #[argh(option, long = "type", default = "\"float32\".into()")]
    pub types: String,

    /// number of buffers to push (default 1)
    #[argh(option, default = "1")]
    pub count: u64,

    /// bound for connect, send and the server's decision in milliseconds (default 5000)
    #[argh(option, long = "timeout-ms", default = "5000")]
    pub timeout_ms: u64,
}

/// Parses `3:224:224` into dimensions.
pub fn parse_dims(dims: &str) -> Result<Vec<u32>, QueryError> {
    dims.split(':')
        .map(|d| {
            d.trim().parse::<u32>().map_err(|e| {
                QueryError::Malformed(format!("dimension '{}' in '{}': {}", d, dims, e))
            })
        })
        .collect()
}

/// Parses a layout from `--dims` and `--type`.
pub fn parse_layout(dims: &str, types: &str) -> Result<TensorLayout, QueryError> {
    let shapes: Vec<&str> = dims.split(',').collect();
    let types: Vec<TensorType> = types
        .split(',')
        .map(str::parse)
        .collect::<Result<_, _>>()?;

    if types.len() != 1 && types.len() != shapes.len() {
        return Err(QueryError::Malformed(format!(
            "{} tensor types given for {} tensors",
            types.len(),
            shapes.len()
        )));
    }

    let tensors = shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| {
            let tensor_type = if types.len() == 1 { types[0] } else { types[i] };
            Ok(TensorInfo::new(tensor_type, parse_dims(shape)?))
        })
        .collect::<Result<Vec<_>, QueryError>>()?;

    let layout = TensorLayout::new(tensors);
    layout.validate()?;
    Ok(layout)
}

/// What `send` prints when it is done.
#[derive(Debug, Serialize)]
pub struct SendReport {
    pub endpoint: String,
    pub buffers_sent: u64,
    pub denied: bool,
    pub stats: StatsSnapshot,
}

/// Serves until ctrl-c.
pub async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let expected = args
        .dims
        .as_deref()
        .map(|dims| parse_layout(dims, &args.types))
        .transpose()?;

    let server = Arc::new(QueryServer::init());
    server.setup(args.protocol, &args.host, args.port).await?;
    server.set_sink_config(expected);

    tracing::info!(
        "Serving on {}",
        Endpoint::new(args.protocol, args.host.as_str(), server.current_port())
    );
    if let Some(layout) = server.sink_config() {
        tracing::info!("Approving only {}", layout);
    }

    let (sink, mut buffers) = mpsc::channel(64);
    let serving = server.clone();
    let accept_loop = if args.deny {
        tracing::info!("Denying every stream");
        tokio::spawn(async move { serving.serve(DenyAll, sink).await })
    } else {
        let policy = MatchSinkConfig::new(serving.sink_config_handle());
        tokio::spawn(async move { serving.serve(policy, sink).await })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            received = buffers.recv() => match received {
                Some(received) => tracing::info!(
                    "Connection {}: {} bytes of {} (pts {})",
                    received.connection,
                    received.buffer.len(),
                    received.buffer.info.layout,
                    received.buffer.info.pts
                ),
                None => break,
            },
        }
    }

    server.free().await?;
    accept_loop.await??;
    Ok(())
}

/// Pushes `count` zero-filled buffers over one connection.
pub async fn run_send(args: SendArgs) -> anyhow::Result<SendReport> {
    let layout = parse_layout(&args.dims, &args.types)?;
    let size = layout
        .total_byte_size()
        .ok_or_else(|| anyhow::anyhow!("layout {} is too large", layout))?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let endpoint = Endpoint::new(args.protocol, args.host, args.port);
    let client = QueryClient::new(
        ClientConfig::new(endpoint.clone())
            .with_connect_timeout(timeout)
            .with_io_timeout(timeout),
    );
    let mut session = client.connect().await?;

    let payload = vec![0u8; size as usize];
    let mut buffers_sent = 0;
    let mut denied = false;
    for i in 0..args.count {
        let info = DataInfo::new(layout.clone())
            .with_sent_time(now_nanos())
            .with_timestamps(i, i);
        match session.push(TensorBuffer::new(info, payload.clone())).await? {
            Decision::Approve => buffers_sent += 1,
            Decision::Deny => {
                tracing::warn!("Server denied stream {}", layout);
                denied = true;
                break;
            }
        }
    }

    let stats = session.stats();
    session.close().await?;
    Ok(SendReport {
        endpoint: endpoint.to_string(),
        buffers_sent,
        denied,
        stats,
    })
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
