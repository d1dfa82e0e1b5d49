//! # Tensor Query CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve over TCP, approving only 1:1:1:1 float32 streams
//! tensor-query serve --port 4953 --dims 1:1:1:1
//!
//! # Serve over a broker, topics derived from the port
//! tensor-query serve --protocol mqtt --host broker.local --port 1883
//!
//! # Push ten buffers and print the stats (raw JSON)
//! tensor-query send --port 4953 --dims 3:224:224 --type uint8 --count 10
//! ```

use anyhow::Result;
use tensor_query_cli::{run_send, run_serve, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // send prints JSON on stdout, so its logs go to stderr
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => {
            tracing::info!("Starting tensor query server ({})", args.protocol);
            run_serve(args).await?;
        }
        Commands::Send(args) => {
            let report = run_send(args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
