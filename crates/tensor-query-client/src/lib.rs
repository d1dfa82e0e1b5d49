//! Tensor Query Client
//!
//! This crate provides the source side of tensor query: connect to a server,
//! propose a stream, and push tensor buffers once the server approves.

pub mod client;
pub mod config;
pub mod session;

pub use client::QueryClient;
pub use config::ClientConfig;
pub use session::ClientSession;
