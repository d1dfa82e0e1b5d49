//! Tensor Query Server
//!
//! This crate provides the sink side of tensor query: a server object that
//! binds one transport, accepts connections from many sources, and runs a
//! receiver-side negotiation per connection.
//!
//! # Lifecycle
//!
//! ```text
//! init() -> setup(protocol, host, port) -> accept()* / serve() -> free()
//! ```
//!
//! Every accepted connection gets its own [`ServerSession`]. Admission of a
//! proposed stream is up to a [`StreamPolicy`].

pub mod config;
pub mod connections;
pub mod policy;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use connections::ConnectionTable;
pub use policy::{AcceptAll, DenyAll, MatchLayout, MatchSinkConfig, SinkConfig, StreamPolicy};
pub use server::QueryServer;
pub use session::{ReceivedBuffer, ServerSession, SessionEvent};
