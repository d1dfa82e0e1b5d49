//! Admission policies for proposed streams.

use std::sync::{Arc, RwLock};
use tensor_query_common::{ConnectionId, DataInfo, Decision, TensorLayout};

/// Decides whether a proposed stream is admitted.
///
/// Called once per TRANSFER_START, including renegotiations. Any
/// `Fn(ConnectionId, &DataInfo) -> Decision` closure is a policy.
pub trait StreamPolicy: Send + Sync + 'static {
    fn decide(&self, connection: ConnectionId, info: &DataInfo) -> Decision;
}

impl<F> StreamPolicy for F
where
    F: Fn(ConnectionId, &DataInfo) -> Decision + Send + Sync + 'static,
{
    fn decide(&self, connection: ConnectionId, info: &DataInfo) -> Decision {
        self(connection, info)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl StreamPolicy for AcceptAll {
    fn decide(&self, _connection: ConnectionId, _info: &DataInfo) -> Decision {
        Decision::Approve
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl StreamPolicy for DenyAll {
    fn decide(&self, _connection: ConnectionId, _info: &DataInfo) -> Decision {
        Decision::Deny
    }
}

/// Approves only streams whose tensor layout equals a fixed one.
#[derive(Debug, Clone)]
pub struct MatchLayout {
    layout: TensorLayout,
}

impl MatchLayout {
    pub fn new(layout: TensorLayout) -> Self {
        Self { layout }
    }
}

impl StreamPolicy for MatchLayout {
    fn decide(&self, connection: ConnectionId, info: &DataInfo) -> Decision {
        decide_against(connection, info, Some(&self.layout))
    }
}

/// Layout a consumer currently expects, shared between the server and
/// whoever feeds its buffers downstream.
#[derive(Debug, Clone, Default)]
pub struct SinkConfig {
    layout: Arc<RwLock<Option<TensorLayout>>>,
}

impl SinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<TensorLayout> {
        match self.layout.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, layout: Option<TensorLayout>) {
        let mut guard = match self.layout.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = layout;
    }
}

/// Approves streams matching the live sink config; anything goes while no
/// config is published.
#[derive(Debug, Clone)]
pub struct MatchSinkConfig {
    config: SinkConfig,
}

impl MatchSinkConfig {
    pub fn new(config: SinkConfig) -> Self {
        Self { config }
    }
}

impl StreamPolicy for MatchSinkConfig {
    fn decide(&self, connection: ConnectionId, info: &DataInfo) -> Decision {
        decide_against(connection, info, self.config.get().as_ref())
    }
}

fn decide_against(
    connection: ConnectionId,
    info: &DataInfo,
    expected: Option<&TensorLayout>,
) -> Decision {
    match expected {
        Some(expected) if *expected != info.layout => {
            tracing::info!(
                "Denying stream {} on connection {}: expected {}",
                info.layout,
                connection,
                expected
            );
            Decision::Deny
        }
        _ => Decision::Approve,
    }
}
