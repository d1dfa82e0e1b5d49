pub mod command;
pub mod error;
pub mod tensor;

#[cfg(test)]
mod tests;

pub use command::{
    Command, CommandKind, DataInfo, Envelope, Protocol, MAX_DATAGRAM_SIZE, MAX_MQTT_PAYLOAD,
    MAX_PAYLOAD_SIZE,
};
pub use error::{QueryError, Result};
pub use tensor::{TensorInfo, TensorLayout, TensorType, TENSOR_RANK_LIMIT, TENSOR_SIZE_LIMIT};
