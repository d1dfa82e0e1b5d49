use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::protocol::error::{QueryError, Result};
use crate::protocol::{
    Command, CommandKind, DataInfo, Envelope, Protocol, TensorInfo, TensorLayout, TensorType,
    MAX_PAYLOAD_SIZE, TENSOR_RANK_LIMIT, TENSOR_SIZE_LIMIT,
};

/// Fixed size of the four timing fields at the end of a START payload.
const TIMING_LEN: usize = 5 * 8;

/// Encodes and decodes command envelopes.
///
/// The byte layout is fixed so independently built endpoints interoperate:
///
/// ```text
/// [command: u8][protocol: u8]
/// START: [num_tensors: u32] { [rank: u8][dim: u32 × rank][type: u8] } × num_tensors
///        [base_time: i64][sent_time: i64][duration: u64][dts: u64][pts: u64]
/// DATA:  [size: u64][size bytes]
/// ```
///
/// All integers are big-endian. Decoding checks every count and length
/// against its limit before anything is allocated for it.
///
/// # Example
///
/// ```
/// use tensor_query_common::transport::CommandCodec;
/// use tensor_query_common::protocol::{Envelope, Protocol};
///
/// let envelope = Envelope::data(Protocol::Tcp, vec![1u8, 2, 3, 4]);
/// let encoded = CommandCodec::encode(&envelope).unwrap();
/// let decoded = CommandCodec::decode(encoded).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
pub struct CommandCodec;

impl CommandCodec {
    /// Encode an envelope to bytes
    pub fn encode(envelope: &Envelope) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(Self::encoded_len(envelope));
        Self::encode_into(envelope, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Encode an envelope that must fit into one transport unit.
    ///
    /// Datagram and publish/subscribe transports never fragment, so an
    /// envelope larger than `max_unit` is a caller error.
    pub fn encode_unit(envelope: &Envelope, max_unit: usize) -> Result<Bytes> {
        let size = Self::encoded_len(envelope);
        if size > max_unit {
            return Err(QueryError::PayloadTooLarge {
                size,
                max: max_unit,
            });
        }
        Self::encode(envelope)
    }

    /// Number of bytes `encode` produces for this envelope.
    pub fn encoded_len(envelope: &Envelope) -> usize {
        2 + match envelope.command() {
            Command::TransferStart(info) => {
                4 + info
                    .layout
                    .tensors
                    .iter()
                    .map(|t| 1 + 4 * t.dims.len() + 1)
                    .sum::<usize>()
                    + TIMING_LEN
            }
            Command::TransferData(chunk) => 8 + chunk.len(),
            _ => 0,
        }
    }

    pub fn encode_into(envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(Self::encoded_len(envelope));
        dst.put_u8(envelope.kind().code());
        dst.put_u8(envelope.protocol().code());

        match envelope.command() {
            Command::TransferStart(info) => {
                info.layout.validate()?;
                dst.put_u32(info.layout.num_tensors() as u32);
                for tensor in &info.layout.tensors {
                    dst.put_u8(tensor.rank() as u8);
                    for &dim in &tensor.dims {
                        dst.put_u32(dim);
                    }
                    dst.put_u8(tensor.tensor_type.code());
                }
                dst.put_i64(info.base_time);
                dst.put_i64(info.sent_time);
                dst.put_u64(info.duration);
                dst.put_u64(info.dts);
                dst.put_u64(info.pts);
            }
            Command::TransferData(chunk) => {
                if chunk.len() > MAX_PAYLOAD_SIZE {
                    return Err(QueryError::PayloadTooLarge {
                        size: chunk.len(),
                        max: MAX_PAYLOAD_SIZE,
                    });
                }
                dst.put_u64(chunk.len() as u64);
                dst.put_slice(chunk);
            }
            Command::TransferEnd | Command::TransferApprove | Command::TransferDeny => {}
        }

        Ok(())
    }

    /// Decode exactly one envelope; trailing bytes are rejected.
    pub fn decode(mut src: Bytes) -> Result<Envelope> {
        let kind_code = take_u8(&mut src, "command")?;
        let kind = CommandKind::from_code(kind_code)
            .ok_or_else(|| QueryError::Malformed(format!("unknown command code {}", kind_code)))?;
        let protocol_code = take_u8(&mut src, "protocol")?;
        let protocol = Protocol::from_code(protocol_code).ok_or_else(|| {
            QueryError::Malformed(format!("unknown protocol code {}", protocol_code))
        })?;

        let command = match kind {
            CommandKind::TransferStart => Command::TransferStart(decode_data_info(&mut src)?),
            CommandKind::TransferData => {
                let size = take_u64(&mut src, "data size")?;
                if size > MAX_PAYLOAD_SIZE as u64 {
                    return Err(QueryError::Malformed(format!(
                        "data size {} exceeds {} bytes",
                        size, MAX_PAYLOAD_SIZE
                    )));
                }
                let size = size as usize;
                if src.remaining() < size {
                    return Err(QueryError::Malformed(format!(
                        "data declares {} bytes but only {} remain",
                        size,
                        src.remaining()
                    )));
                }
                Command::TransferData(src.split_to(size))
            }
            CommandKind::TransferEnd => Command::TransferEnd,
            CommandKind::TransferApprove => Command::TransferApprove,
            CommandKind::TransferDeny => Command::TransferDeny,
        };

        if src.has_remaining() {
            return Err(QueryError::Malformed(format!(
                "{} trailing bytes after {}",
                src.remaining(),
                kind
            )));
        }

        Ok(Envelope::new(protocol, command))
    }
}

fn decode_data_info(src: &mut Bytes) -> Result<DataInfo> {
    let num_tensors = take_u32(src, "tensor count")? as usize;
    // Checked before the tensor list is allocated.
    if num_tensors == 0 || num_tensors > TENSOR_SIZE_LIMIT {
        return Err(QueryError::Malformed(format!(
            "tensor count {} outside 1..={}",
            num_tensors, TENSOR_SIZE_LIMIT
        )));
    }

    let mut tensors = Vec::with_capacity(num_tensors);
    for _ in 0..num_tensors {
        let rank = take_u8(src, "tensor rank")? as usize;
        if rank == 0 || rank > TENSOR_RANK_LIMIT {
            return Err(QueryError::Malformed(format!(
                "tensor rank {} outside 1..={}",
                rank, TENSOR_RANK_LIMIT
            )));
        }
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(take_u32(src, "tensor dimension")?);
        }
        let type_code = take_u8(src, "tensor type")?;
        let tensor_type = TensorType::from_code(type_code)
            .ok_or_else(|| QueryError::Malformed(format!("unknown tensor type {}", type_code)))?;
        tensors.push(TensorInfo::new(tensor_type, dims));
    }

    let layout = TensorLayout::new(tensors);
    layout.validate()?;

    if src.remaining() < TIMING_LEN {
        return Err(QueryError::Malformed("truncated timing fields".to_string()));
    }

    Ok(DataInfo {
        layout,
        base_time: src.get_i64(),
        sent_time: src.get_i64(),
        duration: src.get_u64(),
        dts: src.get_u64(),
        pts: src.get_u64(),
    })
}

fn take_u8(src: &mut Bytes, field: &str) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(truncated(field));
    }
    Ok(src.get_u8())
}

fn take_u32(src: &mut Bytes, field: &str) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(truncated(field));
    }
    Ok(src.get_u32())
}

fn take_u64(src: &mut Bytes, field: &str) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(truncated(field));
    }
    Ok(src.get_u64())
}

fn truncated(field: &str) -> QueryError {
    QueryError::Malformed(format!("truncated {}", field))
}

/// Length-prefixed framing for stream transports.
///
/// Wire format: `[4-byte length as u32 big-endian] + [encoded envelope]`.
/// Frames longer than the payload cap plus envelope overhead are rejected
/// as `Malformed` before their body is buffered.
pub struct FramedCodec {
    frames: LengthDelimitedCodec,
}

impl FramedCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_type::<u32>()
                .max_frame_length(MAX_PAYLOAD_SIZE + 64)
                .new_codec(),
        }
    }
}

impl Default for FramedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FramedCodec {
    type Item = Envelope;
    type Error = QueryError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        match self.frames.decode(src) {
            Ok(Some(frame)) => CommandCodec::decode(frame.freeze()).map(Some),
            Ok(None) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                Err(QueryError::Malformed(e.to_string()))
            }
            Err(e) => Err(QueryError::Io(e)),
        }
    }
}

impl Encoder<&Envelope> for FramedCodec {
    type Error = QueryError;

    fn encode(&mut self, envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
        let body = CommandCodec::encode(envelope)?;
        self.frames.encode(body, dst)?;
        Ok(())
    }
}
