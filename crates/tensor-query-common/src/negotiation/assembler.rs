use bytes::{Bytes, BytesMut};

use crate::protocol::error::{QueryError, Result};
use crate::protocol::DataInfo;

/// One complete tensor buffer and the stream metadata it was sent under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorBuffer {
    pub info: DataInfo,
    pub data: Bytes,
}

impl TensorBuffer {
    pub fn new(info: DataInfo, data: impl Into<Bytes>) -> Self {
        Self {
            info,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Rebuilds tensor buffers from DATA chunks.
///
/// The buffer size is the sum of the tensor byte sizes in the negotiated
/// metadata. Chunk boundaries need not line up with buffer boundaries: a
/// chunk that completes a buffer emits it, and any bytes past the boundary
/// start the next buffer under the same metadata.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    info: Option<DataInfo>,
    expected: usize,
    pending: BytesMut,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a stream under `info`, dropping any partial buffer of the
    /// previous one.
    pub fn start(&mut self, info: DataInfo) -> Result<()> {
        let expected = info
            .expected_size()
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                QueryError::Malformed(format!("tensor layout {} has no usable size", info.layout))
            })?;

        self.discard("renegotiated");
        self.info = Some(info);
        self.expected = expected;
        Ok(())
    }

    /// Bytes one buffer of the current stream needs.
    pub fn expected_size(&self) -> usize {
        self.expected
    }

    /// Bytes received towards the next buffer.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Adds one chunk, returning every buffer it completed.
    pub fn push(&mut self, mut chunk: Bytes) -> Result<Vec<TensorBuffer>> {
        let info = self.info.as_ref().ok_or_else(|| {
            QueryError::Malformed("data chunk without stream metadata".to_string())
        })?;

        let mut complete = Vec::new();
        while !chunk.is_empty() {
            let need = self.expected - self.pending.len();

            // Whole buffers inside the chunk are handed out without copying.
            if self.pending.is_empty() && chunk.len() >= need {
                complete.push(TensorBuffer::new(info.clone(), chunk.split_to(need)));
                continue;
            }

            let take = need.min(chunk.len());
            self.pending.extend_from_slice(&chunk.split_to(take));
            if self.pending.len() == self.expected {
                complete.push(TensorBuffer::new(info.clone(), self.pending.split().freeze()));
            }
        }
        Ok(complete)
    }

    /// Ends the stream. Returns how many incomplete bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.discard("ended");
        self.info = None;
        self.expected = 0;
        dropped
    }

    fn discard(&mut self, why: &str) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            tracing::warn!(
                "Stream {} with an incomplete buffer, dropping {} of {} bytes",
                why,
                dropped,
                self.expected
            );
            self.pending.clear();
        }
        dropped
    }
}
