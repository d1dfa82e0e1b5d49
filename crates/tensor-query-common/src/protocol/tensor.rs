use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::command::MAX_PAYLOAD_SIZE;
use crate::protocol::error::{QueryError, Result};

/// Maximum number of tensors a single stream may declare.
pub const TENSOR_SIZE_LIMIT: usize = 16;

/// Maximum rank (number of dimensions) of one tensor.
pub const TENSOR_RANK_LIMIT: usize = 4;

/// Element type of a tensor.
///
/// The discriminant is the wire code written after each tensor's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TensorType {
    Int32 = 0,
    UInt32 = 1,
    Int16 = 2,
    UInt16 = 3,
    Int8 = 4,
    UInt8 = 5,
    Float64 = 6,
    Float32 = 7,
    Int64 = 8,
    UInt64 = 9,
    Float16 = 10,
}

impl TensorType {
    const ALL: [TensorType; 11] = [
        TensorType::Int32,
        TensorType::UInt32,
        TensorType::Int16,
        TensorType::UInt16,
        TensorType::Int8,
        TensorType::UInt8,
        TensorType::Float64,
        TensorType::Float32,
        TensorType::Int64,
        TensorType::UInt64,
        TensorType::Float16,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            TensorType::Int8 | TensorType::UInt8 => 1,
            TensorType::Int16 | TensorType::UInt16 | TensorType::Float16 => 2,
            TensorType::Int32 | TensorType::UInt32 | TensorType::Float32 => 4,
            TensorType::Int64 | TensorType::UInt64 | TensorType::Float64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TensorType::Int32 => "int32",
            TensorType::UInt32 => "uint32",
            TensorType::Int16 => "int16",
            TensorType::UInt16 => "uint16",
            TensorType::Int8 => "int8",
            TensorType::UInt8 => "uint8",
            TensorType::Float64 => "float64",
            TensorType::Float32 => "float32",
            TensorType::Int64 => "int64",
            TensorType::UInt64 => "uint64",
            TensorType::Float16 => "float16",
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TensorType {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| QueryError::Malformed(format!("unknown tensor type '{}'", s)))
    }
}

/// Shape and element type of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub tensor_type: TensorType,
    pub dims: Vec<u32>,
}

impl TensorInfo {
    pub fn new(tensor_type: TensorType, dims: impl Into<Vec<u32>>) -> Self {
        Self {
            tensor_type,
            dims: dims.into(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Size of the tensor payload in bytes, `None` on overflow.
    pub fn byte_size(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(self.tensor_type.element_size() as u64, |acc, &d| {
                acc.checked_mul(u64::from(d))
            })
    }

    /// Checks rank and dimension bounds.
    pub fn validate(&self) -> Result<()> {
        if self.dims.is_empty() || self.dims.len() > TENSOR_RANK_LIMIT {
            return Err(QueryError::Malformed(format!(
                "tensor rank {} outside 1..={}",
                self.dims.len(),
                TENSOR_RANK_LIMIT
            )));
        }
        if self.dims.contains(&0) {
            return Err(QueryError::Malformed(format!(
                "tensor shape {:?} has a zero dimension",
                self.dims
            )));
        }
        match self.byte_size() {
            Some(size) if size <= MAX_PAYLOAD_SIZE as u64 => Ok(()),
            _ => Err(QueryError::Malformed(format!(
                "tensor shape {:?} of {} exceeds {} bytes",
                self.dims, self.tensor_type, MAX_PAYLOAD_SIZE
            ))),
        }
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(u32::to_string).collect();
        write!(f, "{}[{}]", self.tensor_type, dims.join(":"))
    }
}

/// Layout of every tensor carried by one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorLayout {
    pub tensors: Vec<TensorInfo>,
}

impl TensorLayout {
    pub fn new(tensors: Vec<TensorInfo>) -> Self {
        Self { tensors }
    }

    pub fn single(info: TensorInfo) -> Self {
        Self {
            tensors: vec![info],
        }
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Total payload size of one buffer, `None` on overflow.
    pub fn total_byte_size(&self) -> Option<u64> {
        self.tensors
            .iter()
            .try_fold(0u64, |acc, t| acc.checked_add(t.byte_size()?))
    }

    pub fn validate(&self) -> Result<()> {
        if self.tensors.is_empty() || self.tensors.len() > TENSOR_SIZE_LIMIT {
            return Err(QueryError::Malformed(format!(
                "tensor count {} outside 1..={}",
                self.tensors.len(),
                TENSOR_SIZE_LIMIT
            )));
        }
        for info in &self.tensors {
            info.validate()?;
        }
        match self.total_byte_size() {
            Some(size) if size <= MAX_PAYLOAD_SIZE as u64 => Ok(()),
            _ => Err(QueryError::Malformed(format!(
                "buffer of {} tensors exceeds {} bytes",
                self.tensors.len(),
                MAX_PAYLOAD_SIZE
            ))),
        }
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, info) in self.tensors.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", info)?;
        }
        Ok(())
    }
}
