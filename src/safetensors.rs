//! Safetensors archive reader
//!
//! Memory-mapped reader for the Safetensors format used by `HuggingFace`
//! for zero-copy tensor storage.
//!
//! Format specification: <https://github.com/huggingface/safetensors>
//!
//! ## Format Overview
//!
//! ```text
//! Safetensors := HEADER METADATA TENSOR_DATA
//!
//! HEADER := {
//!   metadata_len: u64 (little-endian)
//! }
//!
//! METADATA := JSON {
//!   "__metadata__": { "key": "value", ... },
//!   "tensor_name": {
//!     "dtype": "F32" | "F16" | "BF16" | ...,
//!     "shape": [dim1, dim2, ...],
//!     "data_offsets": [start, end]
//!   },
//!   ...
//! }
//! ```
//!
//! The file is mapped rather than read; tensor byte views borrow from the
//! map and stay valid until the [`SafetensorsFile`] is dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MedirError, Result};

/// Safetensors element type.
///
/// The reader accepts every dtype the format defines; the analyzer
/// supports the subset for which [`Dtype::bit_widths`] is `Some`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum Dtype {
    /// Boolean
    BOOL,
    /// 8-bit unsigned integer
    U8,
    /// 8-bit signed integer
    I8,
    /// 8-bit float, 5-bit exponent, 2-bit mantissa
    #[serde(rename = "F8_E5M2")]
    F8E5M2,
    /// 8-bit float, 4-bit exponent, 3-bit mantissa
    #[serde(rename = "F8_E4M3")]
    F8E4M3,
    /// 16-bit signed integer
    I16,
    /// 16-bit unsigned integer
    U16,
    /// IEEE 754 half precision
    F16,
    /// Brain float 16
    BF16,
    /// 32-bit signed integer
    I32,
    /// 32-bit unsigned integer
    U32,
    /// IEEE 754 single precision
    F32,
    /// IEEE 754 double precision
    F64,
    /// 64-bit signed integer
    I64,
    /// 64-bit unsigned integer
    U64,
}

impl Dtype {
    /// Size of one element in bytes.
    #[must_use]
    pub fn word_size(self) -> usize {
        match self {
            Self::BOOL | Self::U8 | Self::I8 | Self::F8E5M2 | Self::F8E4M3 => 1,
            Self::I16 | Self::U16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 | Self::I64 | Self::U64 => 8,
        }
    }

    /// `(sign, exponent, mantissa)` bit allocation for the dtypes the
    /// analyzer supports, `None` otherwise.
    ///
    /// Integer encodings have no exponent field; their "mantissa" is the
    /// value-bit width analyzed per bit position.
    #[must_use]
    pub fn bit_widths(self) -> Option<(u32, u32, u32)> {
        match self {
            Self::F16 => Some((1, 5, 10)),
            Self::BF16 => Some((1, 8, 7)),
            Self::F32 => Some((1, 8, 23)),
            Self::F8E4M3 => Some((1, 4, 3)),
            Self::F8E5M2 => Some((1, 5, 2)),
            Self::I32 => Some((1, 0, 31)),
            Self::U32 => Some((0, 0, 32)),
            _ => None,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BOOL => "BOOL",
            Self::U8 => "U8",
            Self::I8 => "I8",
            Self::F8E5M2 => "F8_E5M2",
            Self::F8E4M3 => "F8_E4M3",
            Self::I16 => "I16",
            Self::U16 => "U16",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::I32 => "I32",
            Self::U32 => "U32",
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::I64 => "I64",
            Self::U64 => "U64",
        };
        f.write_str(s)
    }
}

/// JSON tensor metadata (internal)
#[derive(Debug, Deserialize)]
struct TensorMetadata {
    dtype: Dtype,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Tensor metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// Tensor name
    pub name: String,
    /// Element type
    pub dtype: Dtype,
    /// Shape (dimensions)
    pub shape: Vec<usize>,
    /// Data offsets into the tensor-data region, `[start, end)`
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Byte length of the tensor data.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data_offsets[1] - self.data_offsets[0]
    }
}

/// An open, memory-mapped safetensors archive.
#[derive(Debug)]
pub struct SafetensorsFile {
    mmap: memmap2::Mmap,
    path: PathBuf,
    data_start: usize,
    tensors: Vec<TensorInfo>,
    metadata: BTreeMap<String, String>,
}

impl SafetensorsFile {
    /// Open and map an archive, parsing its header.
    ///
    /// # Errors
    ///
    /// Returns [`MedirError::Io`] if the file cannot be opened or its
    /// header is malformed.
    #[allow(unsafe_code)]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| MedirError::Io {
            message: format!("failed to open '{}': {e}", path.display()),
        })?;

        // SAFETY: the file is opened read-only and mapped privately. The
        // single-writer assumption is documented; truncation of the backing
        // file while mapped raises SIGBUS on Unix.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .map_err(|e| MedirError::Io {
                    message: format!("failed to mmap '{}': {e}", path.display()),
                })?
        };

        let (data_start, tensors, metadata) = Self::parse_header(path, &mmap)?;
        Ok(Self {
            mmap,
            path: path.to_path_buf(),
            data_start,
            tensors,
            metadata,
        })
    }

    fn parse_header(
        path: &Path,
        raw: &[u8],
    ) -> Result<(usize, Vec<TensorInfo>, BTreeMap<String, String>)> {
        let header_err = |reason: String| MedirError::Io {
            message: format!("'{}': {reason}", path.display()),
        };

        let head: [u8; 8] = raw
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| header_err("file too short for safetensors header".to_string()))?;
        let metadata_len = usize::try_from(u64::from_le_bytes(head))
            .map_err(|_| header_err("header length exceeds platform usize".to_string()))?;
        let data_start = metadata_len
            .checked_add(8)
            .ok_or_else(|| header_err("header length exceeds platform usize".to_string()))?;
        let json_bytes = raw
            .get(8..data_start)
            .ok_or_else(|| header_err("header length exceeds file size".to_string()))?;

        let json: serde_json::Value = serde_json::from_slice(json_bytes)
            .map_err(|e| header_err(format!("invalid header JSON: {e}")))?;
        let entries = json
            .as_object()
            .ok_or_else(|| header_err("header is not a JSON object".to_string()))?;

        let data_len = raw.len() - data_start;
        let mut metadata = BTreeMap::new();
        let mut tensors = Vec::with_capacity(entries.len());
        for (name, value) in entries {
            if name == "__metadata__" {
                metadata = serde_json::from_value(value.clone())
                    .map_err(|e| header_err(format!("invalid __metadata__: {e}")))?;
                continue;
            }
            let meta: TensorMetadata = serde_json::from_value(value.clone())
                .map_err(|e| header_err(format!("tensor '{name}': {e}")))?;
            let [start, end] = meta.data_offsets;
            if start > end || end > data_len {
                return Err(header_err(format!(
                    "tensor '{name}': data offsets [{start}, {end}) exceed data size {data_len}"
                )));
            }
            tensors.push(TensorInfo {
                name: name.clone(),
                dtype: meta.dtype,
                shape: meta.shape,
                data_offsets: meta.data_offsets,
            });
        }
        tensors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((data_start, tensors, metadata))
    }

    /// The archive path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tensors declared by the header, in name order.
    #[must_use]
    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    /// The `__metadata__` key/value map, empty if absent.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Raw little-endian bytes of one tensor.
    ///
    /// The view borrows from the map; offsets were validated at open.
    #[must_use]
    pub fn data(&self, t: &TensorInfo) -> &[u8] {
        let [start, end] = t.data_offsets;
        &self.mmap[self.data_start + start..self.data_start + end]
    }
}
