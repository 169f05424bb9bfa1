//! Shared test fixtures: in-memory safetensors archive construction.
//!
//! Helpers are used across multiple test binaries, hence the allow(dead_code).

#![allow(dead_code)]

use std::io::Write;

/// Assemble a safetensors archive: header JSON + concatenated tensor data.
///
/// `tensors` entries are `(name, dtype, shape, little-endian bytes)`.
#[must_use]
pub fn build_safetensors(
    tensors: &[(&str, &str, Vec<usize>, Vec<u8>)],
    metadata: &[(&str, &str)],
) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    if !metadata.is_empty() {
        let m: serde_json::Map<String, serde_json::Value> = metadata
            .iter()
            .map(|(k, v)| ((*k).to_string(), serde_json::Value::from(*v)))
            .collect();
        header.insert("__metadata__".to_string(), m.into());
    }
    let mut data = Vec::new();
    for (name, dtype, shape, bytes) in tensors {
        let start = data.len();
        data.extend_from_slice(bytes);
        header.insert(
            (*name).to_string(),
            serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [start, data.len()],
            }),
        );
    }
    let json = serde_json::to_vec(&serde_json::Value::from(header)).expect("header json");
    let mut out = Vec::new();
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(&data);
    out
}

/// Write an archive to a fresh temp file.
#[must_use]
pub fn write_archive(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new()
        .suffix(".safetensors")
        .tempfile()
        .expect("temp file");
    f.write_all(bytes).expect("write archive");
    f.flush().expect("flush");
    f
}

/// Little-endian bytes of 16-bit words.
#[must_use]
pub fn le16(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Little-endian bytes of 32-bit words.
#[must_use]
pub fn le32(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
