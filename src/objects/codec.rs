//! Payload encoding and chunking helpers

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};

use crate::error::{DbError, DbResult};

pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

/// Decode a `data:<mime>;base64,<data>` URI or bare base64 into (mime, bytes)
pub fn decode_payload(encoded: &str) -> DbResult<(String, Bytes)> {
    let (content_type, data) = match encoded.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| DbError::InvalidPayload("data URI has no ',' separator".to_string()))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| DbError::InvalidPayload("data URI is not base64 encoded".to_string()))?;
            let mime = if mime.is_empty() { DEFAULT_CONTENT_TYPE } else { mime };
            (mime.to_string(), data)
        }
        None => (DEFAULT_CONTENT_TYPE.to_string(), encoded),
    };
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| DbError::InvalidPayload(format!("invalid base64 payload: {}", e)))?;
    Ok((content_type, Bytes::from(bytes)))
}

pub fn data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, STANDARD.encode(bytes))
}

/// Split into `chunk_size` slices; only the last one may be shorter.
/// The slices share the payload's buffer.
pub fn split_into_chunks(payload: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    (0..payload.len())
        .step_by(chunk_size)
        .map(|start| payload.slice(start..(start + chunk_size).min(payload.len())))
        .collect()
}

pub fn reassemble<B: AsRef<[u8]>>(chunks: &[B]) -> Bytes {
    let total = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut buffer = BytesMut::with_capacity(total);
    for chunk in chunks {
        buffer.extend_from_slice(chunk.as_ref());
    }
    buffer.freeze()
}

pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Serde adapter storing bytes as standard base64 strings
pub mod base64_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
