//! Pluggable encode/decode contracts for record keys and values.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors raised while decoding record payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid utf-8 payload: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialization format for one side (key or value) of a record.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> Vec<u8> {
        value.as_bytes().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

/// Unsigned 64-bit integers, 8 bytes big-endian.
///
/// Big-endian keeps the byte order of encoded keys equal to their numeric
/// order, which matters for the sorted store snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl Codec<u64> for U64Codec {
    fn encode(&self, value: &u64) -> Vec<u8> {
        value.to_be_bytes().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<u64, CodecError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| CodecError::Length {
            expected: 8,
            actual: bytes.len(),
        })?;
        Ok(u64::from_be_bytes(raw))
    }
}

/// Any serde type as JSON.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn encode(&self, value: &T) -> Vec<u8> {
        // Serializing plain data into a Vec cannot fail for derived impls.
        serde_json::to_vec(value).unwrap_or_default()
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn u64_big_endian_layout() {
        assert_eq!(U64Codec.encode(&7), vec![0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(U64Codec.decode(&[0, 0, 0, 0, 0, 0, 1, 0]).unwrap(), 256);
    }

    #[test]
    fn u64_rejects_short_payload() {
        let err = U64Codec.decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::Length { expected: 8, actual: 3 }));
    }

    #[test]
    fn utf8_rejects_invalid_bytes() {
        assert!(Utf8Codec.decode(&[0xff, 0xfe]).is_err());
        assert_eq!(Utf8Codec.decode(b"seven").unwrap(), "seven");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct UserEvent {
        event_type: String,
        user_id: i64,
    }

    #[test]
    fn json_decodes_structured_payload() {
        let codec = JsonCodec::<UserEvent>::new();
        let decoded = codec
            .decode(br#"{"event_type":"click","user_id":42}"#)
            .unwrap();
        assert_eq!(decoded.event_type, "click");
        assert_eq!(decoded.user_id, 42);
        assert!(codec.decode(b"{not json").is_err());
    }
}
