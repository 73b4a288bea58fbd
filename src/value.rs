//! The serializer hook between the value store and its host.
//!
//! The store only ever sees byte blobs. A codec tells it how to turn host
//! values into bytes and back, plus a fast path: values that already are
//! byte strings are copied into the heap verbatim and flagged as such, so
//! reading them back skips deserialization entirely.

use crate::error::Result;

/// Host-provided (de)serialization for stored values.
pub trait ValueCodec {
    type Value;

    /// Fast path: the raw bytes when the value already is a byte string,
    /// `None` when it needs [`serialize`](ValueCodec::serialize).
    fn as_bytes<'v>(&self, value: &'v Self::Value) -> Option<&'v [u8]>;

    /// Rebuild a value that was stored through the fast path.
    fn from_bytes(&self, bytes: Vec<u8>) -> Self::Value;

    fn serialize(&self, value: &Self::Value) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Value>;
}

/// Codec for hosts that store plain blobs. Every value takes the raw
/// fast path; the serialize/deserialize pair exists only to satisfy the
/// trait and round-trips the bytes unchanged.
pub struct RawBytes;

impl ValueCodec for RawBytes {
    type Value = Vec<u8>;

    fn as_bytes<'v>(&self, value: &'v Vec<u8>) -> Option<&'v [u8]> {
        Some(value)
    }

    fn from_bytes(&self, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }

    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
