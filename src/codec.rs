//! Pluggable value codec
//!
//! Layers and the cache stack move opaque byte strings; the codec is the
//! boundary where typed values become bytes. The remote layer uses its codec
//! for the hash info record, and the remote-eviction extension uses it for
//! eviction messages on the wire.
//!
//! A codec must round-trip every supported value: `decode(encode(v)) == v`,
//! including `None`, which encodes to an explicit null marker rather than an
//! empty byte string. That distinction is load-bearing: a stored null element
//! is a present value, while an empty response from the store means the
//! element is absent.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// Serialize/deserialize typed values to and from opaque byte strings.
pub trait Codec: Send + Sync + std::fmt::Debug + 'static {
    /// Encode a value to bytes.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CacheError>;

    /// Decode a value from bytes.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError>;

    /// Codec name, used for logging.
    fn name(&self) -> &'static str;
}

/// JSON codec backed by `serde_json`. `None` encodes to the four-byte
/// `null` literal.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
