//! Injectable payload codec.
//!
//! The runtime core moves raw bytes; only the seams that need typed
//! data (typed handlers, the emulator's test-facing invoke) go through
//! a [`Codec`]. The strategy is injected, with [`JsonCodec`] as the
//! stock implementation.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Failure while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("deserialization failed: {0}")]
    Deserialize(String),
}

/// Payload encoding strategy. Implementations must be cheap to share
/// across invocations.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value to wire bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode wire bytes into a value; malformed input fails with
    /// [`CodecError::Deserialize`].
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec over serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|err| CodecError::Serialize(err.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Deserialize(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonCodec;
        let bytes = codec.serialize("hello").unwrap();
        let back: String = codec.deserialize(&bytes).unwrap();
        assert_eq!(back, "hello");
    }

    #[test]
    fn malformed_input_fails_with_deserialize_error() {
        let codec = JsonCodec;
        let result: Result<String, _> = codec.deserialize(b"{not json");
        assert!(matches!(result, Err(CodecError::Deserialize(_))));
    }
}
