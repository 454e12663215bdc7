//! Payload Codec
//!
//! One binary encoding (bincode over serde) is used for everything that
//! crosses a process boundary or touches disk. Message payloads are opaque
//! bytes tagged with a `kind` string; the [`PayloadRegistry`] maps payload
//! types to their tags so the sender can encode a typed value, and refuses
//! to encode types that were never registered.
//!
//! Registration happens once at process start. Registering the same type
//! under the same tag twice is idempotent; re-using a tag for a different
//! type is an encoding error.

mod registry;

pub use registry::PayloadRegistry;

use hivemind_types::{HiveError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Encodes a wire or disk frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| HiveError::encoding(format!("frame encode: {e}")))
}

/// Decodes a wire or disk frame.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| HiveError::encoding(format!("frame decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivemind_types::Message;

    #[test]
    fn frame_roundtrip() {
        let msg = Message::broadcast("inc", vec![1, 2, 3]);
        let bytes = encode_frame(&msg).unwrap();
        let back: Message = decode_frame(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn truncated_frame_is_encoding_error() {
        let msg = Message::broadcast("inc", vec![1, 2, 3]);
        let bytes = encode_frame(&msg).unwrap();
        let err = decode_frame::<Message>(&bytes[..bytes.len() / 2]).unwrap_err();
        assert_eq!(err.category(), "encoding");
    }
}
