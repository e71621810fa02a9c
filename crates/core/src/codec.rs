//! Value codecs
//!
//! Serialization formats are specified only by their boundary contract: a
//! [`Codec`] turns a JSON value into bytes and back. Formats are
//! enumerated; unknown names are rejected at construction rather than at
//! first use.

use crate::error::{Result, StateError};
use serde_json::Value;

/// Boundary contract for value serialization
pub trait Codec: Send + Sync {
    /// Serialize a value to bytes
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Deserialize bytes back into a value
    fn decode(&self, bytes: &[u8]) -> Result<Value>;

    /// Codec name, as accepted by [`CodecKind::parse`]
    fn name(&self) -> &'static str;
}

/// Enumerated codec formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// UTF-8 JSON text
    Json,
    /// MessagePack binary
    Msgpack,
}

impl CodecKind {
    /// Parse a codec name, rejecting unknown values
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "json" => Ok(CodecKind::Json),
            "msgpack" => Ok(CodecKind::Msgpack),
            other => Err(StateError::invalid_config(format!(
                "invalid format name \"{}\"; allowed values: json, msgpack",
                other
            ))),
        }
    }

    /// Construct the codec for this kind
    pub fn build(self) -> Box<dyn Codec> {
        match self {
            CodecKind::Json => Box::new(JsonCodec),
            CodecKind::Msgpack => Box::new(MsgpackCodec),
        }
    }
}

/// JSON text codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// MessagePack binary codec
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|e| StateError::serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| StateError::serialization(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_kinds() {
        assert_eq!(CodecKind::parse("json").unwrap(), CodecKind::Json);
        assert_eq!(CodecKind::parse("msgpack").unwrap(), CodecKind::Msgpack);
    }

    #[test]
    fn test_parse_unknown_kind_rejected() {
        let err = CodecKind::parse("parquet").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("parquet"));
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let value = json!({"Temperature_C": 85, "nested": [1, 2, 3]});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let codec = MsgpackCodec;
        let value = json!({"key": "2", "value": 95.5});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let codec = JsonCodec;
        assert!(codec.decode(b"{not json").is_err());
    }
}
