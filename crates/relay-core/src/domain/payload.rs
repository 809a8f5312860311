//! Wire encoding of `inputs` and `result` documents: compact JSON, UTF-8,
//! then standard base64.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::TaskError;

pub fn encode(value: &Value) -> Result<String, TaskError> {
    let json = serde_json::to_string(value).map_err(|e| TaskError::Input(e.to_string()))?;
    Ok(STANDARD.encode(json.as_bytes()))
}

pub fn decode(encoded: &str) -> Result<Value, TaskError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| TaskError::Input(format!("payload is not base64: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| TaskError::Input(format!("payload is not JSON: {e}")))
}

/// Serde adapter for optional JSON documents carried as base64 strings.
///
/// Use with `#[serde(with = "crate::domain::payload::optional")]`.
pub mod optional {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Value>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => {
                let encoded = encode(v).map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&encoded)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|e| decode(&e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// A JSON document that serializes as its base64 wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded(pub Value);

impl Serialize for Encoded {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = encode(&self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for Encoded {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        decode(&encoded).map(Encoded).map_err(serde::de::Error::custom)
    }
}
