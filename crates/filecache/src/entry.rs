//! Stored cache entries

use crate::key::BinaryBase64;
use crate::options::Validity;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An encoded computation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Result expressed as JSON
    Json(Value),
    /// bincode bytes, base64-encoded, for results JSON cannot express
    Binary(String),
}

impl Payload {
    /// Encode a result, preferring JSON
    ///
    /// JSON is only used when it decodes back to the same value. Non-finite
    /// floats and nested `None`s do not survive JSON, and hash-ordered
    /// collections cannot be checked, so those results are stored as
    /// bincode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unserializable`] when neither JSON nor bincode can
    /// encode `value`.
    pub fn encode<T: Serialize + DeserializeOwned>(value: &T) -> Result<Self> {
        let binary = BinaryBase64::encode_raw(value);
        let json_err = match serde_json::to_value(value) {
            Ok(json) if round_trips::<T>(&json, binary.as_ref().ok()) => {
                return Ok(Self::Json(json));
            }
            Ok(_) => "value does not survive JSON".to_string(),
            Err(e) => e.to_string(),
        };
        binary.map(Self::Binary).map_err(|bin_err| {
            Error::unserializable("result", format!("json: {json_err}; {bin_err}"))
        })
    }

    /// Decode back into the result type
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unserializable`] when the payload does not decode
    /// as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Json(json) => T::deserialize(json)
                .map_err(|e| Error::unserializable("cached value", e.to_string())),
            Self::Binary(data) => BinaryBase64::decode_raw(data)
                .map_err(|e| Error::unserializable("cached value", e.to_string())),
        }
    }
}

/// Whether `json` decodes to the value whose bincode is `binary`
///
/// Equality is judged on the bincode encoding when there is one, since
/// JSON maps distinct values such as `Some(None)` and `None` to the same
/// text.
fn round_trips<T>(json: &Value, binary: Option<&String>) -> bool
where
    T: Serialize + DeserializeOwned,
{
    let Ok(decoded) = T::deserialize(json) else {
        return false;
    };
    match binary {
        Some(original) => {
            BinaryBase64::encode_raw(&decoded).is_ok_and(|again| &again == original)
        }
        None => serde_json::to_value(&decoded).is_ok_and(|again| &again == json),
    }
}

/// A stored result together with its write time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// When the entry was written
    pub timestamp: DateTime<Utc>,
    /// The encoded result
    pub value: Payload,
}

impl CacheEntry {
    /// Entry written now
    #[must_use]
    pub fn new(value: Payload) -> Self {
        Self::at(Utc::now(), value)
    }

    /// Entry written at a given instant
    #[must_use]
    pub fn at(timestamp: DateTime<Utc>, value: Payload) -> Self {
        Self { timestamp, value }
    }

    /// Whether the entry is fresh under `validity` at `now`
    #[must_use]
    pub fn is_fresh(&self, validity: &Validity, now: DateTime<Utc>) -> bool {
        validity.is_fresh(self.timestamp, now)
    }
}
