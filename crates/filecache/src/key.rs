//! Cache key derivation
//!
//! A key is the computation's identity followed by an encoding of its
//! arguments. Encoding goes through an ordered pair of strategies:
//!
//! 1. [`CanonicalJson`] - JSON with every object's keys sorted, so logically
//!    equal arguments (maps built in different orders, keyword-style
//!    structs) always produce the same text. Values containing NaN or an
//!    infinity are refused, since JSON would write them all as `null`.
//! 2. [`BinaryBase64`] - bincode, base64-encoded behind a `b64:` prefix, for
//!    values JSON cannot express (maps with non-string keys, ...).
//!
//! If neither strategy accepts the arguments, derivation fails with
//! [`Error::Unserializable`].

use crate::finite;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// Separator between the computation identity and the encoded arguments
pub const KEY_SEPARATOR: char = ':';

/// Prefix marking a binary (non-canonical) encoding
pub const BINARY_PREFIX: &str = "b64:";

/// Failure of one encoding strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError {
    /// Name of the strategy that failed
    pub strategy: &'static str,
    /// Why it failed
    pub message: String,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.message)
    }
}

/// Turns a serializable value into a string usable as (part of) a key
pub trait ArgumentEncoder {
    /// Encode `value`
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> std::result::Result<String, EncodeError>;
}

/// Sorted-key compact JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalJson;

impl CanonicalJson {
    const NAME: &'static str = "canonical-json";
}

impl ArgumentEncoder for CanonicalJson {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> std::result::Result<String, EncodeError> {
        let fail = |e: serde_json::Error| EncodeError {
            strategy: Self::NAME,
            message: e.to_string(),
        };
        finite::check(value).map_err(|e| EncodeError {
            strategy: Self::NAME,
            message: e.to_string(),
        })?;
        let value = serde_json::to_value(value).map_err(fail)?;
        serde_json::to_string(&canonicalize(value)).map_err(fail)
    }
}

/// Rebuild every object with its keys in sorted order
///
/// `serde_json::Map` may preserve insertion order depending on enabled
/// features, so ordering is imposed explicitly.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// bincode (standard config) wrapped in base64
///
/// Not canonical: hash maps encode in iteration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryBase64;

impl BinaryBase64 {
    const NAME: &'static str = "binary-base64";

    fn to_bytes<T: Serialize + ?Sized>(value: &T) -> std::result::Result<Vec<u8>, EncodeError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| {
            EncodeError {
                strategy: Self::NAME,
                message: e.to_string(),
            }
        })
    }

    /// Encode to plain base64 without the key prefix
    pub(crate) fn encode_raw<T: Serialize + ?Sized>(
        value: &T,
    ) -> std::result::Result<String, EncodeError> {
        Ok(STANDARD.encode(Self::to_bytes(value)?))
    }

    /// Decode plain base64 produced by [`encode_raw`](Self::encode_raw)
    pub(crate) fn decode_raw<T: DeserializeOwned>(
        data: &str,
    ) -> std::result::Result<T, EncodeError> {
        let fail = |message: String| EncodeError {
            strategy: Self::NAME,
            message,
        };
        let bytes = STANDARD.decode(data).map_err(|e| fail(e.to_string()))?;
        let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| fail(e.to_string()))?;
        Ok(value)
    }
}

impl ArgumentEncoder for BinaryBase64 {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> std::result::Result<String, EncodeError> {
        Ok(format!("{BINARY_PREFIX}{}", Self::encode_raw(value)?))
    }
}

/// Try `primary`, fall back to `fallback`
///
/// When both fail the error lists both failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fallback<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> Fallback<P, F> {
    /// Combine two encoders
    pub const fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: ArgumentEncoder, F: ArgumentEncoder> ArgumentEncoder for Fallback<P, F> {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> std::result::Result<String, EncodeError> {
        match self.primary.encode(value) {
            Ok(encoded) => Ok(encoded),
            Err(first) => self.fallback.encode(value).map_err(|second| EncodeError {
                strategy: "fallback",
                message: format!("{first}; {second}"),
            }),
        }
    }
}

/// Encoder used by default: canonical JSON, then bincode
pub type DefaultEncoder = Fallback<CanonicalJson, BinaryBase64>;

/// A derived cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// The key as text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the owned string
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Derives cache keys with a fixed encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDeriver<E = DefaultEncoder> {
    encoder: E,
}

impl KeyDeriver {
    /// Deriver with the default encoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: ArgumentEncoder> KeyDeriver<E> {
    /// Deriver with a custom encoder
    pub const fn with_encoder(encoder: E) -> Self {
        Self { encoder }
    }

    /// Derive the key for `identity` called with `args`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unserializable`] when the encoder rejects `args`.
    pub fn derive<T: Serialize + ?Sized>(&self, identity: &str, args: &T) -> Result<CacheKey> {
        let encoded = self
            .encoder
            .encode(args)
            .map_err(|e| Error::unserializable("arguments", e.to_string()))?;
        let mut key = String::with_capacity(identity.len() + 1 + encoded.len());
        key.push_str(identity);
        key.push(KEY_SEPARATOR);
        key.push_str(&encoded);
        Ok(CacheKey(key))
    }
}

/// Derive the key for `identity` called with `args`, using the default encoder
///
/// # Errors
///
/// Returns [`Error::Unserializable`] when `args` cannot be encoded.
pub fn derive_key<T: Serialize + ?Sized>(identity: &str, args: &T) -> Result<CacheKey> {
    KeyDeriver::new().derive(identity, args)
}

/// Alias of [`derive_key`], for locating an entry to delete by hand
///
/// # Errors
///
/// Returns [`Error::Unserializable`] when `args` cannot be encoded.
pub fn args_key<T: Serialize + ?Sized>(identity: &str, args: &T) -> Result<CacheKey> {
    derive_key(identity, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde::Serializer;
    use std::collections::{BTreeMap, HashMap};

    struct Opaque;

    impl Serialize for Opaque {
        fn serialize<S: Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("opaque handle"))
        }
    }

    #[derive(Serialize)]
    struct Query<'a> {
        url: &'a str,
        retries: u8,
    }

    #[test]
    fn key_is_identity_then_canonical_json() {
        let key = derive_key("square", &(3,)).unwrap();
        assert_eq!(key.as_str(), "square:[3]");
    }

    #[test]
    fn unit_arguments() {
        assert_eq!(derive_key("now", &()).unwrap().as_str(), "now:null");
    }

    #[test]
    fn struct_fields_are_sorted() {
        let key = derive_key(
            "fetch",
            &Query {
                url: "https://example.com",
                retries: 2,
            },
        )
        .unwrap();
        assert_eq!(
            key.as_str(),
            r#"fetch:{"retries":2,"url":"https://example.com"}"#
        );
    }

    #[test]
    fn nested_maps_are_sorted() {
        let value = serde_json::json!({"b": {"z": 1, "a": 2}, "a": [{"y": 0, "x": 1}]});
        let encoded = CanonicalJson.encode(&value).unwrap();
        assert_eq!(encoded, r#"{"a":[{"x":1,"y":0}],"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn hashmap_insertion_order_does_not_matter() {
        let mut forward = HashMap::new();
        let mut backward = HashMap::new();
        for i in 0..32 {
            forward.insert(format!("k{i}"), i);
        }
        for i in (0..32).rev() {
            backward.insert(format!("k{i}"), i);
        }
        assert_eq!(
            derive_key("f", &forward).unwrap(),
            derive_key("f", &backward).unwrap()
        );
    }

    #[test]
    fn different_arguments_give_different_keys() {
        assert_ne!(
            derive_key("f", &(1, 2)).unwrap(),
            derive_key("f", &(2, 1)).unwrap()
        );
        assert_ne!(
            derive_key("f", &"1").unwrap(),
            derive_key("f", &1).unwrap()
        );
    }

    #[test]
    fn identity_is_part_of_key() {
        assert_ne!(
            derive_key("f", &1).unwrap(),
            derive_key("g", &1).unwrap()
        );
    }

    #[test]
    fn non_string_map_keys_fall_back_to_binary() {
        let mut grid = BTreeMap::new();
        grid.insert((0_u8, 1_u8), "x".to_string());
        let key = derive_key("cell", &grid).unwrap();
        assert!(key.as_str().starts_with("cell:b64:"));
        // The fallback is deterministic for ordered maps.
        assert_eq!(key, derive_key("cell", &grid).unwrap());
    }

    #[test]
    fn non_finite_floats_get_distinct_keys() {
        let nan = derive_key("f", &f64::NAN).unwrap();
        let inf = derive_key("f", &f64::INFINITY).unwrap();
        let neg_inf = derive_key("f", &f64::NEG_INFINITY).unwrap();
        assert!(nan.as_str().starts_with("f:b64:"));
        assert_ne!(nan, inf);
        assert_ne!(inf, neg_inf);
        assert_ne!(nan, neg_inf);
        assert_ne!(nan, derive_key("f", &()).unwrap());
        // Finite floats stay readable.
        assert_eq!(derive_key("f", &[0.5_f64]).unwrap().as_str(), "f:[0.5]");
    }

    #[test]
    fn unencodable_arguments_are_unserializable() {
        let err = derive_key("f", &Opaque).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unserializable);
        let msg = err.to_string();
        assert!(msg.contains("canonical-json"));
        assert!(msg.contains("binary-base64"));
        assert!(msg.contains("opaque handle"));
    }

    #[test]
    fn custom_encoder_is_used() {
        let deriver = KeyDeriver::with_encoder(BinaryBase64);
        let key = deriver.derive("f", &1_u32).unwrap();
        assert!(key.as_str().starts_with("f:b64:"));
    }

    #[test]
    fn binary_raw_round_trip() {
        let mut grid = BTreeMap::new();
        grid.insert((2_i32, 3_i32), 6_i64);
        let encoded = BinaryBase64::encode_raw(&grid).unwrap();
        let decoded: BTreeMap<(i32, i32), i64> = BinaryBase64::decode_raw(&encoded).unwrap();
        assert_eq!(decoded, grid);
    }

    #[test]
    fn args_key_matches_derive_key() {
        assert_eq!(
            args_key("f", &(1, "a")).unwrap(),
            derive_key("f", &(1, "a")).unwrap()
        );
    }
}
