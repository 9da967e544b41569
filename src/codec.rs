//! Value ⇄ byte-blob conversion.
//!
//! The wire format is a self-describing structured encoding, a tree of
//! strings, numbers, booleans, null, arrays, and maps (JSON). What it does
//! *not* carry is the type of the encoded value: the recipient's declared
//! target type drives decoding, with field names in the encoded map matched
//! against fields of the declared record. Nested records and primitive
//! collections follow their declared parameterizations through serde.
//!
//! Unions and polymorphic payloads are not supported; an explicit "kind"
//! field in the record is the caller's workaround.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::BusError;

/// Encode a value into a transport-neutral byte blob.
///
/// Encoding without a declared type is impossible by construction: the
/// `Serialize` bound is the static type hint.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(value).map_err(|e| BusError::Encode {
        target: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}

/// Reconstruct a value of the declared target type from a byte blob.
///
/// A missing field or type mismatch yields [`BusError::Decode`] carrying the
/// declared type and the deserializer's diagnostic for the offending field.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BusError> {
    serde_json::from_slice(payload).map_err(|e| BusError::Decode {
        target: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}

/// Decode a payload with no a-priori type, as an encoded-value tree.
///
/// Queue consumers use this; a structured payload can then be narrowed with
/// [`from_value`].
pub fn decode_value(payload: &[u8]) -> Result<Value, BusError> {
    decode::<Value>(payload)
}

/// Convert a value into the encoded-value tree without going through bytes
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, BusError> {
    serde_json::to_value(value).map_err(|e| BusError::Encode {
        target: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}

/// Narrow an encoded-value tree to the declared target type
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, BusError> {
    serde_json::from_value(value).map_err(|e| BusError::Decode {
        target: std::any::type_name::<T>(),
        detail: e.to_string(),
    })
}
