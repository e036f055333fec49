//! The managed-object abstraction and payload codec.
//!
//! A managed object is any `'static` value that serde can round-trip.
//! Payloads are `[class_id: u32 LE][bincode body]`: the class table maps
//! the type descriptor to a small integer so payloads never embed type
//! names.

use crate::error::{DataError, DataResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use umbra_store::ClassId;

/// A value the data service can manage.
///
/// Blanket-implemented for every type that is serde round-trippable,
/// thread-safe, and `'static`; there is nothing to implement by hand.
/// Serializability is therefore a compile-time property of managed
/// objects, not a runtime check.
pub trait ManagedObject: Serialize + DeserializeOwned + Any + Send + Sync + 'static {}

impl<T> ManagedObject for T where T: Serialize + DeserializeOwned + Any + Send + Sync + 'static {}

/// The class descriptor of `T`, as recorded in the class table.
#[must_use]
pub(crate) fn descriptor_of<T: ManagedObject>() -> &'static str {
    std::any::type_name::<T>()
}

/// Serializes a managed value to its payload body.
pub(crate) fn encode_body<T: ManagedObject>(value: &T) -> DataResult<Vec<u8>> {
    bincode::serialize(value).map_err(|err| DataError::serialization(err.to_string()))
}

/// Deserializes a payload body into a managed value.
pub(crate) fn decode_body<T: ManagedObject>(bytes: &[u8]) -> DataResult<T> {
    bincode::deserialize(bytes).map_err(|err| DataError::serialization(err.to_string()))
}

/// Builds a full payload from a class ID and body.
#[must_use]
pub(crate) fn encode_payload(class: ClassId, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&class.as_u32().to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Splits a payload into its class ID and body.
pub(crate) fn split_payload(payload: &[u8]) -> DataResult<(ClassId, &[u8])> {
    if payload.len() < 4 {
        return Err(DataError::serialization("payload shorter than class header"));
    }
    let class = ClassId::new(u32::from_le_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]));
    Ok((class, &payload[4..]))
}

/// Serializes the value inside a type-erased cache cell.
///
/// Monomorphized per concrete type when the cell enters the cache, so the
/// context can re-serialize entries at prepare time without knowing their
/// types.
pub(crate) type EncodeBodyFn = fn(&(dyn Any + Send + Sync)) -> DataResult<Vec<u8>>;

/// The [`EncodeBodyFn`] instance for `T`.
pub(crate) fn encode_cell_body<T: ManagedObject>(
    cell: &(dyn Any + Send + Sync),
) -> DataResult<Vec<u8>> {
    let lock = cell
        .downcast_ref::<RwLock<T>>()
        .ok_or_else(|| DataError::internal("cache cell type does not match its entry"))?;
    let guard = lock.read();
    encode_body::<T>(&guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Player {
        name: String,
        score: u32,
    }

    #[test]
    fn body_roundtrip() {
        let player = Player {
            name: "ada".to_string(),
            score: 7,
        };
        let body = encode_body(&player).unwrap();
        assert_eq!(decode_body::<Player>(&body).unwrap(), player);
    }

    #[test]
    fn payload_roundtrip() {
        let class = ClassId::new(3);
        let payload = encode_payload(class, b"body-bytes");
        let (decoded_class, body) = split_payload(&payload).unwrap();
        assert_eq!(decoded_class, class);
        assert_eq!(body, b"body-bytes");
    }

    #[test]
    fn short_payload_rejected() {
        assert!(matches!(
            split_payload(&[1, 2]).unwrap_err(),
            DataError::SerializationFormat { .. }
        ));
    }

    #[test]
    fn encoding_is_deterministic() {
        let player = Player {
            name: "grace".to_string(),
            score: 99,
        };
        assert_eq!(encode_body(&player).unwrap(), encode_body(&player).unwrap());
    }

    #[test]
    fn cell_encoder_matches_direct_encoding() {
        let player = Player {
            name: "joan".to_string(),
            score: 1,
        };
        let direct = encode_body(&player).unwrap();
        let cell: std::sync::Arc<dyn Any + Send + Sync> =
            std::sync::Arc::new(RwLock::new(player));
        let encode: EncodeBodyFn = encode_cell_body::<Player>;
        assert_eq!(encode(cell.as_ref()).unwrap(), direct);
    }

    #[test]
    fn cell_encoder_rejects_wrong_type() {
        let cell: std::sync::Arc<dyn Any + Send + Sync> =
            std::sync::Arc::new(RwLock::new(5u32));
        let encode: EncodeBodyFn = encode_cell_body::<Player>;
        assert!(encode(cell.as_ref()).is_err());
    }
}
