use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::encoding::{decode, encode};
use crate::result::DbResult;

/// Converts a record payload to and from bytes.
///
/// Implementations must be deterministic and must round-trip every field the
/// store persists. Errors should be reported as
/// [`crate::StoreError::Serialization`].
pub trait Serializer<T>: Send + Sync {
    fn encode(&self, value: &T) -> DbResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> DbResult<T>;
}

/// Compact binary payloads, using the same bincode options as the row envelope.
pub struct BincodeSerializer<T>(PhantomData<fn() -> T>);

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> DbResult<Vec<u8>> {
        encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> DbResult<T> {
        decode(bytes)
    }
}

/// Human readable JSON payloads.
pub struct JsonSerializer<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> DbResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> DbResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
