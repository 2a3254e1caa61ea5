//! Value codecs
//!
//! A [`Codec`] turns values into bytes and back. The secondary tier stores
//! every value through its codec; the primary tier uses one only when
//! configured for by-value storage. Implementations must be safe for
//! concurrent independent calls.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Contract used to transform values into a serial form.
pub trait Codec<V>: Send + Sync {
    /// Encode `value` into its serial form.
    fn encode(&self, value: &V) -> CacheResult<Vec<u8>>;

    /// Reconstruct a value from its serial form.
    fn decode(&self, bytes: &[u8]) -> CacheResult<V>;

    /// Whether `value` and `bytes` represent the same stored state.
    fn same_representation(&self, value: &V, bytes: &[u8]) -> CacheResult<bool> {
        Ok(self.encode(value)? == bytes)
    }
}

/// Default codec backed by bincode.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<V> Codec<V> for BincodeCodec
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> CacheResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<V> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_values() {
        let codec = BincodeCodec;
        let bytes = Codec::<Vec<String>>::encode(&codec, &vec!["a".to_string(), "b".to_string()])
            .unwrap();
        let back: Vec<String> = codec.decode(&bytes).unwrap();
        assert_eq!(back, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn same_representation_matches_encoded_form() {
        let codec = BincodeCodec;
        let bytes = Codec::<u64>::encode(&codec, &42u64).unwrap();
        assert!(codec.same_representation(&42u64, &bytes).unwrap());
        assert!(!codec.same_representation(&43u64, &bytes).unwrap());
    }

    #[test]
    fn decode_of_garbage_is_a_serialization_error() {
        let codec = BincodeCodec;
        let result: CacheResult<String> = codec.decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(CacheError::Serialization(_))));
    }
}
