//! The opaque parameter blob operators are configured with.

use std::hash::{Hash, Hasher};

use fxhash::FxHasher64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An operator's parameters (or blend parameters), carried opaquely by the
/// pipeline. The driver hashes and forwards this value to `Operator::commit`
/// without interpreting its contents — operators own their own parameter
/// types and (de)serialize them from this blob themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ParamsBlob(Value);

impl ParamsBlob {
    /// Wraps an already-serialized value.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The empty blob, used as an operator's default parameters when none
    /// are given.
    #[must_use]
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    /// Serializes `params` into a blob.
    ///
    /// # Errors
    /// Returns an error if `params` cannot be represented as JSON.
    pub fn from_serializable<T: Serialize>(params: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_value(params)?))
    }

    /// Deserializes this blob back into a typed parameter struct.
    ///
    /// # Errors
    /// Returns an error if the blob does not match `T`'s shape.
    pub fn to_typed<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.0.clone())
    }

    /// A stable 64-bit hash of this blob's contents, used to fold the
    /// node's `committed_hash`.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut hasher = FxHasher64::default();
        // `Value` does not implement `Hash`; its canonical string form does,
        // and `serde_json::Value`'s `Display` is stable for equal values.
        self.0.to_string().hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Crop {
        x: u32,
        y: u32,
    }

    #[test]
    fn round_trips_through_json() {
        let blob = ParamsBlob::from_serializable(&Crop { x: 1, y: 2 }).unwrap();
        let back: Crop = blob.to_typed().unwrap();
        assert_eq!(back, Crop { x: 1, y: 2 });
    }

    #[test]
    fn hash_is_stable_for_equal_content() {
        let a = ParamsBlob::from_serializable(&Crop { x: 1, y: 2 }).unwrap();
        let b = ParamsBlob::from_serializable(&Crop { x: 1, y: 2 }).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn hash_differs_for_different_content() {
        let a = ParamsBlob::from_serializable(&Crop { x: 1, y: 2 }).unwrap();
        let b = ParamsBlob::from_serializable(&Crop { x: 3, y: 2 }).unwrap();
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
