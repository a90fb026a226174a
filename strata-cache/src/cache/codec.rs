//! Serialization hooks for the disk tier
//!
//! The storage engine only sees bytes. A [`Codec`] turns cached values into
//! bytes and back, a [`FilenameStrategy`] names the blob files, and
//! [`Annotated`] carries caller metadata next to a decoded value.

use crate::core::{ItemInfo, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Value ↔ bytes conversion used by the disk cache
pub trait Codec<V>: Send + Sync {
    fn encode(&self, value: &V) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// Compact binary encoding for any serde type (bincode, standard config)
pub struct BincodeCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> BincodeCodec<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for BincodeCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Serialize + DeserializeOwned> Codec<V> for BincodeCodec<V> {
    fn encode(&self, value: &V) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            value,
            bincode::config::standard(),
        )?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(value)
    }
}

/// Human-readable JSON encoding for any serde type
pub struct JsonCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonCodec<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Serialize + DeserializeOwned> Codec<V> for JsonCodec<V> {
    fn encode(&self, value: &V) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Pass-through for caches of raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Maps a cache key to the name of its blob file
///
/// Any `Fn(&str) -> String` closure qualifies, e.g. to append an extension
/// or to name blobs by content digest so equal values share a file.
pub trait FilenameStrategy: Send + Sync {
    fn filename_for(&self, key: &str) -> String;
}

impl<F> FilenameStrategy for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn filename_for(&self, key: &str) -> String {
        self(key)
    }
}

/// Hex SHA-256 of the key, the engine's own default naming
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedFilename;

impl FilenameStrategy for HashedFilename {
    fn filename_for(&self, key: &str) -> String {
        crate::storage::default_filename(key)
    }
}

/// Cost of a stored item, computed from its index metadata
pub type CostMetric = std::sync::Arc<dyn Fn(&ItemInfo) -> u64 + Send + Sync>;

/// A decoded value paired with the opaque bytes stored beside it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Annotated<V> {
    pub value: V,
    pub extended_data: Option<Vec<u8>>,
}

impl<V> Annotated<V> {
    pub fn new(value: V) -> Self {
        Self {
            value,
            extended_data: None,
        }
    }

    /// Attach metadata to a value
    pub fn attach(value: V, extended_data: impl Into<Vec<u8>>) -> Self {
        Self {
            value,
            extended_data: Some(extended_data.into()),
        }
    }

    /// Metadata attached to the value, if any
    pub fn extended_data(&self) -> Option<&[u8]> {
        self.extended_data.as_deref()
    }

    pub fn into_value(self) -> V {
        self.value
    }
}
