//! The cache layer capability
//!
//! A layer is one tier of the cache stack. The stack holds an ordered slice
//! of layers from nearest (fastest) to furthest and drives them through this
//! trait; anything that can satisfy it can participate in the stack.
//!
//! Values are opaque encoded byte strings; layers never interpret them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entry::CacheSetEntry;
use crate::error::CacheError;

/// Storage capability implemented by every cache tier.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Read one element of a hash.
    async fn get_value(
        &self,
        hash_key: &str,
        element_key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError>;

    /// Write one element of a hash. Does not touch the hash's expiry.
    async fn set_value(
        &self,
        hash_key: &str,
        element_key: &str,
        value: Vec<u8>,
    ) -> Result<(), CacheError>;

    /// Remove one element of a hash.
    async fn evict_value(&self, hash_key: &str, element_key: &str) -> Result<(), CacheError>;

    /// Read a whole hash with its expiry. `None` when the layer has nothing
    /// for this key.
    async fn get_hash(&self, hash_key: &str) -> Result<Option<CacheSetEntry>, CacheError>;

    /// Replace a whole hash, expiry included.
    async fn set_hash(&self, hash_key: &str, entry: &CacheSetEntry) -> Result<(), CacheError>;

    /// Remove a whole hash.
    async fn evict_hash(&self, hash_key: &str) -> Result<(), CacheError>;

    /// Read a subset of a hash's elements.
    ///
    /// `None` means the layer holds nothing for `hash_key`; `Some` holds the
    /// requested elements that are resident, which may be none of them. The
    /// stack uses that distinction to decide whether deeper layers should
    /// still be searched with the same remaining keys.
    async fn get_hash_subset(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<Option<HashMap<String, Vec<u8>>>, CacheError>;

    /// Write a batch of elements. Does not touch the hash's expiry.
    async fn set_hash_subset(
        &self,
        hash_key: &str,
        subset: &HashMap<String, Vec<u8>>,
    ) -> Result<(), CacheError>;

    /// Remove a batch of elements.
    async fn evict_hash_subset(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<(), CacheError>;

    /// Replace the expiry of an existing hash; no-op when the hash is absent.
    async fn set_hash_expiry(
        &self,
        hash_key: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), CacheError>;

    /// Compact already-expired entries.
    async fn cleanup(&self) -> Result<(), CacheError>;

    /// Drop everything held by this layer.
    async fn flush(&self) -> Result<(), CacheError>;

    /// Whether the layer can currently serve requests. Queried before each
    /// read, not before writes.
    async fn is_available(&self) -> bool;

    /// Release resources held by the layer.
    async fn dispose(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
