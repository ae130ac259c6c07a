//! In-process cache layer
//!
//! The nearest tier of a stack: a concurrent map of hash entries with TTL
//! honored on read and reclaimed in bulk by `cleanup`. Always available.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use tracing::debug;

use crate::clock;
use crate::entry::CacheSetEntry;
use crate::error::CacheError;
use crate::layer::CacheLayer;

/// In-memory cache layer keyed by hash-table key.
///
/// Each entry embeds a concurrent element map, so per-element operations
/// mutate in place without replacing the entry. Expired entries are treated
/// as absent on read and dropped eagerly when touched.
#[derive(Debug, Default)]
pub struct MemoryCacheLayer {
    store: DashMap<String, CacheSetEntry>,
}

impl MemoryCacheLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resident (possibly expired, not yet compacted) hashes.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Entry for `hash_key` if it is resident and not expired. An expired
    /// entry is dropped on the way out.
    fn live(&self, hash_key: &str) -> Option<Ref<'_, String, CacheSetEntry>> {
        {
            let entry = self.store.get(hash_key)?;
            if !entry.has_expired(clock::now()) {
                return Some(entry);
            }
        }
        debug!(hash_key, "dropping expired entry on read");
        self.store.remove(hash_key);
        None
    }

    /// Entry slot for a write, replacing an expired resident entry with a
    /// fresh expiry-less one.
    fn writable(&self, hash_key: &str) -> dashmap::mapref::one::RefMut<'_, String, CacheSetEntry> {
        let mut slot = self
            .store
            .entry(hash_key.to_owned())
            .or_insert_with(|| CacheSetEntry::new(None));
        if slot.has_expired(clock::now()) {
            *slot = CacheSetEntry::new(None);
        }
        slot
    }
}

#[async_trait]
impl CacheLayer for MemoryCacheLayer {
    async fn get_value(
        &self,
        hash_key: &str,
        element_key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.live(hash_key).and_then(|entry| entry.get(element_key)))
    }

    async fn set_value(
        &self,
        hash_key: &str,
        element_key: &str,
        value: Vec<u8>,
    ) -> Result<(), CacheError> {
        self.writable(hash_key).insert(element_key.to_owned(), value);
        Ok(())
    }

    async fn evict_value(&self, hash_key: &str, element_key: &str) -> Result<(), CacheError> {
        if let Some(entry) = self.live(hash_key) {
            entry.remove(element_key);
        }
        Ok(())
    }

    async fn get_hash(&self, hash_key: &str) -> Result<Option<CacheSetEntry>, CacheError> {
        Ok(self.live(hash_key).map(|entry| entry.clone()))
    }

    async fn set_hash(&self, hash_key: &str, entry: &CacheSetEntry) -> Result<(), CacheError> {
        self.store.insert(hash_key.to_owned(), entry.clone());
        Ok(())
    }

    async fn evict_hash(&self, hash_key: &str) -> Result<(), CacheError> {
        self.store.remove(hash_key);
        Ok(())
    }

    async fn get_hash_subset(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<Option<HashMap<String, Vec<u8>>>, CacheError> {
        let Some(entry) = self.live(hash_key) else {
            return Ok(None);
        };

        let mut found = HashMap::new();
        for element_key in element_keys {
            if let Some(value) = entry.get(element_key) {
                found.insert(element_key.clone(), value);
            }
        }
        Ok(Some(found))
    }

    async fn set_hash_subset(
        &self,
        hash_key: &str,
        subset: &HashMap<String, Vec<u8>>,
    ) -> Result<(), CacheError> {
        let slot = self.writable(hash_key);
        for (element_key, value) in subset {
            slot.insert(element_key.clone(), value.clone());
        }
        Ok(())
    }

    async fn evict_hash_subset(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<(), CacheError> {
        if let Some(entry) = self.live(hash_key) {
            entry.remove_many(element_keys);
        }
        Ok(())
    }

    async fn set_hash_expiry(
        &self,
        hash_key: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        if self.live(hash_key).is_none() {
            return Ok(());
        }
        if let Some(mut entry) = self.store.get_mut(hash_key) {
            entry.set_expiry(Some(expiry));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), CacheError> {
        let now = clock::now();
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.has_expired(now));
        let removed = before - self.store.len();
        if removed > 0 {
            debug!(removed, "compacted expired entries");
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.store.clear();
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }
}
