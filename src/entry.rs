//! Cache entry types
//!
//! A hash entry is a keyed collection of elements sharing one expiry. The
//! element map must tolerate concurrent readers and writers, so it is backed
//! by a `DashMap`; per-element operations mutate it in place.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock;

/// A single cached value together with its expiry.
///
/// A `None` expiry means no expiry is tracked at this level; only the
/// underlying store's native TTL, if any, applies. Expiries carry
/// whole-second precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    /// The cached value, if any.
    pub value: Option<T>,
    /// Absolute expiry, floored to the second.
    pub expiry: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
    /// Create an entry, flooring the expiry to whole seconds.
    pub fn new(value: Option<T>, expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            value,
            expiry: expiry.map(clock::floor_to_second),
        }
    }

    /// Whether the entry's expiry has passed at `now`.
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }
}

/// A hash entry: element keys mapped to opaque encoded values, all sharing
/// a single expiry.
///
/// Element ordering is not significant. The map supports concurrent put and
/// remove without blocking readers. `Clone` is deep; a cloned entry never
/// aliases the original's element map.
#[derive(Debug)]
pub struct CacheSetEntry {
    elements: DashMap<String, Vec<u8>>,
    expiry: Option<DateTime<Utc>>,
}

impl CacheSetEntry {
    /// Create an empty entry with the given expiry.
    pub fn new(expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            elements: DashMap::new(),
            expiry: expiry.map(clock::floor_to_second),
        }
    }

    /// Create an entry from an element collection.
    pub fn with_elements<I>(elements: I, expiry: Option<DateTime<Utc>>) -> Self
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let entry = Self::new(expiry);
        for (element_key, value) in elements {
            entry.elements.insert(element_key, value);
        }
        entry
    }

    /// The shared expiry for every element in the entry.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    pub(crate) fn set_expiry(&mut self, expiry: Option<DateTime<Utc>>) {
        self.expiry = expiry.map(clock::floor_to_second);
    }

    /// Whether the shared expiry has passed at `now`.
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }

    /// Look up one element's value.
    pub fn get(&self, element_key: &str) -> Option<Vec<u8>> {
        self.elements.get(element_key).map(|value| value.clone())
    }

    /// One element's value paired with the shared expiry.
    pub fn entry(&self, element_key: &str) -> CacheEntry<Vec<u8>> {
        CacheEntry::new(self.get(element_key), self.expiry)
    }

    /// Whether an element is resident.
    pub fn contains(&self, element_key: &str) -> bool {
        self.elements.contains_key(element_key)
    }

    /// Insert or replace one element.
    pub fn insert(&self, element_key: String, value: Vec<u8>) {
        self.elements.insert(element_key, value);
    }

    /// Remove one element, returning its value if it was resident.
    pub fn remove(&self, element_key: &str) -> Option<Vec<u8>> {
        self.elements.remove(element_key).map(|(_, value)| value)
    }

    /// Remove a batch of elements.
    pub fn remove_many(&self, element_keys: &[String]) {
        for element_key in element_keys {
            self.elements.remove(element_key);
        }
    }

    /// Snapshot of the resident element keys.
    pub fn element_keys(&self) -> Vec<String> {
        self.elements.iter().map(|kv| kv.key().clone()).collect()
    }

    /// Number of resident elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the entry holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Snapshot of the element map.
    pub fn to_map(&self) -> HashMap<String, Vec<u8>> {
        self.elements
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect()
    }
}

impl Clone for CacheSetEntry {
    fn clone(&self) -> Self {
        Self::with_elements(self.to_map(), self.expiry)
    }
}

impl PartialEq for CacheSetEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.to_map() == other.to_map()
    }
}

impl Eq for CacheSetEntry {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn in_one_hour() -> DateTime<Utc> {
        clock::now() + Duration::hours(1)
    }

    #[test]
    fn test_cache_entry_floors_expiry() {
        let expiry = clock::now() + Duration::milliseconds(1500);
        let entry = CacheEntry::new(Some(1_u8), Some(expiry));

        assert_eq!(entry.expiry.unwrap().timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_cache_entry_equality_is_structural() {
        let expiry = in_one_hour();
        let a = CacheEntry::new(Some(b"v".to_vec()), Some(expiry));
        let b = CacheEntry::new(Some(b"v".to_vec()), Some(expiry));
        let c = CacheEntry::new(Some(b"w".to_vec()), Some(expiry));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_cache_entry_expiration() {
        let now = clock::now();
        let live = CacheEntry::new(Some(1_u8), Some(now + Duration::hours(1)));
        let dead = CacheEntry::new(Some(1_u8), Some(now - Duration::seconds(1)));
        let untracked = CacheEntry::new(Some(1_u8), None);

        assert!(!live.has_expired(now));
        assert!(dead.has_expired(now));
        assert!(!untracked.has_expired(now));
    }

    #[test]
    fn test_set_entry_element_operations() {
        let entry = CacheSetEntry::new(Some(in_one_hour()));

        entry.insert("a".to_owned(), b"1".to_vec());
        entry.insert("b".to_owned(), b"2".to_vec());

        assert_eq!(entry.len(), 2);
        assert_eq!(entry.get("a"), Some(b"1".to_vec()));
        assert!(entry.contains("b"));
        assert!(entry.get("missing").is_none());

        assert_eq!(entry.remove("a"), Some(b"1".to_vec()));
        assert!(entry.remove("a").is_none());
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn test_set_entry_remove_many() {
        let entry = CacheSetEntry::with_elements(
            [
                ("a".to_owned(), b"1".to_vec()),
                ("b".to_owned(), b"2".to_vec()),
                ("c".to_owned(), b"3".to_vec()),
            ],
            None,
        );

        entry.remove_many(&["a".to_owned(), "c".to_owned(), "missing".to_owned()]);

        assert_eq!(entry.element_keys(), vec!["b".to_owned()]);
    }

    #[test]
    fn test_set_entry_equality_ignores_insertion_order() {
        let expiry = in_one_hour();
        let a = CacheSetEntry::with_elements(
            [("x".to_owned(), b"1".to_vec()), ("y".to_owned(), b"2".to_vec())],
            Some(expiry),
        );
        let b = CacheSetEntry::with_elements(
            [("y".to_owned(), b"2".to_vec()), ("x".to_owned(), b"1".to_vec())],
            Some(expiry),
        );

        assert_eq!(a, b);
    }

    #[test]
    fn test_set_entry_clone_is_deep() {
        let original = CacheSetEntry::with_elements([("a".to_owned(), b"1".to_vec())], None);
        let cloned = original.clone();

        cloned.insert("b".to_owned(), b"2".to_vec());

        assert!(!original.contains("b"));
        assert!(cloned.contains("b"));
    }

    #[test]
    fn test_set_entry_pairs_element_with_shared_expiry() {
        let expiry = in_one_hour();
        let entry = CacheSetEntry::with_elements([("a".to_owned(), b"1".to_vec())], Some(expiry));

        let element = entry.entry("a");
        assert_eq!(element.value, Some(b"1".to_vec()));
        assert_eq!(element.expiry, Some(expiry));

        let absent = entry.entry("missing");
        assert!(absent.value.is_none());
        assert_eq!(absent.expiry, Some(expiry));
    }
}
