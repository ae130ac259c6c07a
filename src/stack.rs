//! The cache stack
//!
//! An ordered read-through/write-through facade over a slice of cache
//! layers, nearest first. Reads descend the layers until a hit and then
//! back-populate every closer layer; writes are applied to every layer in
//! order and then announced through the extension container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::entry::CacheSetEntry;
use crate::error::CacheError;
use crate::extensions::{CacheExtension, CacheUpdateType, ExtensionContainer};
use crate::layer::CacheLayer;

/// The flush surface, split from the main API so a production handle can be
/// passed around without exposing the ability to drop every layer's data.
#[async_trait]
pub trait FlushableCache: Send + Sync {
    /// Flush every layer, then notify observers.
    async fn flush(&self) -> Result<(), CacheError>;
}

/// Read-through/write-through facade over an ordered slice of cache layers.
///
/// Layers are ordered from nearest (fastest) to furthest; at least one is
/// required. Reads skip layers reporting themselves unavailable; writes are
/// strict and fail fast on the first layer error.
pub struct CacheStack {
    layers: Vec<Arc<dyn CacheLayer>>,
    extensions: ExtensionContainer,
    disposed: AtomicBool,
}

impl CacheStack {
    /// Build a stack over `layers` and register `extensions` with it.
    ///
    /// Fails with [`CacheError::NoLayers`] when the layer slice is empty.
    pub async fn new(
        layers: Vec<Arc<dyn CacheLayer>>,
        extensions: Vec<Arc<dyn CacheExtension>>,
    ) -> Result<Arc<Self>, CacheError> {
        if layers.is_empty() {
            return Err(CacheError::NoLayers);
        }

        let stack = Arc::new(Self {
            layers,
            extensions: ExtensionContainer::new(extensions),
            disposed: AtomicBool::new(false),
        });
        stack.extensions.register(&stack).await?;
        Ok(stack)
    }

    /// Number of layers in the stack.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn ensure_live(&self) -> Result<(), CacheError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(CacheError::Disposed);
        }
        Ok(())
    }

    fn require_key(key: &str, what: &str) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "{what} must not be empty"
            )));
        }
        Ok(())
    }

    fn require_keys(keys: &[String], what: &str) -> Result<(), CacheError> {
        for key in keys {
            Self::require_key(key, what)?;
        }
        Ok(())
    }

    /// Write `value` into every layer closer than `found_at`.
    async fn back_populate_value(
        &self,
        found_at: usize,
        hash_key: &str,
        element_key: &str,
        value: &[u8],
    ) -> Result<(), CacheError> {
        for layer in &self.layers[..found_at] {
            if layer.is_available().await {
                layer.set_value(hash_key, element_key, value.to_vec()).await?;
            }
        }
        Ok(())
    }

    /// Read one element of a hash, back-populating closer layers on a hit.
    /// Returns `None` when no layer holds the element.
    pub async fn get_value(
        &self,
        hash_key: &str,
        element_key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;
        Self::require_key(element_key, "element key")?;

        for (index, layer) in self.layers.iter().enumerate() {
            if !layer.is_available().await {
                debug!(index, hash_key, "skipping unavailable layer");
                continue;
            }
            if let Some(value) = layer.get_value(hash_key, element_key).await? {
                debug!(index, hash_key, element_key, "value hit");
                if index > 0 {
                    self.back_populate_value(index, hash_key, element_key, &value).await?;
                }
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Write one element of a hash to every layer.
    pub async fn set_value(
        &self,
        hash_key: &str,
        element_key: &str,
        value: Vec<u8>,
    ) -> Result<(), CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;
        Self::require_key(element_key, "element key")?;

        for layer in &self.layers {
            layer.set_value(hash_key, element_key, value.clone()).await?;
        }
        self.extensions
            .on_hash_element_update(hash_key, element_key, None, CacheUpdateType::AddOrUpdateEntry)
            .await
    }

    /// Remove one element of a hash from every layer.
    pub async fn evict_value(&self, hash_key: &str, element_key: &str) -> Result<(), CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;
        Self::require_key(element_key, "element key")?;

        for layer in &self.layers {
            layer.evict_value(hash_key, element_key).await?;
        }
        self.extensions.on_hash_element_eviction(hash_key, element_key).await
    }

    /// Read a whole hash, back-populating closer layers on a hit.
    pub async fn get_hash(&self, hash_key: &str) -> Result<Option<CacheSetEntry>, CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;

        for (index, layer) in self.layers.iter().enumerate() {
            if !layer.is_available().await {
                debug!(index, hash_key, "skipping unavailable layer");
                continue;
            }
            if let Some(entry) = layer.get_hash(hash_key).await? {
                debug!(index, hash_key, "hash hit");
                for closer in &self.layers[..index] {
                    if closer.is_available().await {
                        closer.set_hash(hash_key, &entry).await?;
                    }
                }
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Replace a whole hash in every layer.
    pub async fn set_hash(&self, hash_key: &str, entry: &CacheSetEntry) -> Result<(), CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;

        for layer in &self.layers {
            layer.set_hash(hash_key, entry).await?;
        }
        self.extensions
            .on_cache_update(hash_key, entry.expiry(), CacheUpdateType::AddOrUpdateEntry)
            .await
    }

    /// Remove a whole hash from every layer.
    pub async fn evict_hash(&self, hash_key: &str) -> Result<(), CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;

        for layer in &self.layers {
            layer.evict_hash(hash_key).await?;
        }
        self.extensions.on_cache_eviction(hash_key).await
    }

    /// Read a subset of a hash's elements, merging partial hits across
    /// layers and back-populating closer layers along the way.
    ///
    /// The result maps each requested element key that was found somewhere
    /// to its value; keys resident nowhere are omitted. The result is never
    /// an error just because nothing was found.
    pub async fn get_hash_subset(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;
        Self::require_keys(element_keys, "element key")?;

        if element_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut result: HashMap<String, Vec<u8>> = HashMap::new();
        let mut remaining: Vec<String> = element_keys.to_vec();

        for (index, layer) in self.layers.iter().enumerate() {
            if !layer.is_available().await {
                debug!(index, hash_key, "skipping unavailable layer");
                continue;
            }

            // None means this layer has nothing at all for the hash key;
            // keep searching deeper with the same remaining keys.
            let Some(found) = layer.get_hash_subset(hash_key, &remaining).await? else {
                continue;
            };

            if !found.is_empty() {
                for closer in &self.layers[..index] {
                    if closer.is_available().await {
                        closer.set_hash_subset(hash_key, &found).await?;
                    }
                }
            }

            // A single-layer full hit is by definition the complete answer.
            if found.len() == element_keys.len() {
                debug!(index, hash_key, "full subset hit");
                return Ok(found);
            }

            remaining.retain(|key| !found.contains_key(key));
            result.extend(found);
            if result.len() == element_keys.len() {
                return Ok(result);
            }
        }

        Ok(result)
    }

    /// Write a batch of elements to every layer.
    pub async fn set_hash_subset(
        &self,
        hash_key: &str,
        subset: &HashMap<String, Vec<u8>>,
    ) -> Result<(), CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;
        let element_keys: Vec<String> = subset.keys().cloned().collect();
        Self::require_keys(&element_keys, "element key")?;

        for layer in &self.layers {
            layer.set_hash_subset(hash_key, subset).await?;
        }
        self.extensions
            .on_hash_subset_update(hash_key, &element_keys, None, CacheUpdateType::AddOrUpdateEntry)
            .await
    }

    /// Remove a batch of elements from every layer.
    pub async fn evict_hash_subset(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<(), CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;
        Self::require_keys(element_keys, "element key")?;

        for layer in &self.layers {
            layer.evict_hash_subset(hash_key, element_keys).await?;
        }
        self.extensions.on_hash_subset_eviction(hash_key, element_keys).await
    }

    /// Replace the expiry of a hash in every layer. Emits no event.
    pub async fn set_hash_expiry(
        &self,
        hash_key: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        self.ensure_live()?;
        Self::require_key(hash_key, "hash key")?;

        for layer in &self.layers {
            layer.set_hash_expiry(hash_key, expiry).await?;
        }
        Ok(())
    }

    /// Compact expired entries in every layer. Emits no event.
    pub async fn cleanup(&self) -> Result<(), CacheError> {
        self.ensure_live()?;
        for layer in &self.layers {
            layer.cleanup().await?;
        }
        Ok(())
    }

    /// Dispose the stack: layers first, then extensions. Idempotent; every
    /// operation after the first call fails with [`CacheError::Disposed`].
    pub async fn dispose(&self) -> Result<(), CacheError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for layer in &self.layers {
            layer.dispose().await?;
        }
        self.extensions.dispose().await
    }
}

#[async_trait]
impl FlushableCache for CacheStack {
    async fn flush(&self) -> Result<(), CacheError> {
        self.ensure_live()?;
        for layer in &self.layers {
            layer.flush().await?;
        }
        self.extensions.on_cache_flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::memory_layer::MemoryCacheLayer;
    use chrono::Duration;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    fn value(text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    fn entry_with(pairs: &[(&str, &str)], expiry: Option<DateTime<Utc>>) -> CacheSetEntry {
        CacheSetEntry::with_elements(
            pairs.iter().map(|(k, v)| ((*k).to_owned(), value(v))),
            expiry,
        )
    }

    async fn two_layer_stack() -> (Arc<CacheStack>, Arc<MemoryCacheLayer>, Arc<MemoryCacheLayer>) {
        let near = Arc::new(MemoryCacheLayer::new());
        let far = Arc::new(MemoryCacheLayer::new());
        let stack = CacheStack::new(vec![near.clone(), far.clone()], vec![]).await.unwrap();
        (stack, near, far)
    }

    /// Layer wrapper whose availability can be toggled from tests.
    struct ToggleLayer {
        inner: MemoryCacheLayer,
        available: AtomicBool,
    }

    impl ToggleLayer {
        fn new(available: bool) -> Self {
            Self {
                inner: MemoryCacheLayer::new(),
                available: AtomicBool::new(available),
            }
        }

        fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CacheLayer for ToggleLayer {
        async fn get_value(
            &self,
            hash_key: &str,
            element_key: &str,
        ) -> Result<Option<Vec<u8>>, CacheError> {
            self.inner.get_value(hash_key, element_key).await
        }

        async fn set_value(
            &self,
            hash_key: &str,
            element_key: &str,
            value: Vec<u8>,
        ) -> Result<(), CacheError> {
            self.inner.set_value(hash_key, element_key, value).await
        }

        async fn evict_value(&self, hash_key: &str, element_key: &str) -> Result<(), CacheError> {
            self.inner.evict_value(hash_key, element_key).await
        }

        async fn get_hash(&self, hash_key: &str) -> Result<Option<CacheSetEntry>, CacheError> {
            self.inner.get_hash(hash_key).await
        }

        async fn set_hash(&self, hash_key: &str, entry: &CacheSetEntry) -> Result<(), CacheError> {
            self.inner.set_hash(hash_key, entry).await
        }

        async fn evict_hash(&self, hash_key: &str) -> Result<(), CacheError> {
            self.inner.evict_hash(hash_key).await
        }

        async fn get_hash_subset(
            &self,
            hash_key: &str,
            element_keys: &[String],
        ) -> Result<Option<HashMap<String, Vec<u8>>>, CacheError> {
            self.inner.get_hash_subset(hash_key, element_keys).await
        }

        async fn set_hash_subset(
            &self,
            hash_key: &str,
            subset: &HashMap<String, Vec<u8>>,
        ) -> Result<(), CacheError> {
            self.inner.set_hash_subset(hash_key, subset).await
        }

        async fn evict_hash_subset(
            &self,
            hash_key: &str,
            element_keys: &[String],
        ) -> Result<(), CacheError> {
            self.inner.evict_hash_subset(hash_key, element_keys).await
        }

        async fn set_hash_expiry(
            &self,
            hash_key: &str,
            expiry: DateTime<Utc>,
        ) -> Result<(), CacheError> {
            self.inner.set_hash_expiry(hash_key, expiry).await
        }

        async fn cleanup(&self) -> Result<(), CacheError> {
            self.inner.cleanup().await
        }

        async fn flush(&self) -> Result<(), CacheError> {
            self.inner.flush().await
        }

        async fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    /// Observer that records every event it sees, in order.
    #[derive(Default)]
    struct RecordingExtension {
        events: Mutex<Vec<String>>,
    }

    impl RecordingExtension {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl CacheExtension for RecordingExtension {
        async fn register(&self, _stack: &Arc<CacheStack>) -> Result<(), CacheError> {
            self.push("register".to_owned());
            Ok(())
        }

        async fn dispose(&self) -> Result<(), CacheError> {
            self.push("dispose".to_owned());
            Ok(())
        }

        fn change_observer(self: Arc<Self>) -> Option<Arc<dyn crate::CacheChangeObserver>> {
            Some(self)
        }
    }

    #[async_trait]
    impl crate::CacheChangeObserver for RecordingExtension {
        async fn on_cache_update(
            &self,
            hash_key: &str,
            _expiry: Option<DateTime<Utc>>,
            _update_type: CacheUpdateType,
        ) -> Result<(), CacheError> {
            self.push(format!("update:{hash_key}"));
            Ok(())
        }

        async fn on_cache_eviction(&self, hash_key: &str) -> Result<(), CacheError> {
            self.push(format!("evict:{hash_key}"));
            Ok(())
        }

        async fn on_cache_flush(&self) -> Result<(), CacheError> {
            self.push("flush".to_owned());
            Ok(())
        }

        async fn on_hash_element_update(
            &self,
            hash_key: &str,
            element_key: &str,
            _expiry: Option<DateTime<Utc>>,
            _update_type: CacheUpdateType,
        ) -> Result<(), CacheError> {
            self.push(format!("element-update:{hash_key}:{element_key}"));
            Ok(())
        }

        async fn on_hash_element_eviction(
            &self,
            hash_key: &str,
            element_key: &str,
        ) -> Result<(), CacheError> {
            self.push(format!("element-evict:{hash_key}:{element_key}"));
            Ok(())
        }

        async fn on_hash_subset_update(
            &self,
            hash_key: &str,
            element_keys: &[String],
            _expiry: Option<DateTime<Utc>>,
            _update_type: CacheUpdateType,
        ) -> Result<(), CacheError> {
            let mut sorted = element_keys.to_vec();
            sorted.sort();
            self.push(format!("subset-update:{hash_key}:{}", sorted.join(",")));
            Ok(())
        }

        async fn on_hash_subset_eviction(
            &self,
            hash_key: &str,
            element_keys: &[String],
        ) -> Result<(), CacheError> {
            let mut sorted = element_keys.to_vec();
            sorted.sort();
            self.push(format!("subset-evict:{hash_key}:{}", sorted.join(",")));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_construction_requires_a_layer() {
        let result = CacheStack::new(vec![], vec![]).await;
        assert!(matches!(result, Err(CacheError::NoLayers)));
    }

    #[tokio::test]
    async fn test_write_reaches_every_layer() {
        let (stack, near, far) = two_layer_stack().await;

        stack.set_value("k", "a", value("1")).await.unwrap();

        assert_eq!(near.get_value("k", "a").await.unwrap(), Some(value("1")));
        assert_eq!(far.get_value("k", "a").await.unwrap(), Some(value("1")));
    }

    #[tokio::test]
    async fn test_read_back_populates_closer_layers() {
        let (stack, near, far) = two_layer_stack().await;
        far.set_hash("k", &entry_with(&[("a", "1")], None)).await.unwrap();

        let found = stack.get_value("k", "a").await.unwrap();

        assert_eq!(found, Some(value("1")));
        assert_eq!(near.get_value("k", "a").await.unwrap(), Some(value("1")));
    }

    #[tokio::test]
    async fn test_get_hash_returns_entry_and_back_populates() {
        let (stack, near, far) = two_layer_stack().await;
        let expiry = clock::now() + Duration::hours(1);
        let stored = entry_with(&[("a", "1"), ("b", "2")], Some(expiry));
        far.set_hash("k", &stored).await.unwrap();

        let retrieved = stack.get_hash("k").await.unwrap().unwrap();

        assert_eq!(retrieved, stored);
        assert_eq!(near.get_hash("k").await.unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn test_get_miss_returns_none() {
        let (stack, _, _) = two_layer_stack().await;

        assert!(stack.get_value("k", "a").await.unwrap().is_none());
        assert!(stack.get_hash("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_layer_never_back_populates() {
        let near = Arc::new(MemoryCacheLayer::new());
        let stack = CacheStack::new(vec![near.clone()], vec![]).await.unwrap();
        near.set_hash("k", &entry_with(&[("a", "1")], None)).await.unwrap();

        assert_eq!(stack.get_value("k", "a").await.unwrap(), Some(value("1")));
        assert_eq!(near.len(), 1);
    }

    #[tokio::test]
    async fn test_read_skips_unavailable_layer() {
        let flaky = Arc::new(ToggleLayer::new(false));
        let far = Arc::new(MemoryCacheLayer::new());
        let stack = CacheStack::new(vec![flaky.clone(), far.clone()], vec![]).await.unwrap();
        far.set_hash("k", &entry_with(&[("a", "1")], None)).await.unwrap();

        let found = stack.get_value("k", "a").await.unwrap();

        assert_eq!(found, Some(value("1")));
        // The unavailable layer is skipped for back-population as well.
        flaky.set_available(true);
        assert_eq!(flaky.get_value("k", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subset_merges_partial_hits_across_layers() {
        let (stack, near, far) = two_layer_stack().await;
        near.set_hash("k", &entry_with(&[("1", "x")], None)).await.unwrap();
        far.set_hash("k", &entry_with(&[("1", "stale"), ("2", "y"), ("3", "z")], None))
            .await
            .unwrap();

        let result = stack
            .get_hash_subset("k", &keys(&["1", "2", "3", "4"]))
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        // The near layer answered for "1"; the far layer only saw the rest.
        assert_eq!(result.get("1"), Some(&value("x")));
        assert_eq!(result.get("2"), Some(&value("y")));
        assert_eq!(result.get("3"), Some(&value("z")));
        assert!(!result.contains_key("4"));

        // The far layer's contribution was back-populated into the near one.
        assert_eq!(near.get_value("k", "2").await.unwrap(), Some(value("y")));
        assert_eq!(near.get_value("k", "3").await.unwrap(), Some(value("z")));
        // "1" in the near layer was not overwritten by the deeper value.
        assert_eq!(near.get_value("k", "1").await.unwrap(), Some(value("x")));
    }

    #[tokio::test]
    async fn test_subset_full_hit_short_circuits_after_back_population() {
        let (stack, near, far) = two_layer_stack().await;
        far.set_hash("k", &entry_with(&[("1", "x"), ("2", "y")], None)).await.unwrap();

        let result = stack.get_hash_subset("k", &keys(&["1", "2"])).await.unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(near.get_value("k", "1").await.unwrap(), Some(value("x")));
        assert_eq!(near.get_value("k", "2").await.unwrap(), Some(value("y")));
    }

    #[tokio::test]
    async fn test_subset_requested_keys_missing_everywhere_are_omitted() {
        let (stack, _, far) = two_layer_stack().await;
        far.set_hash("k", &entry_with(&[("1", "x"), ("2", "y"), ("3", "z")], None))
            .await
            .unwrap();

        let result = stack.get_hash_subset("k", &keys(&["1", "4"])).await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result.get("1"), Some(&value("x")));
    }

    #[tokio::test]
    async fn test_subset_empty_request_returns_empty() {
        let (stack, _, _) = two_layer_stack().await;

        let result = stack.get_hash_subset("k", &[]).await.unwrap();

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_subset_absent_everywhere_returns_empty() {
        let (stack, _, _) = two_layer_stack().await;

        let result = stack.get_hash_subset("missing", &keys(&["a"])).await.unwrap();

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_evictions_reach_every_layer() {
        let (stack, near, far) = two_layer_stack().await;
        stack.set_hash("k", &entry_with(&[("a", "1"), ("b", "2")], None)).await.unwrap();

        stack.evict_value("k", "a").await.unwrap();
        assert_eq!(near.get_value("k", "a").await.unwrap(), None);
        assert_eq!(far.get_value("k", "a").await.unwrap(), None);

        stack.evict_hash("k").await.unwrap();
        assert!(near.get_hash("k").await.unwrap().is_none());
        assert!(far.get_hash("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_then_evict_subset() {
        let (stack, near, _) = two_layer_stack().await;
        let mut subset = HashMap::new();
        subset.insert("a".to_owned(), value("1"));
        subset.insert("b".to_owned(), value("2"));
        stack.set_hash_subset("k", &subset).await.unwrap();

        stack.evict_hash_subset("k", &keys(&["a"])).await.unwrap();

        assert_eq!(near.get_value("k", "a").await.unwrap(), None);
        assert_eq!(near.get_value("k", "b").await.unwrap(), Some(value("2")));
    }

    #[tokio::test]
    async fn test_flush_clears_every_layer() {
        let (stack, near, far) = two_layer_stack().await;
        stack.set_value("k", "a", value("1")).await.unwrap();

        FlushableCache::flush(stack.as_ref()).await.unwrap();

        assert!(near.is_empty());
        assert!(far.is_empty());
    }

    #[tokio::test]
    async fn test_set_hash_expiry_applies_everywhere_without_event() {
        let extension = Arc::new(RecordingExtension::default());
        let near = Arc::new(MemoryCacheLayer::new());
        let stack = CacheStack::new(vec![near.clone()], vec![extension.clone()]).await.unwrap();
        near.set_hash("k", &entry_with(&[("a", "1")], None)).await.unwrap();

        let expiry = clock::now() + Duration::hours(1);
        stack.set_hash_expiry("k", expiry).await.unwrap();

        assert_eq!(near.get_hash("k").await.unwrap().unwrap().expiry(), Some(expiry));
        assert_eq!(extension.events(), vec!["register".to_owned()]);
    }

    #[tokio::test]
    async fn test_events_follow_writes() {
        let extension = Arc::new(RecordingExtension::default());
        let near = Arc::new(MemoryCacheLayer::new());
        let stack = CacheStack::new(vec![near], vec![extension.clone()]).await.unwrap();

        stack.set_hash("k", &entry_with(&[("a", "1")], None)).await.unwrap();
        stack.set_value("k", "a", value("2")).await.unwrap();
        let mut subset = HashMap::new();
        subset.insert("b".to_owned(), value("3"));
        stack.set_hash_subset("k", &subset).await.unwrap();
        stack.evict_value("k", "a").await.unwrap();
        stack.evict_hash_subset("k", &keys(&["b"])).await.unwrap();
        stack.evict_hash("k").await.unwrap();
        FlushableCache::flush(stack.as_ref()).await.unwrap();

        assert_eq!(
            extension.events(),
            vec![
                "register".to_owned(),
                "update:k".to_owned(),
                "element-update:k:a".to_owned(),
                "subset-update:k:b".to_owned(),
                "element-evict:k:a".to_owned(),
                "subset-evict:k:b".to_owned(),
                "evict:k".to_owned(),
                "flush".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_blocks_operations() {
        let extension = Arc::new(RecordingExtension::default());
        let stack = CacheStack::new(
            vec![Arc::new(MemoryCacheLayer::new())],
            vec![extension.clone()],
        )
        .await
        .unwrap();

        stack.dispose().await.unwrap();
        stack.dispose().await.unwrap();

        assert_eq!(extension.events(), vec!["register".to_owned(), "dispose".to_owned()]);
        assert!(matches!(stack.get_value("k", "a").await, Err(CacheError::Disposed)));
        assert!(matches!(
            stack.set_value("k", "a", value("1")).await,
            Err(CacheError::Disposed)
        ));
        assert!(matches!(stack.cleanup().await, Err(CacheError::Disposed)));
        assert!(matches!(
            FlushableCache::flush(stack.as_ref()).await,
            Err(CacheError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_empty_keys_are_rejected_before_io() {
        let (stack, near, _) = two_layer_stack().await;

        assert!(matches!(
            stack.get_value("", "a").await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            stack.set_value("k", "", value("1")).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            stack.get_hash_subset("k", &keys(&[""])).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(near.is_empty());
    }

    #[tokio::test]
    async fn test_expired_hash_reads_absent_through_stack() {
        let (stack, _, far) = two_layer_stack().await;
        far.set_hash(
            "k",
            &entry_with(&[("a", "1")], Some(clock::now() - Duration::seconds(1))),
        )
        .await
        .unwrap();

        assert!(stack.get_hash("k").await.unwrap().is_none());
        assert!(stack.get_value("k", "a").await.unwrap().is_none());
    }
}
