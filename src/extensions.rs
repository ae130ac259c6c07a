//! Cache extensions
//!
//! Extensions observe the lifecycle and mutations of a cache stack. The
//! stack owns an [`ExtensionContainer`] which registers every extension
//! exactly once and fans mutation events out to the change observers,
//! sequentially, in registration order. An observer error propagates out of
//! the stack call that triggered the event.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CacheError;
use crate::stack::CacheStack;

/// The kind of mutation an update event describes.
///
/// Only [`CacheUpdateType::AddOrUpdateEntry`] triggers remote invalidation;
/// further variants are reserved for extension authors.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheUpdateType {
    AddOrUpdateEntry,
}

/// An extension participating in a cache stack's lifecycle.
///
/// Registration is one-to-one: an extension instance binds to exactly one
/// stack, and single-instance extensions fail a second `register`.
#[async_trait]
pub trait CacheExtension: Send + Sync {
    /// Called once when the owning stack is constructed. Extensions that
    /// need the stack later (for example to drive periodic maintenance)
    /// should hold a `Weak` reference, never a strong one.
    async fn register(&self, stack: &Arc<CacheStack>) -> Result<(), CacheError>;

    /// Called when the owning stack is disposed.
    async fn dispose(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// The change-notification view of this extension, if it observes
    /// mutations.
    fn change_observer(self: Arc<Self>) -> Option<Arc<dyn CacheChangeObserver>> {
        None
    }
}

/// Mutation events emitted by the cache stack after a write has been applied
/// to every layer.
#[async_trait]
pub trait CacheChangeObserver: Send + Sync {
    /// A whole hash was written.
    async fn on_cache_update(
        &self,
        hash_key: &str,
        expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        let _ = (hash_key, expiry, update_type);
        Ok(())
    }

    /// A whole hash was evicted.
    async fn on_cache_eviction(&self, hash_key: &str) -> Result<(), CacheError> {
        let _ = hash_key;
        Ok(())
    }

    /// Every layer was flushed.
    async fn on_cache_flush(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// One element of a hash was written.
    async fn on_hash_element_update(
        &self,
        hash_key: &str,
        element_key: &str,
        expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        let _ = (hash_key, element_key, expiry, update_type);
        Ok(())
    }

    /// One element of a hash was evicted.
    async fn on_hash_element_eviction(
        &self,
        hash_key: &str,
        element_key: &str,
    ) -> Result<(), CacheError> {
        let _ = (hash_key, element_key);
        Ok(())
    }

    /// A batch of elements was written.
    async fn on_hash_subset_update(
        &self,
        hash_key: &str,
        element_keys: &[String],
        expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        let _ = (hash_key, element_keys, expiry, update_type);
        Ok(())
    }

    /// A batch of elements was evicted.
    async fn on_hash_subset_eviction(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<(), CacheError> {
        let _ = (hash_key, element_keys);
        Ok(())
    }
}

/// Owns the registered extensions and dispatches events to the subset that
/// observes changes.
pub struct ExtensionContainer {
    extensions: Vec<Arc<dyn CacheExtension>>,
    observers: Vec<Arc<dyn CacheChangeObserver>>,
}

impl ExtensionContainer {
    pub fn new(extensions: Vec<Arc<dyn CacheExtension>>) -> Self {
        let observers = extensions
            .iter()
            .filter_map(|extension| Arc::clone(extension).change_observer())
            .collect();
        Self {
            extensions,
            observers,
        }
    }

    /// Number of registered extensions.
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub(crate) async fn register(&self, stack: &Arc<CacheStack>) -> Result<(), CacheError> {
        for extension in &self.extensions {
            extension.register(stack).await?;
        }
        Ok(())
    }

    pub(crate) async fn dispose(&self) -> Result<(), CacheError> {
        for extension in &self.extensions {
            extension.dispose().await?;
        }
        Ok(())
    }

    pub(crate) async fn on_cache_update(
        &self,
        hash_key: &str,
        expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        for observer in &self.observers {
            observer.on_cache_update(hash_key, expiry, update_type).await?;
        }
        Ok(())
    }

    pub(crate) async fn on_cache_eviction(&self, hash_key: &str) -> Result<(), CacheError> {
        for observer in &self.observers {
            observer.on_cache_eviction(hash_key).await?;
        }
        Ok(())
    }

    pub(crate) async fn on_cache_flush(&self) -> Result<(), CacheError> {
        for observer in &self.observers {
            observer.on_cache_flush().await?;
        }
        Ok(())
    }

    pub(crate) async fn on_hash_element_update(
        &self,
        hash_key: &str,
        element_key: &str,
        expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        for observer in &self.observers {
            observer
                .on_hash_element_update(hash_key, element_key, expiry, update_type)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn on_hash_element_eviction(
        &self,
        hash_key: &str,
        element_key: &str,
    ) -> Result<(), CacheError> {
        for observer in &self.observers {
            observer.on_hash_element_eviction(hash_key, element_key).await?;
        }
        Ok(())
    }

    pub(crate) async fn on_hash_subset_update(
        &self,
        hash_key: &str,
        element_keys: &[String],
        expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        for observer in &self.observers {
            observer
                .on_hash_subset_update(hash_key, element_keys, expiry, update_type)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn on_hash_subset_eviction(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<(), CacheError> {
        for observer in &self.observers {
            observer.on_hash_subset_eviction(hash_key, element_keys).await?;
        }
        Ok(())
    }
}
