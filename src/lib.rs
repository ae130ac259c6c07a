//! cachestack - multi-layer hierarchical caching library
//!
//! This library composes an ordered stack of cache layers (fast in-process →
//! slower shared Redis) behind a single read-through/write-through facade.
//!
//! The cache exposes two flavours of entity:
//! - Hash entries: a named collection of element-key → value pairs under one
//!   top-level key, sharing a single expiry
//! - Per-element access: read, write and evict individual elements of a hash
//!
//! The stack supports:
//! - Automatic fallback between layers with back-population on hit
//! - Partial subset reads merged across layers
//! - Redis pub/sub invalidation across processes, with echo suppression so a
//!   node never evicts data it just wrote
//! - Periodic background compaction of expired entries
//!
//! Values are opaque encoded bytes produced by a pluggable [`Codec`].

mod clock;
mod config;
mod error;

pub mod cleanup;
pub mod codec;
pub mod entry;
pub mod extensions;
pub mod layer;
pub mod memory_layer;
pub mod redis_layer;
pub mod remote_eviction;
pub mod stack;

pub use cleanup::AutoCleanupExtension;
pub use codec::{Codec, JsonCodec};
pub use config::RemoteEvictionConfig;
pub use entry::{CacheEntry, CacheSetEntry};
pub use error::CacheError;
pub use extensions::{
    CacheChangeObserver, CacheExtension, CacheUpdateType, ExtensionContainer,
};
pub use layer::CacheLayer;
pub use memory_layer::MemoryCacheLayer;
pub use redis_layer::RedisCacheLayer;
pub use remote_eviction::{HashKeyEvictionMessage, RedisRemoteEvictionExtension};
pub use stack::{CacheStack, FlushableCache};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
