//! Remote eviction over Redis pub/sub
//!
//! Bridges a stack's mutation events onto a pub/sub bus so that peer
//! processes sharing the same Redis database drop their stale local copies.
//! Three channels are derived from a configurable prefix:
//!
//! - `<prefix>.RemoteEviction`: payload is the affected cache key.
//! - `<prefix>.RemoteFlush`: empty payload.
//! - `<prefix>.RemoteHashKeyEviction`: an encoded [`HashKeyEvictionMessage`].
//!
//! A node must not evict data it just wrote when its own publish is echoed
//! back by the broker. Before publishing, the key/message is inserted into a
//! flag set; on receipt, a successful removal from that set identifies the
//! event as our own echo and suppresses it. Suppression is best-effort: it
//! assumes the broker delivers a self-publish back after the flag insert,
//! which holds for Redis pub/sub in practice but is not a guarantee.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::RemoteEvictionConfig;
use crate::error::CacheError;
use crate::extensions::{CacheChangeObserver, CacheExtension, CacheUpdateType};
use crate::layer::CacheLayer;
use crate::stack::CacheStack;

/// Element-grain eviction event as carried on the wire.
///
/// Element-key order is preserved on the wire and in the decoded message,
/// but equality and hashing are order-independent over the set of element
/// keys, so permuted self-flags deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashKeyEvictionMessage {
    hash_table_key: String,
    element_keys: Vec<String>,
}

impl HashKeyEvictionMessage {
    pub fn new(hash_table_key: impl Into<String>, element_keys: Vec<String>) -> Self {
        Self {
            hash_table_key: hash_table_key.into(),
            element_keys,
        }
    }

    pub fn hash_table_key(&self) -> &str {
        &self.hash_table_key
    }

    pub fn element_keys(&self) -> &[String] {
        &self.element_keys
    }

    fn key_set(&self) -> HashSet<&str> {
        self.element_keys.iter().map(String::as_str).collect()
    }
}

impl PartialEq for HashKeyEvictionMessage {
    fn eq(&self, other: &Self) -> bool {
        self.hash_table_key == other.hash_table_key && self.key_set() == other.key_set()
    }
}

impl Eq for HashKeyEvictionMessage {}

impl Hash for HashKeyEvictionMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_table_key.hash(state);
        // XOR of per-key hashes over the deduplicated set is commutative,
        // keeping the hash consistent with the order-independent equality.
        let mut combined = 0_u64;
        for element_key in self.key_set() {
            let mut hasher = DefaultHasher::new();
            element_key.hash(&mut hasher);
            combined ^= hasher.finish();
        }
        state.write_u64(combined);
    }
}

/// Channel names derived from the configured prefix.
#[derive(Debug, Clone)]
struct EvictionChannels {
    eviction: String,
    flush: String,
    hash_eviction: String,
}

impl EvictionChannels {
    fn new(prefix: &str) -> Self {
        Self {
            eviction: format!("{prefix}.RemoteEviction"),
            flush: format!("{prefix}.RemoteFlush"),
            hash_eviction: format!("{prefix}.RemoteHashKeyEviction"),
        }
    }
}

#[derive(Debug, Default)]
struct FlagState {
    evictions: HashSet<String>,
    messages: HashSet<HashKeyEvictionMessage>,
    flush_triggered: bool,
}

/// Self-publish markers, one-shot per publish. The mutex is held only for
/// the insert/remove itself, never while calling a layer or awaiting.
#[derive(Debug, Default)]
struct EvictionFlags {
    state: Mutex<FlagState>,
}

impl EvictionFlags {
    fn flag_eviction(&self, hash_key: &str) {
        self.state.lock().evictions.insert(hash_key.to_owned());
    }

    /// Consume a flagged whole-key eviction; true means the incoming event
    /// was our own echo.
    fn try_consume_eviction(&self, hash_key: &str) -> bool {
        self.state.lock().evictions.remove(hash_key)
    }

    fn flag_message(&self, message: HashKeyEvictionMessage) {
        self.state.lock().messages.insert(message);
    }

    fn try_consume_message(&self, message: &HashKeyEvictionMessage) -> bool {
        self.state.lock().messages.remove(message)
    }

    fn trigger_flush(&self) {
        self.state.lock().flush_triggered = true;
    }

    /// Read and clear the flush flag; true means the incoming flush was ours.
    fn try_consume_flush(&self) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.flush_triggered, false)
    }
}

struct EvictionInner<C: Codec> {
    client: redis::Client,
    channels: EvictionChannels,
    layers: Vec<Arc<dyn CacheLayer>>,
    codec: C,
    flags: EvictionFlags,
    publish_conn: RwLock<Option<ConnectionManager>>,
}

impl<C: Codec> EvictionInner<C> {
    /// Fire-and-forget publish; delivery is best-effort by design.
    async fn publish(&self, channel: &str, payload: Vec<u8>) {
        let conn = self.publish_conn.read().clone();
        let Some(mut conn) = conn else {
            warn!(channel, "publish before registration, dropping event");
            return;
        };
        if let Err(e) = conn.publish::<_, _, ()>(channel, payload).await {
            warn!(channel, "publish failed: {}", e);
        }
    }

    async fn publish_key_eviction(&self, hash_key: &str) {
        self.flags.flag_eviction(hash_key);
        self.publish(&self.channels.eviction, hash_key.as_bytes().to_vec()).await;
    }

    async fn publish_hash_eviction(
        &self,
        message: HashKeyEvictionMessage,
    ) -> Result<(), CacheError> {
        let payload = self.codec.encode(&message)?;
        self.flags.flag_message(message);
        self.publish(&self.channels.hash_eviction, payload).await;
        Ok(())
    }

    async fn publish_flush(&self) {
        self.flags.trigger_flush();
        self.publish(&self.channels.flush, Vec::new()).await;
    }

    /// Whole-key eviction received from the bus.
    async fn handle_eviction(&self, hash_key: &str) {
        if self.flags.try_consume_eviction(hash_key) {
            debug!(hash_key, "suppressed own eviction echo");
            return;
        }
        for layer in &self.layers {
            if let Err(e) = layer.evict_hash(hash_key).await {
                warn!(hash_key, "remote eviction failed on a layer: {}", e);
            }
        }
    }

    /// Element-grain eviction received from the bus.
    async fn handle_hash_eviction(&self, payload: &[u8]) {
        let message: HashKeyEvictionMessage = match self.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable hash eviction payload: {}", e);
                return;
            }
        };
        if self.flags.try_consume_message(&message) {
            debug!(
                hash_key = message.hash_table_key(),
                "suppressed own hash eviction echo"
            );
            return;
        }
        for layer in &self.layers {
            if let Err(e) = layer
                .evict_hash_subset(message.hash_table_key(), message.element_keys())
                .await
            {
                warn!(
                    hash_key = message.hash_table_key(),
                    "remote hash eviction failed on a layer: {}", e
                );
            }
        }
    }

    /// Flush received from the bus.
    async fn handle_flush(&self) {
        if self.flags.try_consume_flush() {
            debug!("suppressed own flush echo");
            return;
        }
        for layer in &self.layers {
            if let Err(e) = layer.flush().await {
                warn!("remote flush failed on a layer: {}", e);
            }
        }
    }

    async fn dispatch(&self, msg: redis::Msg) {
        let channel = msg.get_channel_name();
        if channel == self.channels.eviction {
            match msg.get_payload::<String>() {
                Ok(hash_key) => self.handle_eviction(&hash_key).await,
                Err(e) => warn!(channel, "undecodable payload: {}", e),
            }
        } else if channel == self.channels.hash_eviction {
            match msg.get_payload::<Vec<u8>>() {
                Ok(payload) => self.handle_hash_eviction(&payload).await,
                Err(e) => warn!(channel, "undecodable payload: {}", e),
            }
        } else if channel == self.channels.flush {
            self.handle_flush().await;
        } else {
            debug!(channel, "message on unexpected channel");
        }
    }
}

/// Extension that mirrors local mutations onto the pub/sub bus and applies
/// peer events to the designated local layers.
///
/// The designated layers are the local tiers whose copies would otherwise go
/// stale, typically every in-memory layer of the stack, never the shared
/// Redis layer itself (the mutating peer already wrote it).
pub struct RedisRemoteEvictionExtension<C: Codec = JsonCodec> {
    inner: Arc<EvictionInner<C>>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    registered: AtomicBool,
}

impl RedisRemoteEvictionExtension<JsonCodec> {
    /// Create an extension using the JSON codec for wire payloads.
    pub fn new(
        client: redis::Client,
        layers: Vec<Arc<dyn CacheLayer>>,
        config: RemoteEvictionConfig,
    ) -> Self {
        Self::with_codec(client, layers, config, JsonCodec)
    }
}

impl<C: Codec> RedisRemoteEvictionExtension<C> {
    /// Create an extension with a custom codec.
    ///
    /// No connection is made until the extension is registered with a stack.
    pub fn with_codec(
        client: redis::Client,
        layers: Vec<Arc<dyn CacheLayer>>,
        config: RemoteEvictionConfig,
        codec: C,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(EvictionInner {
                client,
                channels: EvictionChannels::new(&config.channel_prefix),
                layers,
                codec,
                flags: EvictionFlags::default(),
                publish_conn: RwLock::new(None),
            }),
            shutdown_tx,
            task: tokio::sync::Mutex::new(None),
            registered: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<C: Codec> CacheExtension for RedisRemoteEvictionExtension<C> {
    async fn register(&self, _stack: &Arc<CacheStack>) -> Result<(), CacheError> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(CacheError::AlreadyRegistered);
        }

        let conn = ConnectionManager::new(self.inner.client.clone()).await?;
        *self.inner.publish_conn.write() = Some(conn);

        let mut pubsub = self.inner.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.inner.channels.eviction).await?;
        pubsub.subscribe(&self.inner.channels.flush).await?;
        pubsub.subscribe(&self.inner.channels.hash_eviction).await?;
        debug!(
            eviction = %self.inner.channels.eviction,
            flush = %self.inner.channels.flush,
            hash_eviction = %self.inner.channels.hash_eviction,
            "subscribed to eviction channels"
        );

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            warn!("eviction subscription stream closed");
                            break;
                        };
                        inner.dispatch(msg).await;
                    }
                }
            }
            debug!("eviction listener exited");
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), CacheError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("eviction listener task failed: {}", e);
            }
        }
        Ok(())
    }

    fn change_observer(self: Arc<Self>) -> Option<Arc<dyn CacheChangeObserver>> {
        Some(self)
    }
}

#[async_trait]
impl<C: Codec> CacheChangeObserver for RedisRemoteEvictionExtension<C> {
    async fn on_cache_update(
        &self,
        hash_key: &str,
        _expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        if !matches!(update_type, CacheUpdateType::AddOrUpdateEntry) {
            return Ok(());
        }
        self.inner.publish_key_eviction(hash_key).await;
        Ok(())
    }

    async fn on_cache_eviction(&self, hash_key: &str) -> Result<(), CacheError> {
        self.inner.publish_key_eviction(hash_key).await;
        Ok(())
    }

    async fn on_cache_flush(&self) -> Result<(), CacheError> {
        self.inner.publish_flush().await;
        Ok(())
    }

    async fn on_hash_element_update(
        &self,
        hash_key: &str,
        element_key: &str,
        _expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        if !matches!(update_type, CacheUpdateType::AddOrUpdateEntry) {
            return Ok(());
        }
        self.inner
            .publish_hash_eviction(HashKeyEvictionMessage::new(
                hash_key,
                vec![element_key.to_owned()],
            ))
            .await
    }

    async fn on_hash_element_eviction(
        &self,
        hash_key: &str,
        element_key: &str,
    ) -> Result<(), CacheError> {
        self.inner
            .publish_hash_eviction(HashKeyEvictionMessage::new(
                hash_key,
                vec![element_key.to_owned()],
            ))
            .await
    }

    async fn on_hash_subset_update(
        &self,
        hash_key: &str,
        element_keys: &[String],
        _expiry: Option<DateTime<Utc>>,
        update_type: CacheUpdateType,
    ) -> Result<(), CacheError> {
        if !matches!(update_type, CacheUpdateType::AddOrUpdateEntry) {
            return Ok(());
        }
        self.inner
            .publish_hash_eviction(HashKeyEvictionMessage::new(hash_key, element_keys.to_vec()))
            .await
    }

    async fn on_hash_subset_eviction(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<(), CacheError> {
        self.inner
            .publish_hash_eviction(HashKeyEvictionMessage::new(hash_key, element_keys.to_vec()))
            .await
    }
}
