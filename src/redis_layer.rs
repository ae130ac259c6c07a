//! Redis cache layer
//!
//! The shared tier of a stack. Each logical hash with key `K` is persisted
//! as two physical records: `K:hash`, the Redis hash of element key to
//! encoded value, and `K:info`, an encoded metadata record carrying the
//! logical expiry. Both carry the same TTL and are written and removed
//! under `MULTI`/`EXEC` so readers observe either both records or neither.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock;
use crate::codec::{Codec, JsonCodec};
use crate::entry::CacheSetEntry;
use crate::error::CacheError;
use crate::layer::CacheLayer;

/// Metadata record stored beside the hash data.
#[derive(Debug, Serialize, Deserialize)]
struct HashInfoRecord {
    expiry: Option<DateTime<Utc>>,
}

/// Redis-backed cache layer.
///
/// Availability is a `PING` round-trip; reads through the stack skip this
/// layer while the connection is down.
pub struct RedisCacheLayer<C: Codec = JsonCodec> {
    conn: ConnectionManager,
    codec: C,
}

impl RedisCacheLayer<JsonCodec> {
    /// Connect a layer using the JSON codec.
    pub async fn new(client: redis::Client) -> Result<Self, CacheError> {
        Self::with_codec(client, JsonCodec).await
    }
}

impl<C: Codec> RedisCacheLayer<C> {
    /// Connect a layer with a custom codec.
    pub async fn with_codec(client: redis::Client, codec: C) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, codec })
    }

    fn data_key(hash_key: &str) -> String {
        format!("{hash_key}:hash")
    }

    fn info_key(hash_key: &str) -> String {
        format!("{hash_key}:info")
    }

    /// Run an atomic pipeline; a nil `EXEC` reply means the transaction was
    /// not committed.
    async fn exec(&self, pipe: &redis::Pipeline) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let response: redis::Value = pipe.query_async(&mut conn).await?;
        if matches!(response, redis::Value::Nil) {
            return Err(CacheError::TransactionRejected);
        }
        Ok(())
    }

    /// Seconds until `expiry`, if it is still in the future.
    fn ttl_seconds(expiry: DateTime<Utc>) -> Option<i64> {
        let seconds = (clock::floor_to_second(expiry) - clock::now()).num_seconds();
        (seconds > 0).then_some(seconds)
    }
}

#[async_trait]
impl<C: Codec> CacheLayer for RedisCacheLayer<C> {
    async fn get_value(
        &self,
        hash_key: &str,
        element_key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(Self::data_key(hash_key))
            .arg(element_key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_value(
        &self,
        hash_key: &str,
        element_key: &str,
        value: Vec<u8>,
    ) -> Result<(), CacheError> {
        // No TTL here: the TTL attached by a prior set_hash governs the
        // whole structure. A fresh key gets an entry without expiry.
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(Self::data_key(hash_key))
            .arg(element_key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn evict_value(&self, hash_key: &str, element_key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("HDEL")
            .arg(Self::data_key(hash_key))
            .arg(element_key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_hash(&self, hash_key: &str) -> Result<Option<CacheSetEntry>, CacheError> {
        let mut conn = self.conn.clone();
        let (elements, info): (HashMap<String, Vec<u8>>, Option<Vec<u8>>) = redis::pipe()
            .atomic()
            .hgetall(Self::data_key(hash_key))
            .get(Self::info_key(hash_key))
            .query_async(&mut conn)
            .await?;

        if elements.is_empty() {
            return Ok(None);
        }

        let expiry = match info {
            Some(bytes) => self.codec.decode::<HashInfoRecord>(&bytes)?.expiry,
            None => None,
        };
        Ok(Some(CacheSetEntry::with_elements(elements, expiry)))
    }

    async fn set_hash(&self, hash_key: &str, entry: &CacheSetEntry) -> Result<(), CacheError> {
        let ttl = match entry.expiry() {
            Some(expiry) => match Self::ttl_seconds(expiry) {
                Some(seconds) => Some(seconds),
                None => {
                    // Already expired; nothing to persist.
                    debug!(hash_key, "skipping write of expired hash");
                    return Ok(());
                }
            },
            None => None,
        };

        let data_key = Self::data_key(hash_key);
        let info_key = Self::info_key(hash_key);
        let info = self.codec.encode(&HashInfoRecord { expiry: entry.expiry() })?;
        let elements = entry.to_map();

        let mut pipe = redis::pipe();
        pipe.atomic();
        // Clear the raw top-level key and any previous hash data so the
        // write replaces the entry wholesale.
        pipe.cmd("DEL").arg(hash_key).arg(&data_key).ignore();
        match ttl {
            Some(seconds) => {
                pipe.cmd("SET").arg(&info_key).arg(&info).arg("EX").arg(seconds).ignore();
            }
            None => {
                pipe.cmd("SET").arg(&info_key).arg(&info).ignore();
            }
        }
        if !elements.is_empty() {
            let mut hset = redis::cmd("HSET");
            hset.arg(&data_key);
            for (element_key, value) in &elements {
                hset.arg(element_key).arg(value);
            }
            pipe.add_command(hset).ignore();
        }
        if let Some(seconds) = ttl {
            pipe.cmd("EXPIRE").arg(&data_key).arg(seconds).ignore();
        }

        self.exec(&pipe).await
    }

    async fn evict_hash(&self, hash_key: &str) -> Result<(), CacheError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL")
            .arg(Self::data_key(hash_key))
            .arg(Self::info_key(hash_key))
            .ignore();
        self.exec(&pipe).await
    }

    async fn get_hash_subset(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<Option<HashMap<String, Vec<u8>>>, CacheError> {
        if element_keys.is_empty() {
            return Ok(Some(HashMap::new()));
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(Self::data_key(hash_key))
            .arg(element_keys)
            .query_async(&mut conn)
            .await?;

        // A missing field (or a missing hash altogether) comes back as nil
        // per requested key; those are absent, not part of the result.
        let mut found = HashMap::new();
        for (element_key, value) in element_keys.iter().zip(values) {
            if let Some(value) = value {
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
        if subset.is_empty() {
            return Ok(());
        }

        let data_key = Self::data_key(hash_key);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (element_key, value) in subset {
            pipe.cmd("HSET").arg(&data_key).arg(element_key).arg(value).ignore();
        }
        self.exec(&pipe).await
    }

    async fn evict_hash_subset(
        &self,
        hash_key: &str,
        element_keys: &[String],
    ) -> Result<(), CacheError> {
        if element_keys.is_empty() {
            return Ok(());
        }

        let data_key = Self::data_key(hash_key);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for element_key in element_keys {
            pipe.cmd("HDEL").arg(&data_key).arg(element_key).ignore();
        }
        self.exec(&pipe).await
    }

    async fn set_hash_expiry(
        &self,
        hash_key: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let data_key = Self::data_key(hash_key);
        let info_key = Self::info_key(hash_key);

        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS").arg(&data_key).query_async(&mut conn).await?;
        if !exists {
            return Ok(());
        }

        let expiry = clock::floor_to_second(expiry);
        let mut pipe = redis::pipe();
        pipe.atomic();
        match Self::ttl_seconds(expiry) {
            Some(seconds) => {
                let info = self.codec.encode(&HashInfoRecord { expiry: Some(expiry) })?;
                pipe.cmd("SET").arg(&info_key).arg(&info).arg("EX").arg(seconds).ignore();
                pipe.cmd("EXPIRE").arg(&data_key).arg(seconds).ignore();
            }
            None => {
                // A TTL that has already passed is an immediate expiry.
                pipe.cmd("DEL").arg(&data_key).arg(&info_key).ignore();
            }
        }
        self.exec(&pipe).await
    }

    async fn cleanup(&self) -> Result<(), CacheError> {
        // Redis expires keys on its own.
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        let mut conn = self.conn.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Redis layer unavailable: {}", e);
                false
            }
        }
    }
}
