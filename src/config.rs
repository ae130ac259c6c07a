//! Extension configuration

/// Configuration for the remote-eviction extension.
#[derive(Debug, Clone)]
pub struct RemoteEvictionConfig {
    /// Prefix from which the pub/sub channel names are derived. Every process
    /// sharing one Redis database must use the same prefix to stay coherent.
    pub channel_prefix: String,
}

impl Default for RemoteEvictionConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "CacheTower".to_owned(),
        }
    }
}

impl RemoteEvictionConfig {
    /// Create a configuration with a custom channel prefix.
    pub fn with_prefix(channel_prefix: impl Into<String>) -> Self {
        Self {
            channel_prefix: channel_prefix.into(),
        }
    }
}
