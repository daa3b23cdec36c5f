use crate::decision::DecisionEntry;
use crate::error::Result;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};

#[derive(Debug, Clone)]
pub struct SharedCacheConfig {
    pub url: String,
    /// Pub/sub channel tenant invalidations are broadcast on.
    pub channel: String,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            channel: "warden:decision:invalidate".to_string(),
        }
    }
}

impl SharedCacheConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| Self::default().url),
            channel: std::env::var("WARDEN_INVALIDATION_CHANNEL")
                .unwrap_or_else(|_| Self::default().channel),
        }
    }
}

/// Redis tier shared across processes. Optional: absence only lowers the hit
/// rate, never correctness.
#[derive(Clone)]
pub struct SharedCache {
    client: Client,
    manager: ConnectionManager,
    channel: String,
}

impl SharedCache {
    pub async fn connect(config: SharedCacheConfig) -> Result<Self> {
        let client = Client::open(config.url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            manager,
            channel: config.channel,
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<DecisionEntry>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, entry: &DecisionEntry, ttl_seconds: u64) -> Result<()> {
        let serialized = serde_json::to_string(entry)?;
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, serialized, ttl_seconds.max(1))
            .await?;
        Ok(())
    }

    /// Delete all keys matching a pattern; returns how many were removed.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len() as u64;
        conn.del::<_, ()>(keys).await?;
        Ok(count)
    }

    /// Broadcast a tenant invalidation so sibling processes drop their
    /// in-process entries.
    pub async fn publish_invalidation(&self, tenant_id: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(&self.channel, tenant_id).await?;
        Ok(())
    }

    /// Subscribe to invalidation broadcasts. Runs until the connection
    /// drops; callers spawn it on their runtime.
    pub async fn subscribe_invalidations<F>(&self, on_tenant: F) -> Result<()>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            match message.get_payload::<String>() {
                Ok(tenant_id) => on_tenant(tenant_id),
                Err(err) => tracing::debug!("invalidation payload decode failed: {}", err),
            }
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Only run with Redis available
    async fn test_redis_connection() {
        let cache = SharedCache::connect(SharedCacheConfig::from_env())
            .await
            .expect("Failed to connect to Redis");
        cache.ping().await.expect("Failed to ping Redis");
    }

    #[tokio::test]
    #[ignore]
    async fn test_set_get_delete() {
        let cache = SharedCache::connect(SharedCacheConfig::from_env())
            .await
            .unwrap();
        let entry = DecisionEntry {
            allowed: true,
            revision: 7,
            created_at_ms: 0,
            ttl_ms: 60_000,
        };
        cache.set("warden:test:key", &entry, 60).await.unwrap();
        let read = cache.get("warden:test:key").await.unwrap().unwrap();
        assert_eq!(read.revision, 7);
        cache.delete_pattern("warden:test:*").await.unwrap();
        assert!(cache.get("warden:test:key").await.unwrap().is_none());
    }
}
