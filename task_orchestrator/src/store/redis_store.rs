//! Redis-backed registry store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, instrument};

use super::RegistryStore;
use crate::registry::CapabilityCard;

/// Stores the whole card list as one JSON document under `key`, refreshed with
/// a TTL on every save.
#[derive(Debug)]
pub struct RedisRegistryStore {
    pool: Pool<RedisConnectionManager>,
    key: String,
    ttl_seconds: u64,
}

impl RedisRegistryStore {
    pub async fn new(redis_url: &str, key: &str, ttl_seconds: u64) -> Result<Self> {
        let manager = RedisConnectionManager::new(redis_url)?;
        let pool = Pool::builder().max_size(10).build(manager).await?;

        // Test connection
        let _conn = pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to connect to Redis: {}", e))?;

        info!("Connected to Redis registry store at {}", redis_url);

        Ok(Self {
            pool,
            key: key.to_string(),
            ttl_seconds,
        })
    }
}

#[async_trait]
impl RegistryStore for RedisRegistryStore {
    #[instrument(skip(self))]
    async fn load(&self) -> Result<Vec<CapabilityCard>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;

        let raw: Option<String> = conn
            .get(&self.key)
            .await
            .map_err(|e| anyhow!("Failed to read Redis key '{}': {}", self.key, e))?;

        match raw {
            Some(json) => {
                let cards: Vec<CapabilityCard> = serde_json::from_str(&json)
                    .map_err(|e| anyhow!("Failed to deserialize agent cards: {}", e))?;
                debug!("Loaded {} card(s) from Redis key '{}'", cards.len(), self.key);
                Ok(cards)
            }
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self, cards))]
    async fn save(&self, cards: &[CapabilityCard]) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;

        let json = serde_json::to_string(cards)
            .map_err(|e| anyhow!("Failed to serialize agent cards: {}", e))?;

        let _: () = conn
            .set_ex(&self.key, json, self.ttl_seconds)
            .await
            .map_err(|e| anyhow!("Failed to set Redis key '{}': {}", self.key, e))?;

        Ok(())
    }
}
