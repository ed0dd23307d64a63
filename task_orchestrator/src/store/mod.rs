/*!
Registry persistence back-ends:

* **InMemoryRegistryStore** – in-process copy of the card list (good for dev/testing).
* **RedisRegistryStore** – one JSON value under a configurable key with a TTL
  (feature `with-redis`).

[`PersistentRegistry`] wraps a [`CapabilityRegistry`] and a store, and only writes
back when something actually changed.
*/

#[cfg(feature = "with-redis")]
pub mod redis_store;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::registry::{
    AgentMatch, CapabilityCard, CapabilityRegistry, FindAgentQuery, HealthStatus, ListFilter,
    RegistryStats,
};
use crate::settings::RegistryConfig;

/// Full-set persistence for capability cards.
#[async_trait]
pub trait RegistryStore: Send + Sync + std::fmt::Debug {
    /// Every stored card, empty if nothing was saved yet
    async fn load(&self) -> Result<Vec<CapabilityCard>>;

    /// Replace the stored set
    async fn save(&self, cards: &[CapabilityCard]) -> Result<()>;
}

/// Non-durable store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryRegistryStore {
    cards: Mutex<Vec<CapabilityCard>>,
    saves: AtomicUsize,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cards(cards: Vec<CapabilityCard>) -> Self {
        Self {
            cards: Mutex::new(cards),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn load(&self) -> Result<Vec<CapabilityCard>> {
        Ok(self.cards.lock().clone())
    }

    async fn save(&self, cards: &[CapabilityCard]) -> Result<()> {
        *self.cards.lock() = cards.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Build the store selected by configuration.
pub async fn from_config(config: &RegistryConfig) -> Result<Arc<dyn RegistryStore>> {
    match config.store.as_str() {
        "memory" => Ok(Arc::new(InMemoryRegistryStore::new())),
        #[cfg(feature = "with-redis")]
        "redis" => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow!("Redis store requires registry.redis_url"))?;
            let store =
                redis_store::RedisRegistryStore::new(url, &config.key, config.ttl_seconds).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "with-redis"))]
        "redis" => Err(anyhow!(
            "Redis store requested but the crate was built without the 'with-redis' feature"
        )),
        other => Err(anyhow!("Unknown registry store: {}", other)),
    }
}

/// Registry plus store with dirty tracking.
///
/// Every mutating call marks the wrapper dirty; [`save`](Self::save) writes
/// through only when dirty. Assumes a single writer.
#[derive(Debug)]
pub struct PersistentRegistry {
    registry: CapabilityRegistry,
    store: Arc<dyn RegistryStore>,
    dirty: AtomicBool,
}

impl PersistentRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            registry: CapabilityRegistry::new(),
            store,
            dirty: AtomicBool::new(false),
        }
    }

    /// In-memory registry with an in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRegistryStore::new()))
    }

    /// Populate the registry from the store. Returns the number of cards loaded.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<usize> {
        let cards = self.store.load().await?;
        let count = cards.len();
        self.registry.import_agents(cards);
        self.dirty.store(false, Ordering::SeqCst);
        info!("Loaded {} agent card(s) from registry store", count);
        Ok(count)
    }

    /// Write through if dirty. Returns whether a write happened.
    #[instrument(skip(self))]
    pub async fn save(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            debug!("Registry clean, skipping save");
            return Ok(false);
        }

        let cards = self.registry.export_agents();
        if let Err(e) = self.store.save(&cards).await {
            // Keep the change pending so the next save retries it
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }

        debug!("Saved {} agent card(s) to registry store", cards.len());
        Ok(true)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Read-only access to the wrapped registry.
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn register(&self, card: CapabilityCard) -> CapabilityCard {
        let stored = self.registry.register(card);
        self.mark_dirty();
        stored
    }

    pub fn unregister(&self, name: &str) -> bool {
        let existed = self.registry.unregister(name);
        if existed {
            self.mark_dirty();
        }
        existed
    }

    pub fn update_health(&self, name: &str, status: HealthStatus) -> bool {
        let updated = self.registry.update_health(name, status);
        if updated {
            self.mark_dirty();
        }
        updated
    }

    pub fn import_agents(&self, cards: Vec<CapabilityCard>) {
        self.registry.import_agents(cards);
        self.mark_dirty();
    }

    pub fn get_agent(&self, name: &str) -> Option<CapabilityCard> {
        self.registry.get_agent(name)
    }

    pub fn list_agents(&self, filter: &ListFilter) -> Vec<CapabilityCard> {
        self.registry.list_agents(filter)
    }

    pub fn find_agent(&self, query: &FindAgentQuery) -> Vec<AgentMatch> {
        self.registry.find_agent(query)
    }

    pub fn get_stats(&self) -> RegistryStats {
        self.registry.get_stats()
    }

    pub fn export_agents(&self) -> Vec<CapabilityCard> {
        self.registry.export_agents()
    }

    /// Register every card of a seed file on top of what is loaded.
    pub async fn seed_from_file(&self, path: &Path) -> Result<usize> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read seed file: {:?}", path))?;
        let cards = parse_seed(&contents)
            .with_context(|| format!("Failed to parse seed file: {:?}", path))?;

        let count = cards.len();
        for card in cards {
            self.register(card);
        }
        info!("Seeded {} agent card(s) from {:?}", count, path);
        Ok(count)
    }
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    agents: Vec<CapabilityCard>,
}

/// Parse a TOML seed file of `[[agents]]` tables.
pub fn parse_seed(contents: &str) -> Result<Vec<CapabilityCard>> {
    let seed: SeedFile = toml::from_str(contents)?;

    let mut names = HashSet::new();
    for card in &seed.agents {
        if card.name.trim().is_empty() || card.url.trim().is_empty() {
            return Err(anyhow!("Seed agents need a name and a url"));
        }
        if !names.insert(card.name.as_str()) {
            return Err(anyhow!("Duplicate agent in seed file: {}", card.name));
        }
    }
    Ok(seed.agents)
}
