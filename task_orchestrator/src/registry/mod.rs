//! Capability registry: worker descriptors keyed by name and a ranked lookup
//! over them.

pub mod matcher;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument};

/// Health of a registered worker as last observed by the health monitor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// A skill advertised by a worker. Used by the matcher alongside the description.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Worker descriptor. `name` is the primary key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityCard {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Invocation address of the worker
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Declared capability flags (e.g. "streaming")
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub skills: Vec<AgentSkill>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Reserved for semantic search; not used by the lexical matcher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub health: HealthStatus,
}

impl CapabilityCard {
    pub fn new(name: impl Into<String>, description: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            url: url.into(),
            version: None,
            capabilities: Vec::new(),
            skills: Vec::new(),
            tags: Vec::new(),
            embedding: None,
            registered_at: None,
            last_health_check: None,
            health: HealthStatus::Unknown,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_skill(mut self, skill: AgentSkill) -> Self {
        self.skills.push(skill);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Filter for [`CapabilityRegistry::list_agents`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    /// Keep cards carrying at least one of these tags
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub healthy_only: bool,
}

/// Capability query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindAgentQuery {
    pub query: String,
    /// Every one of these must be declared by the card
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Ranking bonus only, never a filter
    #[serde(default)]
    pub preferred_tags: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    5
}

impl FindAgentQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            required_capabilities: Vec::new(),
            preferred_tags: Vec::new(),
            limit: default_limit(),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn require(mut self, capabilities: &[&str]) -> Self {
        self.required_capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn prefer(mut self, tags: &[&str]) -> Self {
        self.preferred_tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// One ranked entry of a [`FindAgentQuery`] result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMatch {
    pub card: CapabilityCard,
    /// In `[0, 1]`
    pub score: f64,
    pub match_reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    /// Capability flag -> number of cards declaring it
    pub capabilities: BTreeMap<String, usize>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Entry {
    card: CapabilityCard,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    agents: HashMap<String, Entry>,
    next_seq: u64,
    last_updated: Option<DateTime<Utc>>,
}

impl Inner {
    fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }

    fn ordered(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.agents.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }
}

/// In-process registry of capability cards.
///
/// Passed explicitly (usually as `Arc<PersistentRegistry>`) to whoever needs it;
/// there is no global instance.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    inner: RwLock<Inner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a card by name. Overwriting keeps the original
    /// registration order but resets the bookkeeping fields.
    #[instrument(skip(self, card), fields(agent = %card.name))]
    pub fn register(&self, mut card: CapabilityCard) -> CapabilityCard {
        card.registered_at = Some(Utc::now());
        card.health = HealthStatus::Unknown;
        card.last_health_check = None;

        let mut inner = self.inner.write();
        let seq = match inner.agents.get(&card.name) {
            Some(existing) => {
                debug!("Overwriting existing card '{}'", card.name);
                existing.seq
            }
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        inner.agents.insert(
            card.name.clone(),
            Entry {
                card: card.clone(),
                seq,
            },
        );
        inner.touch();

        info!("Registered agent '{}' at {}", card.name, card.url);
        card
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let existed = inner.agents.remove(name).is_some();
        if existed {
            inner.touch();
            info!("Unregistered agent '{}'", name);
        }
        existed
    }

    pub fn get_agent(&self, name: &str) -> Option<CapabilityCard> {
        self.inner.read().agents.get(name).map(|e| e.card.clone())
    }

    /// All cards in registration order, optionally filtered.
    pub fn list_agents(&self, filter: &ListFilter) -> Vec<CapabilityCard> {
        let inner = self.inner.read();
        inner
            .ordered()
            .into_iter()
            .map(|e| &e.card)
            .filter(|card| !filter.healthy_only || card.health == HealthStatus::Healthy)
            .filter(|card| filter.tags.is_empty() || filter.tags.iter().any(|t| card.has_tag(t)))
            .cloned()
            .collect()
    }

    /// Ranked lookup, highest score first.
    pub fn find_agent(&self, query: &FindAgentQuery) -> Vec<AgentMatch> {
        let inner = self.inner.read();
        let candidates = inner.ordered().into_iter().map(|e| (&e.card, e.seq));
        let matches = matcher::rank(candidates, query);
        debug!(
            "find_agent '{}' -> {} match(es)",
            query.query,
            matches.len()
        );
        matches
    }

    /// Record a health probe result. Returns whether the card exists.
    pub fn update_health(&self, name: &str, status: HealthStatus) -> bool {
        let mut inner = self.inner.write();
        let updated = match inner.agents.get_mut(name) {
            Some(entry) => {
                entry.card.health = status;
                entry.card.last_health_check = Some(Utc::now());
                true
            }
            None => false,
        };
        if updated {
            inner.touch();
        }
        updated
    }

    pub fn get_stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let mut stats = RegistryStats {
            total: inner.agents.len(),
            healthy: 0,
            unhealthy: 0,
            unknown: 0,
            capabilities: BTreeMap::new(),
            last_updated: inner.last_updated,
        };

        for entry in inner.agents.values() {
            match entry.card.health {
                HealthStatus::Healthy => stats.healthy += 1,
                HealthStatus::Unhealthy => stats.unhealthy += 1,
                HealthStatus::Unknown => stats.unknown += 1,
            }
            for capability in &entry.card.capabilities {
                *stats.capabilities.entry(capability.clone()).or_insert(0) += 1;
            }
        }

        stats
    }

    /// Replace the whole set. Cards keep their stored bookkeeping; order follows
    /// the input and later duplicates win.
    pub fn import_agents(&self, cards: Vec<CapabilityCard>) {
        let mut inner = self.inner.write();
        inner.agents.clear();
        inner.next_seq = 0;

        for mut card in cards {
            if card.registered_at.is_none() {
                card.registered_at = Some(Utc::now());
            }
            let seq = match inner.agents.get(&card.name) {
                Some(existing) => existing.seq,
                None => {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    seq
                }
            };
            inner.agents.insert(card.name.clone(), Entry { card, seq });
        }
        inner.touch();

        info!("Imported {} agent card(s)", inner.agents.len());
    }

    /// All cards in registration order.
    pub fn export_agents(&self) -> Vec<CapabilityCard> {
        let inner = self.inner.read();
        inner.ordered().into_iter().map(|e| e.card.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather() -> CapabilityCard {
        CapabilityCard::new("weather", "Weather forecasts for any city", "http://localhost:9001")
            .with_capabilities(&["streaming"])
            .with_tags(&["weather", "geo"])
    }

    fn movies() -> CapabilityCard {
        CapabilityCard::new("movies", "Movie lookup and reviews", "http://localhost:9002")
            .with_tags(&["media"])
    }

    #[test]
    fn test_register_populates_bookkeeping() {
        let registry = CapabilityRegistry::new();
        let mut card = weather();
        card.health = HealthStatus::Healthy;

        let stored = registry.register(card);
        assert!(stored.registered_at.is_some());
        assert_eq!(stored.health, HealthStatus::Unknown);
        assert_eq!(registry.get_agent("weather"), Some(stored));
    }

    #[test]
    fn test_register_twice_overwrites() {
        let registry = CapabilityRegistry::new();
        registry.register(weather());
        registry.register(movies());

        let mut updated = weather();
        updated.description = "Updated forecasts".to_string();
        registry.register(updated);

        let all = registry.list_agents(&ListFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|c| c.name == "weather").count(), 1);
        // Overwrite keeps the original position
        assert_eq!(all[0].name, "weather");
        assert_eq!(all[0].description, "Updated forecasts");
    }

    #[test]
    fn test_unregister() {
        let registry = CapabilityRegistry::new();
        registry.register(weather());
        assert!(registry.unregister("weather"));
        assert!(!registry.unregister("weather"));
        assert!(registry.get_agent("weather").is_none());
    }

    #[test]
    fn test_list_agents_filters() {
        let registry = CapabilityRegistry::new();
        registry.register(weather());
        registry.register(movies());
        registry.update_health("movies", HealthStatus::Healthy);

        let geo = registry.list_agents(&ListFilter {
            tags: vec!["GEO".to_string()],
            healthy_only: false,
        });
        assert_eq!(geo.len(), 1);
        assert_eq!(geo[0].name, "weather");

        let healthy = registry.list_agents(&ListFilter {
            tags: vec![],
            healthy_only: true,
        });
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "movies");
    }

    #[test]
    fn test_stats() {
        let registry = CapabilityRegistry::new();
        registry.register(weather());
        registry.register(movies());
        registry.update_health("weather", HealthStatus::Unhealthy);

        let stats = registry.get_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.capabilities.get("streaming"), Some(&1));
        assert!(stats.last_updated.is_some());
    }

    #[test]
    fn test_import_replaces_and_export_preserves_order() {
        let registry = CapabilityRegistry::new();
        registry.register(CapabilityCard::new("stale", "old", "http://old"));

        registry.import_agents(vec![movies(), weather()]);
        let exported = registry.export_agents();
        let names: Vec<_> = exported.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["movies", "weather"]);
        assert!(registry.get_agent("stale").is_none());

        let other = CapabilityRegistry::new();
        other.import_agents(exported.clone());
        assert_eq!(other.export_agents(), exported);
    }

    #[test]
    fn test_update_health_unknown_agent() {
        let registry = CapabilityRegistry::new();
        assert!(!registry.update_health("ghost", HealthStatus::Healthy));
    }
}
