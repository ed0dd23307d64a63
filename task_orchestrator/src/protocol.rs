//! Tool protocol over the capability registry.
//!
//! Requests are parsed into a closed [`ToolRequest`] before anything touches
//! the registry, so malformed calls are rejected without side effects.
//!
//! | method             | params                                                     |
//! |--------------------|------------------------------------------------------------|
//! | `find_agent`       | `query`, `requiredCapabilities?`, `preferredTags?`, `limit?` |
//! | `list_agents`      | `tags?`, `healthyOnly?`                                    |
//! | `get_agent`        | `name`                                                     |
//! | `register_agent`   | `card`, `tags?`                                            |
//! | `unregister_agent` | `name`                                                     |
//! | `resources/read`   | `uri`: `agent_cards/list`, `agent_cards/{name}`, `registry/stats` |
//! | `tools/call`       | `name` (one of the tools above), `arguments`               |

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use crate::error::ToolError;
use crate::registry::{CapabilityCard, FindAgentQuery, ListFilter};
use crate::store::PersistentRegistry;

const AGENT_CARDS_PREFIX: &str = "agent_cards/";

#[derive(Debug, Clone)]
pub enum ToolRequest {
    FindAgent(FindAgentQuery),
    ListAgents(ListFilter),
    GetAgent { name: String },
    RegisterAgent { card: CapabilityCard, tags: Vec<String> },
    UnregisterAgent { name: String },
    ReadResource { uri: String },
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct RegisterParams {
    #[serde(alias = "capabilityCard")]
    card: CapabilityCard,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct ResourceParams {
    uri: String,
}

#[derive(Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ToolError> {
    // Absent params behave like an empty object
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| ToolError::invalid_params(format!("Invalid params for {}: {}", method, e)))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        return Err(ToolError::invalid_params(format!("'{}' must not be empty", field)));
    }
    Ok(())
}

impl ToolRequest {
    /// Validate a method call into a request.
    pub fn parse(method: &str, raw: Value) -> Result<Self, ToolError> {
        match method {
            "find_agent" => {
                let query: FindAgentQuery = params(method, raw)?;
                if query.limit == 0 {
                    return Err(ToolError::invalid_params("'limit' must be at least 1"));
                }
                Ok(Self::FindAgent(query))
            }
            "list_agents" => Ok(Self::ListAgents(params(method, raw)?)),
            "get_agent" => {
                let NameParams { name } = params(method, raw)?;
                require_non_empty("name", &name)?;
                Ok(Self::GetAgent { name })
            }
            "register_agent" => {
                let RegisterParams { card, tags } = params(method, raw)?;
                require_non_empty("card.name", &card.name)?;
                require_non_empty("card.url", &card.url)?;
                Ok(Self::RegisterAgent { card, tags })
            }
            "unregister_agent" => {
                let NameParams { name } = params(method, raw)?;
                require_non_empty("name", &name)?;
                Ok(Self::UnregisterAgent { name })
            }
            "resources/read" => {
                let ResourceParams { uri } = params(method, raw)?;
                require_non_empty("uri", &uri)?;
                Ok(Self::ReadResource { uri })
            }
            "tools/call" => {
                let CallParams { name, arguments } = params(method, raw)?;
                if name == "tools/call" || name == "resources/read" {
                    return Err(ToolError::invalid_params(format!("'{}' is not a tool", name)));
                }
                Self::parse(&name, arguments)
            }
            other => Err(ToolError::method_not_found(other)),
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::RegisterAgent { .. } | Self::UnregisterAgent { .. })
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(ToolError::internal)
}

fn read_resource(registry: &PersistentRegistry, uri: &str) -> Result<Value, ToolError> {
    match uri {
        "agent_cards/list" => to_value(&registry.list_agents(&ListFilter::default())),
        "registry/stats" => to_value(&registry.get_stats()),
        _ => match uri.strip_prefix(AGENT_CARDS_PREFIX) {
            Some(name) if !name.is_empty() => registry
                .get_agent(name)
                .ok_or_else(|| ToolError::not_found(format!("Agent not found: {}", name)))
                .and_then(|card| to_value(&card)),
            _ => Err(ToolError::not_found(format!("Unknown resource: {}", uri))),
        },
    }
}

/// Execute a parsed request. Mutations are saved through the store.
///
/// A mutation whose save fails is still applied in memory and stays pending
/// for the next save; the caller gets an internal error saying so.
#[instrument(skip(registry, request), fields(mutation = request.is_mutation()))]
pub async fn dispatch(registry: &PersistentRegistry, request: ToolRequest) -> Result<Value, ToolError> {
    let mutation = request.is_mutation();

    let response = match request {
        ToolRequest::FindAgent(query) => to_value(&registry.find_agent(&query))?,
        ToolRequest::ListAgents(filter) => to_value(&registry.list_agents(&filter))?,
        ToolRequest::GetAgent { name } => {
            let card = registry
                .get_agent(&name)
                .ok_or_else(|| ToolError::not_found(format!("Agent not found: {}", name)))?;
            to_value(&card)?
        }
        ToolRequest::RegisterAgent { mut card, tags } => {
            for tag in tags {
                if !card.has_tag(&tag) {
                    card.tags.push(tag);
                }
            }
            let stored = registry.register(card);
            info!("Registered agent {} via tool call", stored.name);
            to_value(&stored)?
        }
        ToolRequest::UnregisterAgent { name } => {
            let existed = registry.unregister(&name);
            json!({ "success": existed })
        }
        ToolRequest::ReadResource { uri } => read_resource(registry, &uri)?,
    };

    if mutation {
        if let Err(e) = registry.save().await {
            error!("Failed to persist registry: {}", e);
            return Err(ToolError::internal(format!(
                "Change applied but not persisted (retried on next save): {}",
                e
            )));
        }
    }

    Ok(response)
}

/// Parse then dispatch.
pub async fn handle(registry: &PersistentRegistry, method: &str, params: Value) -> Result<Value, ToolError> {
    let request = ToolRequest::parse(method, params)?;
    dispatch(registry, request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    fn card(name: &str) -> Value {
        json!({"name": name, "description": "Provides weather forecasts", "url": "http://w", "tags": ["weather"]})
    }

    #[test]
    fn test_parse_rejects_bad_params() {
        let err = ToolRequest::parse("get_agent", json!({})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);

        let err = ToolRequest::parse("find_agent", json!({"query": "x", "limit": 0})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);

        let err = ToolRequest::parse("register_agent", json!({"card": {"name": "", "url": "http://x"}}))
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);

        let err = ToolRequest::parse("delete_everything", json!({})).unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_parse_defaults() {
        match ToolRequest::parse("find_agent", json!({"query": "weather"})).unwrap() {
            ToolRequest::FindAgent(q) => assert_eq!(q.limit, 5),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            ToolRequest::parse("list_agents", Value::Null).unwrap(),
            ToolRequest::ListAgents(_)
        ));
        assert!(matches!(
            ToolRequest::parse("tools/call", json!({"name": "get_agent", "arguments": {"name": "a"}})).unwrap(),
            ToolRequest::GetAgent { .. }
        ));
    }

    #[tokio::test]
    async fn test_register_merges_tags_and_saves() {
        let registry = PersistentRegistry::in_memory();
        let stored = handle(
            &registry,
            "register_agent",
            json!({"card": card("weather-agent"), "tags": ["forecast", "WEATHER"]}),
        )
        .await
        .unwrap();

        assert_eq!(stored["tags"], json!(["weather", "forecast"]));
        assert_eq!(stored["health"], "unknown");
        assert!(!registry.is_dirty());
    }

    #[tokio::test]
    async fn test_get_and_unregister() {
        let registry = PersistentRegistry::in_memory();
        handle(&registry, "register_agent", json!({"card": card("a")})).await.unwrap();

        let got = handle(&registry, "get_agent", json!({"name": "a"})).await.unwrap();
        assert_eq!(got["name"], "a");

        let removed = handle(&registry, "unregister_agent", json!({"name": "a"})).await.unwrap();
        assert_eq!(removed, json!({"success": true}));
        let again = handle(&registry, "unregister_agent", json!({"name": "a"})).await.unwrap();
        assert_eq!(again, json!({"success": false}));

        let err = handle(&registry, "get_agent", json!({"name": "a"})).await.unwrap_err();
        assert_eq!(err.code, codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_find_agent_response() {
        let registry = PersistentRegistry::in_memory();
        handle(&registry, "register_agent", json!({"card": card("weather-agent")})).await.unwrap();

        let found = handle(
            &registry,
            "find_agent",
            json!({"query": "weather forecast", "preferredTags": ["weather"]}),
        )
        .await
        .unwrap();

        let matches = found.as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["card"]["name"], "weather-agent");
        assert!(matches[0]["matchReason"].as_str().unwrap().contains("matched tag: weather"));
    }

    #[tokio::test]
    async fn test_resources() {
        let registry = PersistentRegistry::in_memory();
        handle(&registry, "register_agent", json!({"card": card("a")})).await.unwrap();

        let list = handle(&registry, "resources/read", json!({"uri": "agent_cards/list"})).await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);

        let one = handle(&registry, "resources/read", json!({"uri": "agent_cards/a"})).await.unwrap();
        assert_eq!(one["url"], "http://w");

        let stats = handle(&registry, "resources/read", json!({"uri": "registry/stats"})).await.unwrap();
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["unknown"], 1);

        let err = handle(&registry, "resources/read", json!({"uri": "agent_cards/zzz"})).await.unwrap_err();
        assert_eq!(err.code, codes::NOT_FOUND);
        let err = handle(&registry, "resources/read", json!({"uri": "bogus"})).await.unwrap_err();
        assert_eq!(err.code, codes::NOT_FOUND);
    }

    #[derive(Debug)]
    struct OfflineStore;

    #[async_trait::async_trait]
    impl crate::store::RegistryStore for OfflineStore {
        async fn load(&self) -> anyhow::Result<Vec<crate::registry::CapabilityCard>> {
            Ok(Vec::new())
        }

        async fn save(&self, _cards: &[crate::registry::CapabilityCard]) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("store offline"))
        }
    }

    #[tokio::test]
    async fn test_failed_save_reports_unpersisted_change() {
        let registry = PersistentRegistry::new(std::sync::Arc::new(OfflineStore));

        let err = handle(&registry, "register_agent", json!({"card": card("a")})).await.unwrap_err();

        assert_eq!(err.code, codes::INTERNAL_ERROR);
        assert!(err.message.contains("applied but not persisted"));
        assert!(err.message.contains("store offline"));
        assert!(registry.get_agent("a").is_some());
        assert!(registry.is_dirty());
    }
}
