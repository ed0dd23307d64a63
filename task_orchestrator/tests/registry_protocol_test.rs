//! Registry behaviour through the tool protocol and the persistent wrapper.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use task_orchestrator::{
    error::codes,
    protocol::{self, ToolRequest},
    registry::{CapabilityCard, FindAgentQuery, HealthStatus, ListFilter},
    store::{InMemoryRegistryStore, PersistentRegistry},
};
use tracing_test::traced_test;

fn card(name: &str, description: &str) -> Value {
    json!({"name": name, "description": description, "url": format!("http://{}", name)})
}

#[tokio::test]
#[traced_test]
async fn test_reregistration_overwrites() {
    let registry = PersistentRegistry::in_memory();

    protocol::handle(&registry, "register_agent", json!({"card": card("echo", "first version")}))
        .await
        .unwrap();
    let second = protocol::handle(
        &registry,
        "register_agent",
        json!({"card": card("echo", "second version"), "tags": ["v2"]}),
    )
    .await
    .unwrap();
    assert_eq!(second["description"], "second version");

    let listed = protocol::handle(&registry, "list_agents", json!({})).await.unwrap();
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["name"], "echo");
    assert_eq!(listed[0]["tags"], json!(["v2"]));
}

#[tokio::test]
async fn test_list_filters() {
    let registry = PersistentRegistry::in_memory();
    registry.register(CapabilityCard::new("a", "A", "http://a").with_tags(&["weather"]));
    registry.register(CapabilityCard::new("b", "B", "http://b").with_tags(&["code"]));
    registry.update_health("b", HealthStatus::Healthy);

    let tagged = protocol::handle(&registry, "list_agents", json!({"tags": ["weather", "maps"]}))
        .await
        .unwrap();
    assert_eq!(tagged.as_array().unwrap().len(), 1);
    assert_eq!(tagged[0]["name"], "a");

    let healthy = protocol::handle(&registry, "list_agents", json!({"healthyOnly": true}))
        .await
        .unwrap();
    assert_eq!(healthy.as_array().unwrap().len(), 1);
    assert_eq!(healthy[0]["name"], "b");
}

#[tokio::test]
async fn test_malformed_requests_have_no_side_effects() {
    let store = Arc::new(InMemoryRegistryStore::new());
    let registry = PersistentRegistry::new(store.clone());

    for (method, params) in [
        ("register_agent", json!({"card": {"description": "no name or url"}})),
        ("register_agent", json!("not an object")),
        ("unregister_agent", json!({"name": 42})),
        ("find_agent", json!({"limit": 3})),
    ] {
        let err = protocol::handle(&registry, method, params).await.unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS, "{}", method);
    }

    assert!(registry.list_agents(&ListFilter::default()).is_empty());
    assert!(!registry.is_dirty());
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn test_reads_do_not_write_through() {
    let store = Arc::new(InMemoryRegistryStore::new());
    let registry = PersistentRegistry::new(store.clone());
    protocol::handle(&registry, "register_agent", json!({"card": card("a", "alpha")}))
        .await
        .unwrap();
    assert_eq!(store.save_count(), 1);

    for request in [
        ToolRequest::parse("list_agents", json!({})).unwrap(),
        ToolRequest::parse("get_agent", json!({"name": "a"})).unwrap(),
        ToolRequest::parse("find_agent", json!({"query": "alpha"})).unwrap(),
        ToolRequest::parse("resources/read", json!({"uri": "registry/stats"})).unwrap(),
    ] {
        protocol::dispatch(&registry, request).await.unwrap();
    }
    assert_eq!(store.save_count(), 1);
}

#[test]
fn test_ranking_prefers_tags_then_recent_health() {
    let registry = PersistentRegistry::in_memory();
    registry.register(CapabilityCard::new("old", "Searches code repositories", "http://old"));
    registry.register(CapabilityCard::new("new", "Searches code repositories", "http://new"));
    registry.register(
        CapabilityCard::new("tagged", "Searches code repositories", "http://tagged").with_tags(&["rust"]),
    );
    registry.update_health("new", HealthStatus::Healthy);

    let matches = registry.find_agent(&FindAgentQuery::new("search code").prefer(&["rust"]));
    let names: Vec<&str> = matches.iter().map(|m| m.card.name.as_str()).collect();
    assert_eq!(names, vec!["tagged", "new", "old"]);
    assert!(matches[0].score > matches[1].score);
    assert!(matches.iter().all(|m| (0.0..=1.0).contains(&m.score)));
}

const FLAGS: &[&str] = &["streaming", "batch", "vision", "audio"];

fn flags_from_mask(mask: u8) -> Vec<&'static str> {
    FLAGS
        .iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, f)| *f)
        .collect()
}

proptest! {
    #[test]
    fn prop_required_capabilities_gate_results(
        card_masks in prop::collection::vec(0u8..16, 1..8),
        required_mask in 0u8..16,
    ) {
        let registry = PersistentRegistry::in_memory();
        for (i, mask) in card_masks.iter().enumerate() {
            registry.register(
                CapabilityCard::new(format!("agent-{}", i), "General purpose worker", "http://w")
                    .with_capabilities(&flags_from_mask(*mask)),
            );
        }

        let required = flags_from_mask(required_mask);
        let query = FindAgentQuery::new("general worker").require(&required).with_limit(100);
        let matches = registry.find_agent(&query);

        for m in &matches {
            for flag in &required {
                prop_assert!(m.card.capabilities.iter().any(|c| c == flag));
            }
        }
        let capable = card_masks.iter().filter(|m| *m & required_mask == required_mask).count();
        prop_assert_eq!(matches.len(), capable);
    }
}
