//! Lexical capability matching.
//!
//! A card is dropped if it lacks any required capability. Survivors are scored
//! by the share of query terms found in the card (name, description, flags, tags
//! and skills), plus a bonus for the share of preferred tags the card carries:
//!
//! ```text
//! score = 0.7 * text + 0.3 * tags    (preferred tags given)
//! score = text                       (otherwise)
//! ```
//!
//! A query with no usable terms counts as a full text match, so capability-only
//! queries list every capable card. Cards scoring zero are not returned.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::{AgentMatch, CapabilityCard, FindAgentQuery};

const TEXT_WEIGHT: f64 = 0.7;
const TAG_WEIGHT: f64 = 0.3;

const STOP_WORDS: &[&str] = &[
    "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it", "of",
    "on", "or", "please", "that", "the", "this", "to", "with",
];

/// Lower-cased alphanumeric terms of length >= 2, stop words removed and a
/// trailing plural `s` stripped.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .map(|t| {
            if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
                t[..t.len() - 1].to_string()
            } else {
                t
            }
        })
        .collect()
}

fn card_terms(card: &CapabilityCard) -> BTreeSet<String> {
    let mut terms = tokenize(&card.name);
    terms.extend(tokenize(&card.description));
    for flag in &card.capabilities {
        terms.extend(tokenize(flag));
    }
    for tag in &card.tags {
        terms.extend(tokenize(tag));
    }
    for skill in &card.skills {
        terms.extend(tokenize(&skill.name));
        terms.extend(tokenize(&skill.description));
        for tag in &skill.tags {
            terms.extend(tokenize(tag));
        }
    }
    terms
}

/// Required capabilities the card does not declare (case-insensitive).
pub fn missing_capabilities<'a>(card: &CapabilityCard, required: &'a [String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|req| !card.capabilities.iter().any(|c| c.eq_ignore_ascii_case(req)))
        .map(String::as_str)
        .collect()
}

/// Score one card that already passed the capability gate.
fn score_card(
    card: &CapabilityCard,
    query_terms: &BTreeSet<String>,
    query: &FindAgentQuery,
) -> (f64, String) {
    let mut reasons = Vec::new();

    let text = if query_terms.is_empty() {
        1.0
    } else {
        let terms = card_terms(card);
        let matched: Vec<&str> = query_terms
            .iter()
            .filter(|t| terms.contains(*t))
            .map(String::as_str)
            .collect();
        if !matched.is_empty() {
            reasons.push(format!("matched terms: {}", matched.join(", ")));
        }
        matched.len() as f64 / query_terms.len() as f64
    };

    let score = if query.preferred_tags.is_empty() {
        text
    } else {
        let matched_tags: Vec<&str> = query
            .preferred_tags
            .iter()
            .filter(|t| card.has_tag(t))
            .map(String::as_str)
            .collect();
        for tag in &matched_tags {
            reasons.push(format!("matched tag: {}", tag));
        }
        let tags = matched_tags.len() as f64 / query.preferred_tags.len() as f64;
        TEXT_WEIGHT * text + TAG_WEIGHT * tags
    };

    if !query.required_capabilities.is_empty() {
        let n = query.required_capabilities.len();
        reasons.push(format!("{}/{} required capabilities present", n, n));
    }

    let reason = if reasons.is_empty() {
        "no specific match".to_string()
    } else {
        reasons.join("; ")
    };

    (score.clamp(0.0, 1.0), reason)
}

/// Rank candidates `(card, registration_seq)` against a query.
///
/// Ties are broken by the most recent health check, then registration order.
pub fn rank<'a>(
    candidates: impl Iterator<Item = (&'a CapabilityCard, u64)>,
    query: &FindAgentQuery,
) -> Vec<AgentMatch> {
    let query_terms = tokenize(&query.query);

    let mut scored: Vec<(AgentMatch, u64)> = candidates
        .filter(|(card, _)| missing_capabilities(card, &query.required_capabilities).is_empty())
        .filter_map(|(card, seq)| {
            let (score, match_reason) = score_card(card, &query_terms, query);
            (score > 0.0).then(|| {
                (
                    AgentMatch {
                        card: card.clone(),
                        score,
                        match_reason,
                    },
                    seq,
                )
            })
        })
        .collect();

    scored.sort_by(|(a, seq_a), (b, seq_b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            // `Some` sorts after `None`, so reverse for most-recent-first
            .then_with(|| b.card.last_health_check.cmp(&a.card.last_health_check))
            .then_with(|| seq_a.cmp(seq_b))
    });

    scored
        .into_iter()
        .take(query.limit)
        .map(|(m, _)| m)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentSkill, CapabilityRegistry};
    use chrono::{Duration, Utc};

    fn registry() -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        registry.register(
            CapabilityCard::new("weather-agent", "Provides weather forecasts", "http://w")
                .with_capabilities(&["streaming"])
                .with_tags(&["weather"]),
        );
        registry.register(
            CapabilityCard::new("code-agent", "Searches code repositories", "http://c")
                .with_tags(&["code", "github"])
                .with_skill(AgentSkill {
                    id: "issues".to_string(),
                    name: "Issue triage".to_string(),
                    description: "Summarize open issues".to_string(),
                    tags: vec!["github".to_string()],
                }),
        );
        registry.register(CapabilityCard::new(
            "image-agent",
            "Generates images from prompts",
            "http://i",
        ));
        registry
    }

    #[test]
    fn test_tokenize() {
        let terms = tokenize("Get the Weather forecasts, for Paris!");
        assert!(terms.contains("weather"));
        assert!(terms.contains("forecast"));
        assert!(terms.contains("pari"));
        assert!(!terms.contains("the"));
        assert!(!terms.contains("for"));
    }

    #[test]
    fn test_best_match_first() {
        let matches = registry().find_agent(&FindAgentQuery::new("weather: forecast for Berlin"));
        assert!(!matches.is_empty());
        assert_eq!(matches[0].card.name, "weather-agent");
        assert!(matches[0].score > 0.0 && matches[0].score <= 1.0);
        assert!(matches[0].match_reason.contains("weather"));
    }

    #[test]
    fn test_skills_are_searched() {
        let matches = registry().find_agent(&FindAgentQuery::new("triage issues"));
        assert_eq!(matches[0].card.name, "code-agent");
    }

    #[test]
    fn test_required_capabilities_gate() {
        let matches = registry().find_agent(&FindAgentQuery::new("code").require(&["streaming"]));
        assert!(matches.iter().all(|m| m.card.capabilities.contains(&"streaming".to_string())));
        assert!(matches.iter().all(|m| m.card.name != "code-agent"));
    }

    #[test]
    fn test_capability_only_query_lists_capable_cards() {
        let matches = registry().find_agent(&FindAgentQuery::new("").require(&["STREAMING"]));
        assert_eq!(matches.len(), 1);
        assert!(matches[0].match_reason.contains("1/1 required capabilities present"));
    }

    #[test]
    fn test_preferred_tags_boost_not_filter() {
        let query = FindAgentQuery::new("agent").prefer(&["github"]);
        let matches = registry().find_agent(&query);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].card.name, "code-agent");
        assert!(matches[0].match_reason.contains("matched tag: github"));
        assert!(matches[0].score > matches[1].score);
    }

    #[test]
    fn test_no_match_is_empty() {
        let matches = registry().find_agent(&FindAgentQuery::new("translate: sanskrit poetry"));
        assert!(matches.is_empty());
    }

    #[test]
    fn test_limit() {
        let matches = registry().find_agent(&FindAgentQuery::new("agent").with_limit(2));
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_tie_break_health_check_then_order() {
        let now = Utc::now();
        let mut first = CapabilityCard::new("first", "echo service", "http://1");
        let mut second = CapabilityCard::new("second", "echo service", "http://2");
        let third = CapabilityCard::new("third", "echo service", "http://3");
        first.last_health_check = Some(now - Duration::minutes(5));
        second.last_health_check = Some(now);

        let cards = [(&third, 0), (&first, 1), (&second, 2)];
        let ranked = rank(cards.iter().map(|(c, s)| (*c, *s)), &FindAgentQuery::new("echo"));
        let names: Vec<_> = ranked.iter().map(|m| m.card.name.as_str()).collect();
        assert_eq!(names, vec!["second", "first", "third"]);

        let a = CapabilityCard::new("a", "echo service", "http://a");
        let b = CapabilityCard::new("b", "echo service", "http://b");
        let cards = [(&b, 7), (&a, 3)];
        let ranked = rank(cards.iter().map(|(c, s)| (*c, *s)), &FindAgentQuery::new("echo"));
        assert_eq!(ranked[0].card.name, "a");
    }
}
