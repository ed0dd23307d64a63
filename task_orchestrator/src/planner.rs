//! Goal decomposition into an initial task DAG.
//!
//! The text generator is asked for a JSON payload of the form
//! `{"tasks": [{"id", "type", "description", "dependencies"}]}`. Model output is
//! decoded best-effort: the first balanced `{...}` block, then the whole
//! response; if neither yields tasks the plan is empty.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::error::OrchestratorError;
use crate::llm::TextGenerator;
use crate::plan::{ExecutionPlan, PlanTask};
use crate::registry::ListFilter;
use crate::store::PersistentRegistry;

pub(crate) const TASK_SCHEMA: &str = r#"{
  "tasks": [
    {
      "id": "unique_task_id",
      "type": "short capability label, e.g. weather or code_search",
      "description": "what the worker must do",
      "dependencies": ["ids of tasks that must complete first"]
    }
  ]
}"#;

const PLANNER_SYSTEM: &str = "You are a planning assistant. You break goals into small tasks \
that can each be handled by one specialised agent. Respond with JSON only.";

#[derive(Debug, Error, PartialEq)]
pub enum PlanParseError {
    #[error("response contains no JSON payload")]
    NoPayload,
    #[error("JSON payload has no task list")]
    NoTasks,
}

/// Locate the first balanced `{...}` block, ignoring braces inside strings.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn tasks_from_value(value: Value) -> Result<Vec<PlanTask>, PlanParseError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("tasks") {
            Some(Value::Array(items)) => items,
            _ => return Err(PlanParseError::NoTasks),
        },
        _ => return Err(PlanParseError::NoTasks),
    };

    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<PlanTask>(item) {
            Ok(mut task) => {
                if !seen.insert(task.id.clone()) {
                    warn!("Dropping duplicate task id '{}' from plan", task.id);
                    continue;
                }
                task.reset();
                tasks.push(task);
            }
            Err(e) => warn!("Skipping malformed task entry: {}", e),
        }
    }
    Ok(tasks)
}

/// Strict decode of model output into tasks, every task normalized to pending.
pub fn parse_tasks(text: &str) -> Result<Vec<PlanTask>, PlanParseError> {
    if let Some(block) = extract_json_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            if let Ok(tasks) = tasks_from_value(value) {
                return Ok(tasks);
            }
        }
    }

    match serde_json::from_str::<Value>(text.trim()) {
        Ok(value) => tasks_from_value(value),
        Err(_) => Err(PlanParseError::NoPayload),
    }
}

/// Best-effort decode: a parse failure yields no tasks.
pub fn decode_tasks(text: &str) -> Vec<PlanTask> {
    parse_tasks(text).unwrap_or_else(|e| {
        warn!("Could not interpret planner output ({}); using an empty plan", e);
        Vec::new()
    })
}

/// Turns goals into execution plans.
pub struct Planner {
    generator: Arc<dyn TextGenerator>,
    catalog: Option<Arc<PersistentRegistry>>,
    max_iterations: u32,
}

impl Planner {
    pub fn new(generator: Arc<dyn TextGenerator>, max_iterations: u32) -> Self {
        Self {
            generator,
            catalog: None,
            max_iterations,
        }
    }

    /// List registered agents in the prompt so task types line up with them.
    pub fn with_catalog(mut self, registry: Arc<PersistentRegistry>) -> Self {
        self.catalog = Some(registry);
        self
    }

    fn build_prompt(&self, goal: &str) -> String {
        let mut prompt = format!(
            "Decompose the following goal into tasks.\n\nGoal: {}\n\n\
             Tasks that do not depend on each other will run in parallel. \
             Only reference ids of tasks in this plan as dependencies.\n\n",
            goal
        );

        if let Some(registry) = &self.catalog {
            let agents = registry.list_agents(&ListFilter::default());
            if !agents.is_empty() {
                prompt.push_str("Available agents:\n");
                for card in agents {
                    prompt.push_str(&format!("- {}: {}\n", card.name, card.description));
                }
                prompt.push('\n');
            }
        }

        prompt.push_str("Respond with JSON in exactly this shape:\n");
        prompt.push_str(TASK_SCHEMA);
        prompt
    }

    /// Ask the generator for a decomposition of `goal`.
    ///
    /// Only an unreachable generator is an error; unreadable output gives an
    /// empty plan, which callers should treat as a signal to retry planning.
    #[instrument(skip(self), fields(goal_len = goal.len()))]
    pub async fn create_plan(&self, goal: &str) -> Result<ExecutionPlan, OrchestratorError> {
        let prompt = self.build_prompt(goal);
        let response = self
            .generator
            .generate(PLANNER_SYSTEM, &prompt)
            .await
            .map_err(|e| OrchestratorError::Planning(e.to_string()))?;

        debug!(response_len = response.len(), "Planner responded");
        let tasks = decode_tasks(&response);
        let plan = ExecutionPlan::new(goal, tasks, self.max_iterations);

        info!("Created plan {} with {} task(s)", plan.id, plan.tasks.len());
        Ok(plan)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plan::{PlanStatus, TaskStatus};
    use crate::registry::CapabilityCard;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Replays canned responses and records prompts.
    pub(crate) struct ScriptedGenerator {
        responses: Mutex<Vec<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|r| r.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, _system: &str, prompt: &str) -> Result<String> {
            self.prompts.lock().push(prompt.to_string());
            self.responses
                .lock()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no scripted response left"))
        }
    }

    #[test]
    fn test_extract_block_from_prose() {
        let text = r#"Sure! Here is the plan: {"tasks": [{"id": "a", "type": "x", "description": "uses {braces} in \"quotes\""}]} Hope this helps {not json}"#;
        let block = extract_json_block(text).unwrap();
        assert!(block.starts_with("{\"tasks\""));
        assert!(block.ends_with("]}"));
        let tasks = parse_tasks(text).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "uses {braces} in \"quotes\"");
    }

    #[test]
    fn test_whole_response_array_fallback() {
        let text = r#"[{"id": "a", "type": "x", "description": "first"}]"#;
        let tasks = parse_tasks(text).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].dependencies.is_empty());
    }

    #[test]
    fn test_unparseable_output_is_empty() {
        assert_eq!(parse_tasks("I cannot help with that."), Err(PlanParseError::NoPayload));
        assert!(decode_tasks("{ broken json").is_empty());
        assert!(decode_tasks(r#"{"steps": []}"#).is_empty());
    }

    #[test]
    fn test_tasks_are_normalized() {
        let text = r#"{"tasks": [
            {"id": "a", "type": "x", "description": "d", "status": "completed", "result": "stale"},
            {"id": "a", "type": "dup", "description": "dup"},
            {"type": "missing id"},
            {"id": "b", "type": "y", "description": "e", "dependencies": ["a"]}
        ]}"#;
        let tasks = parse_tasks(text).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert!(tasks[0].result.is_none());
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_create_plan_lists_catalog() {
        let generator = Arc::new(ScriptedGenerator::new(&[
            r#"```json
{"tasks": [{"id": "w", "type": "weather", "description": "forecast"}]}
```"#,
        ]));
        let registry = Arc::new(PersistentRegistry::in_memory());
        registry.register(CapabilityCard::new("weather-agent", "Forecasts", "http://w"));

        let planner = Planner::new(generator.clone(), 3).with_catalog(registry);
        let plan = planner.create_plan("Plan my trip").await.unwrap();

        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.status, PlanStatus::Planning);
        assert_eq!(plan.max_iterations, 3);
        let prompts = generator.prompts.lock();
        assert!(prompts[0].contains("Plan my trip"));
        assert!(prompts[0].contains("weather-agent: Forecasts"));
    }

    #[tokio::test]
    async fn test_create_plan_generator_failure() {
        let planner = Planner::new(Arc::new(ScriptedGenerator::new(&[])), 3);
        let err = planner.create_plan("goal").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Planning(_)));
    }
}
