//! Session state owned by one orchestrator: the current plan, accumulated
//! results and per-task agent context. Serializable for persistence and resume.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::plan::{ExecutionPlan, ResultMap, TaskStatus};

/// Snapshot format version written by [`OrchestratorState::export`].
pub const STATE_VERSION: u32 = 1;

/// Which worker handled a task, and what else it handled this session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentContext {
    pub agent: String,
    /// Every task id bound to `agent` so far, in completion order
    pub task_ids: Vec<String>,
    pub last_interaction: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorState {
    pub session_id: String,
    #[serde(default)]
    pub current_plan: Option<ExecutionPlan>,
    /// Grows across iterations; a successful result is never removed
    #[serde(default)]
    pub results: ResultMap,
    /// Keyed by task id
    #[serde(default)]
    pub agent_contexts: BTreeMap<String, AgentContext>,
    pub last_updated: DateTime<Utc>,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorState {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            current_plan: None,
            results: ResultMap::new(),
            agent_contexts: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn set_plan(&mut self, plan: ExecutionPlan) {
        self.current_plan = Some(plan);
        self.last_updated = Utc::now();
    }

    /// Fold an executed plan into the session: results and agent bindings of
    /// every completed task are recorded, and the plan becomes current.
    pub fn record_execution(&mut self, plan: &ExecutionPlan, results: &ResultMap) {
        let now = Utc::now();
        for (id, value) in results {
            self.results.insert(id.clone(), value.clone());
        }

        for task in plan.tasks_with_status(TaskStatus::Completed) {
            let Some(agent) = &task.agent else { continue };
            if self.agent_contexts.contains_key(&task.id) {
                continue;
            }

            let mut task_ids: Vec<String> = self
                .agent_contexts
                .values()
                .filter(|c| &c.agent == agent)
                .max_by_key(|c| c.task_ids.len())
                .map(|c| c.task_ids.clone())
                .unwrap_or_default();
            task_ids.push(task.id.clone());

            self.agent_contexts.insert(
                task.id.clone(),
                AgentContext {
                    agent: agent.clone(),
                    task_ids,
                    last_interaction: now,
                },
            );
        }

        self.current_plan = Some(plan.clone());
        self.last_updated = now;
    }

    pub fn export(&self) -> StateSnapshot {
        StateSnapshot {
            version: STATE_VERSION,
            exported_at: Utc::now(),
            state: self.clone(),
        }
    }

    pub fn restore(snapshot: StateSnapshot) -> Result<Self, OrchestratorError> {
        if snapshot.version != STATE_VERSION {
            return Err(OrchestratorError::State(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, STATE_VERSION
            )));
        }
        Ok(snapshot.state)
    }
}

/// Versioned, JSON-serializable copy of an [`OrchestratorState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub state: OrchestratorState,
}

impl StateSnapshot {
    /// Write the snapshot as JSON, replacing `path` atomically.
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize state: {}", e))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create state directory {:?}", parent))?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write state file {:?}", tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move state file into place at {:?}", path))?;

        debug!("Saved orchestrator state to {:?} ({} bytes)", path, json.len());
        Ok(())
    }

    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read state file {:?}", path))?;
        let snapshot: StateSnapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse state file {:?}", path))?;

        info!(
            "Loaded state for session {} from {:?}",
            snapshot.state.session_id, path
        );
        Ok(snapshot)
    }
}
