//! Execution plan data model: a DAG of tasks plus plan-level bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Task id -> result payload.
pub type ResultMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// A node in the plan DAG.
///
/// Status only moves forward: pending -> running -> completed | failed, with
/// pending -> failed allowed for tasks that can never become ready.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanTask {
    pub id: String,
    /// Free-text label, used as the capability query
    #[serde(rename = "type", alias = "task_type", alias = "taskType")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "depends_on", alias = "dependsOn")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Name of the worker bound on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl PlanTask {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: description.into(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            agent: None,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Query string handed to the registry for this task.
    pub fn capability_query(&self) -> String {
        format!("{}: {}", self.task_type, self.description)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// pending -> running
    pub fn start(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        true
    }

    /// running -> completed
    pub fn complete(&mut self, result: Value, agent: impl Into<String>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.agent = Some(agent.into());
        self.error = None;
        true
    }

    /// pending | running -> failed
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        true
    }

    /// Reset to a fresh pending task, keeping identity and dependencies.
    pub(crate) fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.agent = None;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    #[default]
    Planning,
    Executing,
    Completed,
    Failed,
    Replanning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub id: String,
    pub goal: String,
    pub tasks: Vec<PlanTask>,
    pub created_at: DateTime<Utc>,
    pub status: PlanStatus,
    /// Executions performed so far
    pub iteration: u32,
    pub max_iterations: u32,
}

impl ExecutionPlan {
    pub fn new(goal: impl Into<String>, tasks: Vec<PlanTask>, max_iterations: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            tasks,
            created_at: Utc::now(),
            status: PlanStatus::Planning,
            iteration: 0,
            max_iterations,
        }
    }

    pub fn task(&self, id: &str) -> Option<&PlanTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut PlanTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> impl Iterator<Item = &PlanTask> {
        self.tasks.iter().filter(move |t| t.status == status)
    }

    pub fn failed_count(&self) -> usize {
        self.tasks_with_status(TaskStatus::Failed).count()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, PlanStatus::Completed | PlanStatus::Failed)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut task = PlanTask::new("t1", "search", "find docs");
        assert!(!task.complete(json!("early"), "a"));
        assert!(task.start());
        assert!(!task.start());
        assert!(task.complete(json!("done"), "agent-a"));
        assert!(!task.fail("too late"));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.agent.as_deref(), Some("agent-a"));
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let mut task = PlanTask::new("t1", "search", "find docs");
        assert!(task.fail("blocked by failed dependencies"));
        assert!(!task.start());
    }

    #[test]
    fn test_task_deserialization_aliases() {
        let task: PlanTask = serde_json::from_value(json!({
            "id": "a",
            "task_type": "weather",
            "description": "forecast",
            "depends_on": ["b"]
        }))
        .unwrap();
        assert_eq!(task.task_type, "weather");
        assert_eq!(task.dependencies, vec!["b".to_string()]);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_capability_query() {
        let task = PlanTask::new("t1", "weather", "forecast for Oslo");
        assert_eq!(task.capability_query(), "weather: forecast for Oslo");
    }
}
