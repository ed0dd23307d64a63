//! Revised plans after partial failure.
//!
//! Tasks completed in earlier iterations are authoritative: whatever the
//! generator says about them, they come back `completed` with their stored
//! result and bound worker.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::error::OrchestratorError;
use crate::llm::TextGenerator;
use crate::plan::{ExecutionPlan, PlanStatus, PlanTask, ResultMap, TaskStatus};
use crate::planner::{decode_tasks, TASK_SCHEMA};

const REPLANNER_SYSTEM: &str = "You are a planning assistant revising a plan that partly \
failed. Reuse what already succeeded and route around what failed. Respond with JSON only.";

/// Longest result excerpt quoted back to the generator.
const RESULT_EXCERPT_CHARS: usize = 500;

fn excerpt(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= RESULT_EXCERPT_CHARS {
        text
    } else {
        let cut: String = text.chars().take(RESULT_EXCERPT_CHARS).collect();
        format!("{}...", cut)
    }
}

pub struct Replanner {
    generator: Arc<dyn TextGenerator>,
}

impl Replanner {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn build_prompt(plan: &ExecutionPlan, results: &ResultMap) -> String {
        let previous: Vec<Value> = plan
            .tasks
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "type": t.task_type,
                    "description": t.description,
                    "dependencies": t.dependencies,
                    "status": t.status,
                })
            })
            .collect();

        let failed: Vec<Value> = plan
            .tasks_with_status(TaskStatus::Failed)
            .map(|t| json!({ "id": t.id, "type": t.task_type, "error": t.error }))
            .collect();

        let succeeded: Vec<Value> = results
            .iter()
            .map(|(id, value)| json!({ "id": id, "result": excerpt(value) }))
            .collect();

        format!(
            "Goal: {goal}\n\n\
             Previous plan:\n{previous}\n\n\
             Failed tasks:\n{failed}\n\n\
             Completed tasks and their results:\n{succeeded}\n\n\
             Produce an alternative plan for the goal. Keep the ids of completed tasks \
             so their results are reused; do not redo them. Replace or rephrase failed \
             tasks so a different agent can handle them. Respond with JSON in exactly \
             this shape:\n{schema}",
            goal = plan.goal,
            previous = serde_json::to_string_pretty(&previous).unwrap_or_default(),
            failed = serde_json::to_string_pretty(&failed).unwrap_or_default(),
            succeeded = serde_json::to_string_pretty(&succeeded).unwrap_or_default(),
            schema = TASK_SCHEMA,
        )
    }

    /// Ask for a plan that routes around the failures of `plan`.
    ///
    /// The returned plan keeps the goal and iteration bookkeeping of `plan`.
    /// If the generator proposes nothing new, the failed tasks are retried as
    /// they were.
    #[instrument(skip(self, plan, results), fields(plan_id = %plan.id, iteration = plan.iteration))]
    pub async fn replan(
        &self,
        plan: &ExecutionPlan,
        results: &ResultMap,
    ) -> Result<ExecutionPlan, OrchestratorError> {
        let prompt = Self::build_prompt(plan, results);
        let response = self
            .generator
            .generate(REPLANNER_SYSTEM, &prompt)
            .await
            .map_err(|e| OrchestratorError::Planning(e.to_string()))?;

        let proposed = decode_tasks(&response);
        let tasks = merge_carry_over(plan, results, proposed);

        let mut next = ExecutionPlan::new(plan.goal.clone(), tasks, plan.max_iterations);
        next.iteration = plan.iteration;
        next.status = PlanStatus::Replanning;

        info!(
            "Re-planned {} into {} with {} task(s)",
            plan.id,
            next.id,
            next.tasks.len()
        );
        Ok(next)
    }
}

/// Completed work from `plan` (or the result map) overrides `proposed`.
fn merge_carry_over(plan: &ExecutionPlan, results: &ResultMap, proposed: Vec<PlanTask>) -> Vec<PlanTask> {
    let completed: Vec<&PlanTask> = plan.tasks_with_status(TaskStatus::Completed).collect();
    let carried = |id: &str| -> Option<(Value, Option<String>)> {
        let prior = completed.iter().find(|t| t.id == id);
        let result = results
            .get(id)
            .cloned()
            .or_else(|| prior.and_then(|t| t.result.clone()))?;
        Some((result, prior.and_then(|t| t.agent.clone())))
    };

    let mut fresh = 0usize;
    let mut tasks: Vec<PlanTask> = proposed
        .into_iter()
        .map(|mut task| {
            match carried(&task.id) {
                Some((result, agent)) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result);
                    task.agent = agent;
                    task.error = None;
                }
                None => fresh += 1,
            }
            task
        })
        .collect();

    if fresh == 0 {
        warn!("Re-planner proposed no new tasks; retrying failed tasks of plan {}", plan.id);
        for task in plan.tasks_with_status(TaskStatus::Failed) {
            if tasks.iter().all(|t| t.id != task.id) {
                let mut retry = task.clone();
                retry.reset();
                tasks.push(retry);
            }
        }
    }

    let present: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let missing: Vec<PlanTask> = completed
        .into_iter()
        .filter(|t| !present.contains(&t.id))
        .cloned()
        .collect();

    let mut merged = missing;
    merged.extend(tasks);
    merged
}
