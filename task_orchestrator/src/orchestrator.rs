//! Plan, execute, re-plan: the bounded orchestration loop.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::error::OrchestratorError;
use crate::executor::{PlanExecutor, WaveObserver};
use crate::llm::TextGenerator;
use crate::plan::{ExecutionPlan, PlanStatus, ResultMap, TaskStatus};
use crate::planner::Planner;
use crate::replanner::Replanner;
use crate::settings::OrchestratorConfig;
use crate::state::{OrchestratorState, StateSnapshot};
use crate::store::PersistentRegistry;
use crate::worker::WorkerClient;

const SUMMARY_SYSTEM: &str = "You write short, factual summaries of completed work for the \
person who asked for it.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedTask {
    pub id: String,
    pub error: String,
}

/// What a caller gets back from [`Orchestrator::execute`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationOutcome {
    pub success: bool,
    pub plan_id: String,
    pub status: PlanStatus,
    /// Plan executions performed
    pub iterations: u32,
    /// Every successful result gathered, including partial ones on failure
    pub results: ResultMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_tasks: Vec<FailedTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Orchestrator {
    registry: Arc<PersistentRegistry>,
    generator: Arc<dyn TextGenerator>,
    planner: Planner,
    replanner: Replanner,
    executor: PlanExecutor,
    state: RwLock<OrchestratorState>,
    /// One orchestration at a time per instance
    run_lock: Mutex<()>,
    state_file: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<PersistentRegistry>,
        generator: Arc<dyn TextGenerator>,
        worker: Arc<dyn WorkerClient>,
        config: &OrchestratorConfig,
    ) -> Self {
        let planner = Planner::new(generator.clone(), config.max_replan_iterations)
            .with_catalog(registry.clone());
        let executor = PlanExecutor::new(registry.clone(), worker)
            .with_concurrency(config.concurrency_limit())
            .with_task_timeout(config.task_timeout());

        Self {
            registry,
            replanner: Replanner::new(generator.clone()),
            generator,
            planner,
            executor,
            state: RwLock::new(OrchestratorState::new()),
            run_lock: Mutex::new(()),
            state_file: config.state_file.clone(),
        }
    }

    /// Checkpoint state to `path` after every wave and plan change.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn registry(&self) -> &Arc<PersistentRegistry> {
        &self.registry
    }

    pub fn export_state(&self) -> StateSnapshot {
        self.state.read().export()
    }

    /// Replace the session state. Refused while a run is in progress.
    pub fn restore_state(&self, snapshot: StateSnapshot) -> Result<(), OrchestratorError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| OrchestratorError::State("an orchestration is in progress".to_string()))?;
        let state = OrchestratorState::restore(snapshot)?;
        info!("Restored session {}", state.session_id);
        *self.state.write() = state;
        Ok(())
    }

    /// Plan `goal`, then execute and re-plan until no task fails or the
    /// iteration budget is spent.
    ///
    /// Running out of iterations is reported as an unsuccessful outcome with
    /// the partial results, not as an error.
    #[instrument(skip(self))]
    pub async fn execute(&self, goal: &str) -> Result<OrchestrationOutcome, OrchestratorError> {
        let _guard = self.run_lock.lock().await;

        let plan = self.planner.create_plan(goal).await?;
        if plan.is_empty() {
            warn!("Planner produced no tasks for goal; the run will complete trivially");
        }
        self.state.write().set_plan(plan.clone());
        self.checkpoint().await;

        self.drive(plan).await
    }

    /// Continue the current plan of a restored session.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<OrchestrationOutcome, OrchestratorError> {
        let _guard = self.run_lock.lock().await;

        let plan = self
            .state
            .read()
            .current_plan
            .clone()
            .ok_or_else(|| OrchestratorError::State("no plan to resume".to_string()))?;
        if plan.is_terminal() {
            return Err(OrchestratorError::State(format!(
                "plan {} already finished as {:?}",
                plan.id, plan.status
            )));
        }

        info!("Resuming plan {} at iteration {}", plan.id, plan.iteration);
        self.drive(plan).await
    }

    async fn drive(&self, mut plan: ExecutionPlan) -> Result<OrchestrationOutcome, OrchestratorError> {
        loop {
            // A plan restored mid-execution continues its current iteration
            if plan.status != PlanStatus::Executing {
                plan.iteration += 1;
            }
            info!(
                "Executing plan {} (iteration {}/{})",
                plan.id, plan.iteration, plan.max_iterations
            );

            let report = self
                .executor
                .execute_plan_observed(&mut plan, &Checkpointer(self))
                .await;
            let failed = plan.failed_count();

            if failed == 0 {
                plan.status = PlanStatus::Completed;
                self.state.write().record_execution(&plan, &report.results);
                self.checkpoint().await;
                return Ok(self.succeed(&plan).await);
            }

            if plan.iteration >= plan.max_iterations {
                plan.status = PlanStatus::Failed;
                self.state.write().record_execution(&plan, &report.results);
                self.checkpoint().await;

                let err = OrchestratorError::Exhausted {
                    iterations: plan.iteration,
                    failed,
                };
                warn!("Plan {} failed: {}", plan.id, err);
                return Ok(self.fail(&plan, err.to_string()));
            }

            self.state.write().record_execution(&plan, &report.results);
            self.checkpoint().await;
            info!("{} task(s) failed; re-planning", failed);

            let results = self.state.read().results.clone();
            match self.replanner.replan(&plan, &results).await {
                Ok(next) => {
                    plan = next;
                    self.state.write().set_plan(plan.clone());
                    self.checkpoint().await;
                }
                Err(e) => {
                    error!("Re-planning failed: {}", e);
                    plan.status = PlanStatus::Failed;
                    self.state.write().set_plan(plan.clone());
                    self.checkpoint().await;
                    return Ok(self.fail(&plan, e.to_string()));
                }
            }
        }
    }

    async fn succeed(&self, plan: &ExecutionPlan) -> OrchestrationOutcome {
        let results = self.state.read().results.clone();
        let summary = self.summarize(&plan.goal, &results).await;
        info!("Plan {} completed after {} iteration(s)", plan.id, plan.iteration);

        OrchestrationOutcome {
            success: true,
            plan_id: plan.id.clone(),
            status: plan.status,
            iterations: plan.iteration,
            results,
            summary,
            failed_tasks: Vec::new(),
            error: None,
        }
    }

    fn fail(&self, plan: &ExecutionPlan, error: String) -> OrchestrationOutcome {
        OrchestrationOutcome {
            success: false,
            plan_id: plan.id.clone(),
            status: plan.status,
            iterations: plan.iteration,
            results: self.state.read().results.clone(),
            summary: None,
            failed_tasks: plan
                .tasks_with_status(TaskStatus::Failed)
                .map(|t| FailedTask {
                    id: t.id.clone(),
                    error: t.error.clone().unwrap_or_default(),
                })
                .collect(),
            error: Some(error),
        }
    }

    /// Natural-language summary of the results. A generator failure only
    /// costs the summary.
    async fn summarize(&self, goal: &str, results: &ResultMap) -> Option<String> {
        let rendered = serde_json::to_string_pretty(results).unwrap_or_default();
        let prompt = format!(
            "Goal: {}\n\nResults by task:\n{}\n\nSummarize what was accomplished in a few sentences.",
            goal, rendered
        );

        match self.generator.generate(SUMMARY_SYSTEM, &prompt).await {
            Ok(summary) => Some(summary.trim().to_string()),
            Err(e) => {
                warn!("Could not summarize results: {}", e);
                None
            }
        }
    }

    async fn checkpoint(&self) {
        let Some(path) = &self.state_file else { return };
        let snapshot = self.export_state();
        if let Err(e) = snapshot.save_to_file(path).await {
            error!("Failed to checkpoint state to {:?}: {}", path, e);
        }
    }
}

/// Folds each finished wave into the session state and persists it.
struct Checkpointer<'a>(&'a Orchestrator);

#[async_trait]
impl WaveObserver for Checkpointer<'_> {
    async fn wave_finished(&self, plan: &ExecutionPlan, results: &ResultMap) {
        self.0.state.write().record_execution(plan, results);
        self.0.checkpoint().await;
    }
}
