//! Wave-based DAG execution.
//!
//! Each wave dispatches every pending task whose dependencies are completed,
//! then waits for all of them before computing the next wave. When pending
//! tasks remain but none is ready (failed dependency, dangling id or cycle),
//! they are all failed as blocked, so execution always terminates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::error::TaskError;
use crate::plan::{ExecutionPlan, PlanStatus, ResultMap, TaskStatus};
use crate::registry::FindAgentQuery;
use crate::store::PersistentRegistry;
use crate::worker::{WorkerClient, WorkerRequest};

/// Outcome of one [`PlanExecutor::execute_plan`] call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    /// Results of every completed task in the plan
    pub results: ResultMap,
    /// Task ids dispatched per wave, in dispatch order
    pub waves: Vec<Vec<String>>,
}

type TaskOutcome = Result<(Value, String), TaskError>;

/// Called after each wave's outcomes are applied to the plan.
#[async_trait]
pub trait WaveObserver: Send + Sync {
    async fn wave_finished(&self, plan: &ExecutionPlan, results: &ResultMap);
}

#[async_trait]
impl WaveObserver for () {
    async fn wave_finished(&self, _plan: &ExecutionPlan, _results: &ResultMap) {}
}

pub struct PlanExecutor {
    registry: Arc<PersistentRegistry>,
    worker: Arc<dyn WorkerClient>,
    concurrency: Option<Arc<Semaphore>>,
    task_timeout: Option<Duration>,
}

impl PlanExecutor {
    pub fn new(registry: Arc<PersistentRegistry>, worker: Arc<dyn WorkerClient>) -> Self {
        Self {
            registry,
            worker,
            concurrency: None,
            task_timeout: None,
        }
    }

    /// Cap the number of in-flight worker calls. `None` means unbounded.
    pub fn with_concurrency(mut self, limit: Option<usize>) -> Self {
        self.concurrency = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Run every pending task of `plan` to a terminal status.
    pub async fn execute_plan(&self, plan: &mut ExecutionPlan) -> ExecutionReport {
        self.execute_plan_observed(plan, &()).await
    }

    /// Like [`execute_plan`](Self::execute_plan), reporting to `observer` after every wave.
    #[instrument(skip(self, plan, observer), fields(plan_id = %plan.id, tasks = plan.tasks.len()))]
    pub async fn execute_plan_observed(
        &self,
        plan: &mut ExecutionPlan,
        observer: &dyn WaveObserver,
    ) -> ExecutionReport {
        plan.status = PlanStatus::Executing;
        let mut report = ExecutionReport::default();

        // First occurrence wins if a restored plan carries duplicate ids
        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, task) in plan.tasks.iter_mut().enumerate() {
            if task.status == TaskStatus::Running {
                debug!("Resetting interrupted task {} to pending", task.id);
                task.reset();
            }
            index.entry(task.id.clone()).or_insert(i);
            if let (TaskStatus::Completed, Some(result)) = (task.status, &task.result) {
                report.results.insert(task.id.clone(), result.clone());
            }
        }

        let mut pending: Vec<usize> = (0..plan.tasks.len())
            .filter(|&i| plan.tasks[i].status == TaskStatus::Pending)
            .collect();

        while !pending.is_empty() {
            let (ready, waiting): (Vec<usize>, Vec<usize>) = pending.iter().partition(|&&i| {
                plan.tasks[i].dependencies.iter().all(|dep| {
                    index
                        .get(dep)
                        .is_some_and(|&d| plan.tasks[d].status == TaskStatus::Completed)
                })
            });

            if ready.is_empty() {
                warn!("{} task(s) can never become ready; marking them blocked", waiting.len());
                for i in waiting {
                    plan.tasks[i].fail(TaskError::Blocked.to_string());
                }
                break;
            }

            let wave: Vec<String> = ready.iter().map(|&i| plan.tasks[i].id.clone()).collect();
            info!("Wave {}: dispatching {} task(s): {:?}", report.waves.len() + 1, wave.len(), wave);

            let mut handles = Vec::with_capacity(ready.len());
            for &i in &ready {
                let task = &mut plan.tasks[i];
                task.start();

                let context = task
                    .dependencies
                    .iter()
                    .filter_map(|dep| report.results.get(dep).map(|r| (dep.clone(), r.clone())))
                    .collect();
                let request = WorkerRequest {
                    task_id: task.id.clone(),
                    task_type: task.task_type.clone(),
                    description: task.description.clone(),
                    context,
                };
                let query = task.capability_query();

                let registry = self.registry.clone();
                let worker = self.worker.clone();
                let semaphore = self.concurrency.clone();
                let timeout = self.task_timeout;

                let handle = tokio::spawn(async move {
                    let _permit = match semaphore {
                        Some(semaphore) => match semaphore.acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(e) => {
                                return Err(TaskError::Execution {
                                    agent: String::new(),
                                    message: format!("worker pool closed: {}", e),
                                })
                            }
                        },
                        None => None,
                    };
                    run_task(registry, worker, request, query, timeout).await
                });
                handles.push((i, handle));
            }

            // Wait for the whole wave before applying anything
            for (i, handle) in handles {
                let outcome = handle.await.unwrap_or_else(|e| {
                    Err(TaskError::Execution {
                        agent: String::new(),
                        message: format!("task panicked: {}", e),
                    })
                });

                let task = &mut plan.tasks[i];
                match outcome {
                    Ok((result, agent)) => {
                        info!("Task {} completed by {}", task.id, agent);
                        report.results.insert(task.id.clone(), result.clone());
                        task.complete(result, agent);
                    }
                    Err(e) => {
                        warn!("Task {} failed: {}", task.id, e);
                        task.fail(e.to_string());
                    }
                }
            }

            report.waves.push(wave);
            observer.wave_finished(plan, &report.results).await;
            pending = waiting;
        }

        info!(
            "Plan {} executed in {} wave(s), {} failed task(s)",
            plan.id,
            report.waves.len(),
            plan.failed_count()
        );
        report
    }
}

/// Bind a worker for one task and invoke it.
async fn run_task(
    registry: Arc<PersistentRegistry>,
    worker: Arc<dyn WorkerClient>,
    request: WorkerRequest,
    query: String,
    timeout: Option<Duration>,
) -> TaskOutcome {
    let card = registry
        .find_agent(&FindAgentQuery::new(query).with_limit(1))
        .into_iter()
        .next()
        .map(|m| m.card)
        .ok_or_else(|| TaskError::NoAgent {
            task_type: request.task_type.clone(),
        })?;

    debug!("Task {} bound to {}", request.task_id, card.name);
    let call = worker.invoke(&card, request);
    let response = match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| TaskError::Timeout {
                agent: card.name.clone(),
                limit,
            })?,
        None => call.await,
    }
    .map_err(|e| TaskError::Execution {
        agent: card.name.clone(),
        message: e.to_string(),
    })?;

    Ok((response.into_value(), card.name))
}
