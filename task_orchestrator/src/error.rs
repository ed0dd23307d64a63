//! Error types shared across the orchestrator.
//!
//! Task-level failures are recorded on the task and surfaced to the re-planner;
//! only [`OrchestratorError`] values ever cross the orchestration loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single plan task. Recorded as the task's error string.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// No registered card matched the task
    #[error("no agent found for task type: {task_type}")]
    NoAgent { task_type: String },

    /// The bound worker returned an error or could not be reached
    #[error("agent '{agent}' failed: {message}")]
    Execution { agent: String, message: String },

    /// The bound worker did not answer within the configured task timeout
    #[error("agent '{agent}' timed out after {limit:?}")]
    Timeout { agent: String, limit: Duration },

    /// A dependency failed, is missing, or is part of a cycle
    #[error("blocked by failed dependencies")]
    Blocked,
}

/// Errors that end an orchestration run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The text-generation collaborator could not produce a plan at all
    #[error("planning failed: {0}")]
    Planning(String),

    /// Re-planning iterations ran out while failures remained
    #[error("re-planning exhausted after {iterations} iteration(s) with {failed} failed task(s)")]
    Exhausted { iterations: u32, failed: usize },

    /// State could not be restored or persisted
    #[error("state error: {0}")]
    State(String),
}

/// JSON-RPC style error codes used by the tool protocol.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const NOT_FOUND: i64 = -32002;
}

/// Structured error returned by every tool-protocol operation.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ToolError {
    pub code: i64,
    pub message: String,
}

impl ToolError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Unknown method: {}", method))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, message)
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_messages() {
        let err = TaskError::NoAgent {
            task_type: "weather".to_string(),
        };
        assert_eq!(err.to_string(), "no agent found for task type: weather");
        assert_eq!(TaskError::Blocked.to_string(), "blocked by failed dependencies");

        let err = TaskError::Timeout {
            agent: "slow".to_string(),
            limit: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "agent 'slow' timed out after 250ms");
    }

    #[test]
    fn test_tool_error_display() {
        let err = ToolError::invalid_params("missing 'name'");
        assert_eq!(err.code, codes::INVALID_PARAMS);
        assert!(err.to_string().contains("missing 'name'"));
    }
}
