//! Task Orchestrator - Core Library
//!
//! Decomposes goals into task DAGs with a text generator, binds each task to a
//! registered worker by capability, runs the graph in waves and re-plans
//! around failures.

pub mod cli;
pub mod error;
pub mod executor;
pub mod health;
pub mod llm;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod protocol;
pub mod registry;
pub mod replanner;
pub mod server;
pub mod settings;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{OrchestratorError, TaskError, ToolError};
pub use orchestrator::{OrchestrationOutcome, Orchestrator};
pub use registry::{CapabilityCard, CapabilityRegistry, FindAgentQuery};
pub use store::PersistentRegistry;
