//! # chainflow
//!
//! Execution of multi-step workflow chains.
//!
//! A chain is an ordered list of steps. Each step reads variables from a
//! shared context and writes its declared outputs back. Steps can be
//! guarded by conditions, retried with backoff, replaced by a fallback,
//! checkpointed and rolled back. Independent steps can run concurrently.
//!
//! The work a step performs is supplied by the caller through
//! [`StepHandlers`]; template steps are rendered by the built-in
//! [`TemplateEngine`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chainflow::{ChainDefinition, ChainExecutor, ExecuteOptions, ExecutionMode, Step, StepHandlers, Variables};
//! use std::sync::Arc;
//!
//! # async fn demo(handlers: Arc<dyn StepHandlers>) {
//! let chain = ChainDefinition::new("trip-planner")
//!     .add(Step::instruction(1, "search flights", "flight_search")
//!         .input_template("Flights from {origin} to {destination}")
//!         .requires("origin")
//!         .requires("destination")
//!         .output("flights"))
//!     .add(Step::data_operation(2, "load_hotels")
//!         .requires("destination")
//!         .output("hotels"))
//!     .add(Step::template(3, "summary", "trip_summary")
//!         .requires("flights")
//!         .requires("hotels")
//!         .output("summary"))
//!     .build();
//!
//! let executor = ChainExecutor::new(handlers);
//! let result = executor
//!     .execute(&chain, Variables::new(), ExecuteOptions::default().mode(ExecutionMode::Hybrid))
//!     .await;
//! # }
//! ```
//!
//! ## YAML Definition
//!
//! ```yaml
//! name: trip-planner
//! steps:
//!   - id: 1
//!     name: search flights
//!     type: instruction_set
//!     instruction_set: flight_search
//!     required_variables: [origin, destination]
//!     output_variables: [flights]
//!     on_failure: retry
//!   - id: 2
//!     name: summary
//!     type: template_processing
//!     template: trip_summary
//!     required_variables: [flights]
//!     output_variables: [summary]
//!     conditional_execution: "flights.length > 0"
//! ```

mod chain;
mod checkpoint;
mod condition;
mod config;
mod context;
mod error;
mod executor;
mod handler;
mod phase;
mod registry;
mod result;
mod runner;
mod step;
mod store;
mod template;
pub mod value;
pub mod yaml;

pub use chain::{ChainBuilder, ChainDefinition, VariableSpec};
pub use checkpoint::{Checkpoint, RollbackEntry};
pub use condition::{CompareOp, Condition, ConditionError, Operand};
pub use config::{EngineConfig, ExecuteOptions, ExecutionMode};
pub use context::{ContextMetadata, ExecutionContext, StepOutputs};
pub use error::ChainError;
pub use executor::{ChainExecutor, RunHandle};
pub use handler::StepHandlers;
pub use phase::{plan_batches, plan_phases, Phase};
pub use registry::{ExecutionRegistry, RunRecord, DEFAULT_MAX_ACTIVE_RUNS};
pub use result::{
    AttemptMode, ChainResult, ChainStatus, PerformanceMetrics, RunMetadata, StepDuration, StepResult,
    StepTiming,
};
pub use runner::{StepOutcome, StepRunner, TemplateSet};
pub use step::{
    FailurePolicy, Priority, RetryConfig, RollbackConfig, RollbackOperation, RollbackOperationKind, Step,
    StepBuilder, StepKind,
};
pub use store::{ChainStore, ExecutionRecord, MemoryStore};
pub use template::{
    check_syntax, validate_syntax, CacheStats, CompiledTemplate, Complexity, ConditionalBlock, LoopBlock,
    RenderResult, SyntaxReport, TemplateEngine, TemplateVariable, DEFAULT_CACHE_CAPACITY,
};
pub use value::Variables;
pub use yaml::parse_yaml;

/// Re-export common types
pub use serde_json::Value;
