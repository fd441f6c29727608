//! Mutable state of one in-flight run.

use crate::checkpoint::{Checkpoint, RollbackEntry};
use crate::config::ExecutionMode;
use crate::result::PerformanceMetrics;
use crate::value::Variables;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-step outputs keyed by step id.
pub type StepOutputs = BTreeMap<u32, Variables>;

#[derive(Debug, Clone)]
pub struct ContextMetadata {
    pub started_at: DateTime<Utc>,
    /// Index of the step (or phase) being processed.
    pub current_step: usize,
    pub total_steps: usize,
    pub execution_mode: ExecutionMode,
    pub metrics: PerformanceMetrics,
}

/// Execution context owned by a single run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub chain_id: String,
    pub variables: Variables,
    pub step_outputs: StepOutputs,
    pub checkpoints: BTreeMap<u32, Checkpoint>,
    /// Audit trail of compensating operations, oldest first.
    pub rollback_stack: Vec<RollbackEntry>,
    pub retry_attempts: BTreeMap<u32, u32>,
    pub metadata: ContextMetadata,
}

impl ExecutionContext {
    pub fn new(
        run_id: &str,
        chain_id: &str,
        variables: Variables,
        total_steps: usize,
        execution_mode: ExecutionMode,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            chain_id: chain_id.to_string(),
            variables,
            step_outputs: StepOutputs::new(),
            checkpoints: BTreeMap::new(),
            rollback_stack: Vec::new(),
            retry_attempts: BTreeMap::new(),
            metadata: ContextMetadata {
                started_at: Utc::now(),
                current_step: 0,
                total_steps,
                execution_mode,
                metrics: PerformanceMetrics::new(total_steps),
            },
        }
    }

    /// Set a variable.
    pub fn set(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    /// Get a variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Copy the declared outputs of a step into the variables and the
    /// per-step output map. Undeclared keys are dropped.
    pub fn merge_outputs(&mut self, step_id: u32, declared: &[&str], outputs: &Variables) -> Variables {
        let mut kept = Variables::new();
        for name in declared {
            if let Some(value) = outputs.get(*name) {
                kept.insert(name.to_string(), value.clone());
                self.variables.insert(name.to_string(), value.clone());
            }
        }
        self.step_outputs.insert(step_id, kept.clone());
        kept
    }

    /// Required variables of a step that are not present.
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|name| !self.variables.contains_key(name.as_str()))
            .map(String::as_str)
            .collect()
    }
}
