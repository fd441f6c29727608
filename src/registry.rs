//! Tracking of in-flight runs.
//!
//! A run is registered when it starts and removed when it ends. Cancelling
//! a run removes its record; the executor notices the missing record before
//! starting its next step or phase.

use crate::error::ChainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Default limit on concurrently tracked runs.
pub const DEFAULT_MAX_ACTIVE_RUNS: usize = 10;

/// Snapshot of an in-flight run, for polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub chain_id: String,
    pub chain_name: String,
    pub started_at: DateTime<Utc>,
    /// One-based index of the step or phase in progress; 0 before the first.
    pub current_step: usize,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: &str, chain_id: &str, chain_name: &str, total_steps: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            chain_id: chain_id.to_string(),
            chain_name: chain_name.to_string(),
            started_at: Utc::now(),
            current_step: 0,
            total_steps,
            session_id: None,
        }
    }

    /// Percentage of steps started.
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.current_step as f64 / self.total_steps as f64 * 100.0
    }
}

/// Registry of active runs, shared by `Arc` between executors and callers.
#[derive(Debug)]
pub struct ExecutionRegistry {
    runs: RwLock<HashMap<String, RunRecord>>,
    max_active: usize,
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ACTIVE_RUNS)
    }
}

impl ExecutionRegistry {
    pub fn new(max_active: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            max_active,
        }
    }

    /// Track a new run. Fails when the limit is reached.
    pub async fn register(&self, record: RunRecord) -> Result<(), ChainError> {
        let mut runs = self.runs.write().await;
        if runs.len() >= self.max_active {
            return Err(ChainError::Capacity {
                active: runs.len(),
                limit: self.max_active,
            });
        }
        runs.insert(record.run_id.clone(), record);
        Ok(())
    }

    /// Record progress. Returns false when the run is no longer tracked.
    pub async fn set_current_step(&self, run_id: &str, current_step: usize) -> bool {
        match self.runs.write().await.get_mut(run_id) {
            Some(record) => {
                record.current_step = current_step;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn is_active(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    /// Request cancellation. Steps already running finish; no new step
    /// starts. Returns false for unknown runs.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let removed = self.runs.write().await.remove(run_id).is_some();
        if removed {
            tracing::info!(run = %run_id, "Cancellation requested");
        }
        removed
    }

    /// Forget a finished run.
    pub async fn remove(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.write().await.remove(run_id)
    }

    pub async fn active(&self) -> Vec<RunRecord> {
        self.runs.read().await.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.runs.read().await.len()
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }
}
