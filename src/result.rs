//! Run and step results.

use crate::config::ExecutionMode;
use crate::value::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a step result was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptMode {
    /// First attempt succeeded or failed without retrying.
    #[default]
    Normal,
    Retry,
    /// Produced by the fallback step.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub mode: AttemptMode,
}

/// Result of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: u32,
    pub success: bool,
    /// Everything the handler returned, declared or not.
    pub outputs: Variables,
    pub logs: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Number of the attempt that produced this result, starting at 1.
    pub retry_attempt: u32,
    pub rollback_performed: bool,
    pub fallback_used: bool,
    pub checkpoint_created: bool,
    pub timing: StepTiming,
}

impl StepResult {
    pub(crate) fn new(step_id: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            step_id,
            success: false,
            outputs: Variables::new(),
            logs: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            retry_attempt: 1,
            rollback_performed: false,
            fallback_used: false,
            checkpoint_created: false,
            timing: StepTiming {
                started_at,
                ended_at: started_at,
                duration_ms: 0.0,
                mode: AttemptMode::Normal,
            },
        }
    }

    /// Stamp the end time and duration.
    pub(crate) fn finish(&mut self) {
        let ended_at = Utc::now();
        self.timing.ended_at = ended_at;
        self.timing.duration_ms =
            (ended_at - self.timing.started_at).num_microseconds().unwrap_or(0) as f64 / 1000.0;
    }

    pub fn is_retry(&self) -> bool {
        self.retry_attempt > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepDuration {
    pub step_id: u32,
    pub duration_ms: f64,
}

/// Counters maintained while a run progresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub retried_steps: usize,
    pub rolled_back_steps: usize,
    pub average_step_duration_ms: f64,
    pub fastest_step: Option<StepDuration>,
    pub slowest_step: Option<StepDuration>,
}

impl PerformanceMetrics {
    pub(crate) fn new(total_steps: usize) -> Self {
        Self {
            total_steps,
            ..Self::default()
        }
    }

    /// Fill in duration statistics from the executed steps.
    pub(crate) fn finalize(&mut self, results: &[StepResult]) {
        if results.is_empty() {
            return;
        }

        let total: f64 = results.iter().map(|r| r.timing.duration_ms).sum();
        self.average_step_duration_ms = total / results.len() as f64;

        let durations = results.iter().map(|r| StepDuration {
            step_id: r.step_id,
            duration_ms: r.timing.duration_ms,
        });
        self.fastest_step = durations
            .clone()
            .min_by(|a, b| a.duration_ms.total_cmp(&b.duration_ms));
        self.slowest_step = durations.max_by(|a, b| a.duration_ms.total_cmp(&b.duration_ms));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Completed,
    Failed,
    Cancelled,
    /// A step's rollback policy was applied.
    RolledBack,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Completed => "completed",
            ChainStatus::Failed => "failed",
            ChainStatus::Cancelled => "cancelled",
            ChainStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_duration_ms: f64,
    pub steps_executed: usize,
    pub steps_failed: usize,
    pub steps_retried: usize,
    pub execution_mode: ExecutionMode,
    /// Human-readable notes on rollbacks that were performed.
    pub recovery_actions: Vec<String>,
}

/// Outcome of a chain run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainResult {
    pub run_id: String,
    pub chain_id: String,
    pub status: ChainStatus,
    pub final_context: Variables,
    /// Final values of variables any step declares as output.
    pub outputs: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub step_results: Vec<StepResult>,
    pub performance_metrics: PerformanceMetrics,
    pub checkpoints_used: usize,
    pub rollbacks_performed: usize,
    pub metadata: RunMetadata,
}

impl ChainResult {
    pub fn is_success(&self) -> bool {
        self.status == ChainStatus::Completed
    }

    pub fn step(&self, step_id: u32) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }
}
