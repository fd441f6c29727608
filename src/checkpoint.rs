//! Checkpoints and rollback.
//!
//! A checkpoint is a deep copy of the run's variables and per-step outputs,
//! taken immediately before the flagged step executes. `serde_json::Value`
//! clones recursively, so later mutation of nested arrays or objects in the
//! live context never reaches a stored snapshot.

use crate::context::{ExecutionContext, StepOutputs};
use crate::error::ChainError;
use crate::handler::StepHandlers;
use crate::step::{RollbackOperation, Step};
use crate::value::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step_id: u32,
    pub created_at: DateTime<Utc>,
    pub variables: Variables,
    pub step_outputs: StepOutputs,
}

/// Audit record of a compensating operation that succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub step_id: u32,
    pub operation: RollbackOperation,
    pub performed_at: DateTime<Utc>,
}

/// Snapshot the context under `step_id`, replacing any earlier snapshot for
/// the same step.
pub fn checkpoint(ctx: &mut ExecutionContext, step_id: u32) {
    let snapshot = Checkpoint {
        step_id,
        created_at: Utc::now(),
        variables: ctx.variables.clone(),
        step_outputs: ctx.step_outputs.clone(),
    };
    ctx.checkpoints.insert(step_id, snapshot);
    tracing::debug!(run = %ctx.run_id, step = step_id, "Checkpoint created");
}

fn restore(ctx: &mut ExecutionContext, step_id: u32) -> bool {
    match ctx.checkpoints.get(&step_id) {
        Some(snapshot) => {
            ctx.variables = snapshot.variables.clone();
            ctx.step_outputs = snapshot.step_outputs.clone();
            true
        }
        None => false,
    }
}

/// Apply a failed step's rollback configuration.
///
/// Compensating operations run in order through the handlers; failures are
/// logged and skipped. Afterwards the context is restored from the
/// checkpoint of the lowest listed step, if one was taken. Returns that step
/// id when a restore happened.
pub async fn rollback_step(
    step: &Step,
    ctx: &mut ExecutionContext,
    handlers: &dyn StepHandlers,
) -> Option<u32> {
    let Some(config) = &step.rollback_config else {
        tracing::warn!(step = step.id, name = %step.name, "No rollback configuration for step");
        return None;
    };

    tracing::info!(
        run = %ctx.run_id,
        step = step.id,
        operations = config.rollback_operations.len(),
        "Performing rollback"
    );

    for operation in &config.rollback_operations {
        match handlers.compensate(step.id, operation).await {
            Ok(()) => ctx.rollback_stack.push(RollbackEntry {
                step_id: step.id,
                operation: operation.clone(),
                performed_at: Utc::now(),
            }),
            Err(err) => {
                let err = ChainError::RollbackOperation {
                    operation: operation.operation.clone(),
                    message: format!("{:#}", err),
                };
                tracing::error!(step = step.id, error = %err, "Rollback operation failed");
            }
        }
    }

    let restored = config
        .rollback_steps
        .iter()
        .min()
        .copied()
        .filter(|target| restore(ctx, *target));
    if let Some(target) = restored {
        tracing::info!(run = %ctx.run_id, checkpoint = target, "Restored context from checkpoint");
    }

    ctx.metadata.metrics.rolled_back_steps += 1;
    restored
}

/// Restore from the checkpoint with the numerically highest step id.
///
/// The highest id is not necessarily the most recent snapshot when step ids
/// do not follow execution order.
pub fn emergency_rollback(ctx: &mut ExecutionContext) -> Option<u32> {
    let target = *ctx.checkpoints.keys().next_back()?;
    restore(ctx, target);
    ctx.metadata.current_step = target as usize;
    tracing::warn!(run = %ctx.run_id, checkpoint = target, "Emergency rollback");
    Some(target)
}
