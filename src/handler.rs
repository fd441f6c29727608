//! Host-supplied step handlers.

use crate::step::RollbackOperation;
use crate::value::Variables;
use async_trait::async_trait;

/// Performs the work behind each step kind.
///
/// Template steps are rendered by the engine itself and parallel groups
/// dispatch to their members, so only instruction and data operation steps
/// reach the handlers. Returned maps may contain more keys than the step
/// declares; only declared outputs are kept in the chain context.
///
/// Errors are matched against a step's retry conditions by their display
/// text, so include words such as `timeout` or `network_error` when a
/// failure is transient.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use chainflow::{StepHandlers, Variables};
/// use serde_json::json;
///
/// struct Echo;
///
/// #[async_trait]
/// impl StepHandlers for Echo {
///     async fn run_instruction(
///         &self,
///         name: &str,
///         input: &str,
///         _variables: &Variables,
///     ) -> anyhow::Result<Variables> {
///         let mut out = Variables::new();
///         out.insert("reply".into(), json!(format!("{}: {}", name, input)));
///         Ok(out)
///     }
///
///     async fn run_data_operation(
///         &self,
///         _name: &str,
///         _variables: &Variables,
///     ) -> anyhow::Result<Variables> {
///         Ok(Variables::new())
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandlers: Send + Sync {
    /// Execute a named instruction with rendered input text.
    async fn run_instruction(
        &self,
        name: &str,
        input: &str,
        variables: &Variables,
    ) -> anyhow::Result<Variables>;

    /// Execute a named data operation.
    async fn run_data_operation(&self, name: &str, variables: &Variables) -> anyhow::Result<Variables>;

    /// Perform a compensating operation during rollback.
    async fn compensate(&self, step_id: u32, operation: &RollbackOperation) -> anyhow::Result<()> {
        tracing::info!(
            step = step_id,
            kind = ?operation.kind,
            operation = %operation.operation,
            "Rollback operation acknowledged"
        );
        Ok(())
    }
}
