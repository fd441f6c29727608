//! Chain step definitions.

use crate::value::Variables;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a step does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Delegates to [`StepHandlers::run_instruction`](crate::StepHandlers::run_instruction).
    InstructionSet,
    /// Renders the template named by `template`.
    TemplateProcessing,
    /// Delegates to [`StepHandlers::run_data_operation`](crate::StepHandlers::run_data_operation).
    DatabaseOperation,
    /// Runs `parallel_steps` concurrently.
    ParallelGroup,
}

/// Reaction of the chain to a step that failed after the runner gave up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Fail,
    /// Log and continue with the next step.
    Warn,
    /// Stop processing further steps; the run still completes.
    Skip,
    Retry,
    /// Run the step's rollback configuration, then abort.
    Rollback,
    Fallback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Retry behaviour for a failing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_exponential_backoff")]
    pub exponential_backoff: bool,

    /// Substrings (case-insensitive) that mark an error as retryable.
    #[serde(default = "default_retry_conditions")]
    pub retry_conditions: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_exponential_backoff() -> bool {
    true
}

fn default_retry_conditions() -> Vec<String> {
    vec![
        "timeout".to_string(),
        "network_error".to_string(),
        "temporary_failure".to_string(),
    ]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: default_exponential_backoff(),
            retry_conditions: default_retry_conditions(),
        }
    }
}

impl RetryConfig {
    /// Whether an error message matches one of the retry conditions.
    pub fn is_retryable(&self, error: &str) -> bool {
        let error = error.to_lowercase();
        self.retry_conditions
            .iter()
            .any(|condition| error.contains(&condition.to_lowercase()))
    }

    /// Delay before retry `n` (the first retry is `n = 1`).
    pub fn delay_before(&self, retry: u32) -> Duration {
        let base = self.retry_delay_ms;
        let ms = if self.exponential_backoff {
            let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
            base.saturating_mul(factor)
        } else {
            base
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOperationKind {
    DatabaseOperation,
    FileOperation,
    ApiCall,
    Custom,
}

/// A compensating action, performed by the host's handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOperation {
    #[serde(rename = "type")]
    pub kind: RollbackOperationKind,
    pub operation: String,
    #[serde(default)]
    pub parameters: Variables,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Steps whose checkpoints may be restored; the lowest id is used.
    #[serde(default)]
    pub rollback_steps: Vec<u32>,
    #[serde(default)]
    pub rollback_operations: Vec<RollbackOperation>,
}

/// A single step in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within a chain.
    pub id: u32,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "type")]
    pub kind: StepKind,

    /// Instruction name, or data operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_set: Option<String>,

    /// Template name for template steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Rendered against the variables to build an instruction's input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_template: Option<String>,

    #[serde(default)]
    pub required_variables: Vec<String>,

    #[serde(default)]
    pub output_variables: Vec<String>,

    /// Guard expression; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_execution: Option<String>,

    #[serde(default)]
    pub on_failure: FailurePolicy,

    /// Bound on each attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_config: Option<RollbackConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step: Option<Box<Step>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_steps: Vec<Step>,

    #[serde(default)]
    pub checkpoint: bool,

    #[serde(default)]
    pub priority: Priority,
}

impl Step {
    /// Create an instruction step.
    pub fn instruction(id: u32, name: &str, instruction: &str) -> StepBuilder {
        StepBuilder::new(id, name, StepKind::InstructionSet).target(instruction)
    }

    /// Create a template rendering step.
    pub fn template(id: u32, name: &str, template: &str) -> StepBuilder {
        let mut builder = StepBuilder::new(id, name, StepKind::TemplateProcessing);
        builder.step.template = Some(template.to_string());
        builder
    }

    /// Create a data operation step. The step name doubles as the operation
    /// name unless [`StepBuilder::target`] overrides it.
    pub fn data_operation(id: u32, name: &str) -> StepBuilder {
        StepBuilder::new(id, name, StepKind::DatabaseOperation)
    }

    /// Create a group whose members run concurrently.
    pub fn parallel<I, S>(id: u32, name: &str, steps: I) -> StepBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<Step>,
    {
        let mut builder = StepBuilder::new(id, name, StepKind::ParallelGroup);
        builder.step.parallel_steps = steps.into_iter().map(Into::into).collect();
        builder
    }

    /// Name passed to the data operation handler.
    pub fn operation_name(&self) -> &str {
        self.instruction_set.as_deref().unwrap_or(&self.name)
    }

    /// Effective retry configuration.
    pub fn retry_or<'a>(&'a self, default: &'a RetryConfig) -> &'a RetryConfig {
        self.retry_config.as_ref().unwrap_or(default)
    }

    /// Variables this step (or a parallel member) declares as outputs.
    pub fn declared_outputs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.output_variables.iter().map(String::as_str).collect();
        for member in &self.parallel_steps {
            for name in member.declared_outputs() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Builder for chain steps.
#[derive(Debug, Clone)]
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    pub fn new(id: u32, name: &str, kind: StepKind) -> Self {
        Self {
            step: Step {
                id,
                name: name.to_string(),
                description: None,
                kind,
                instruction_set: None,
                template: None,
                input_template: None,
                required_variables: Vec::new(),
                output_variables: Vec::new(),
                conditional_execution: None,
                on_failure: FailurePolicy::default(),
                timeout_ms: None,
                retry_config: None,
                rollback_config: None,
                fallback_step: None,
                parallel_steps: Vec::new(),
                checkpoint: false,
                priority: Priority::default(),
            },
        }
    }

    /// Set the instruction or data operation name.
    pub fn target(mut self, name: &str) -> Self {
        self.step.instruction_set = Some(name.to_string());
        self
    }

    pub fn description(mut self, desc: &str) -> Self {
        self.step.description = Some(desc.to_string());
        self
    }

    pub fn input_template(mut self, template: &str) -> Self {
        self.step.input_template = Some(template.to_string());
        self
    }

    /// Declare a required input variable.
    pub fn requires(mut self, name: &str) -> Self {
        self.step.required_variables.push(name.to_string());
        self
    }

    /// Declare an output variable.
    pub fn output(mut self, name: &str) -> Self {
        self.step.output_variables.push(name.to_string());
        self
    }

    /// Only run when `condition` holds.
    pub fn when(mut self, condition: &str) -> Self {
        self.step.conditional_execution = Some(condition.to_string());
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.step.on_failure = policy;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.step.timeout_ms = Some(ms);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.step.retry_config = Some(config);
        self
    }

    pub fn rollback(mut self, config: RollbackConfig) -> Self {
        self.step.rollback_config = Some(config);
        self
    }

    pub fn fallback<S: Into<Step>>(mut self, step: S) -> Self {
        self.step.fallback_step = Some(Box::new(step.into()));
        self
    }

    /// Snapshot the context before this step runs.
    pub fn checkpoint(mut self) -> Self {
        self.step.checkpoint = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.step.priority = priority;
        self
    }

    pub fn build(self) -> Step {
        self.step
    }
}

impl From<StepBuilder> for Step {
    fn from(builder: StepBuilder) -> Self {
        builder.build()
    }
}
