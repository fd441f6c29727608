//! Executes one step: kind dispatch, per-attempt timeout, retry with
//! backoff, and fallback substitution.

use crate::condition::Condition;
use crate::error::ChainError;
use crate::handler::StepHandlers;
use crate::result::{AttemptMode, StepResult};
use crate::step::{RetryConfig, Step, StepKind};
use crate::template::{CompiledTemplate, TemplateEngine};
use crate::value::Variables;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Compiled templates for a run, keyed by template name.
pub type TemplateSet = HashMap<String, Arc<CompiledTemplate>>;

/// Result of running a step, with the error that ended it on failure.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    pub error: Option<ChainError>,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        self.result.success
    }
}

/// Output of one successful attempt.
#[derive(Debug, Default)]
struct Attempt {
    outputs: Variables,
    warnings: Vec<String>,
}

pub struct StepRunner<'r> {
    handlers: &'r dyn StepHandlers,
    engine: &'r TemplateEngine,
    templates: &'r TemplateSet,
    default_retry: &'r RetryConfig,
}

impl<'r> StepRunner<'r> {
    pub fn new(
        handlers: &'r dyn StepHandlers,
        engine: &'r TemplateEngine,
        templates: &'r TemplateSet,
        default_retry: &'r RetryConfig,
    ) -> Self {
        Self {
            handlers,
            engine,
            templates,
            default_retry,
        }
    }

    /// Run a step against a read-only view of the variables.
    ///
    /// A failed attempt is retried only while attempts remain and its error
    /// text matches a retry condition. When the step finally fails and has a
    /// fallback, the fallback runs once and its result stands in for the
    /// step's.
    pub fn run<'a>(&'a self, step: &'a Step, variables: &'a Variables) -> BoxFuture<'a, StepOutcome> {
        async move {
            let retry = step.retry_or(self.default_retry);
            let max_attempts = retry.max_attempts.max(1);
            let mut result = StepResult::new(step.id, Utc::now());
            let mut attempt = 1;

            let last_error = loop {
                result.retry_attempt = attempt;
                match self.attempt(step, variables).await {
                    Ok(done) => {
                        result.success = true;
                        result.outputs = done.outputs;
                        result.warnings.extend(done.warnings);
                        if attempt > 1 {
                            result.timing.mode = AttemptMode::Retry;
                        }
                        result.finish();
                        result
                            .logs
                            .push(format!("Step {} executed in {:.1}ms", step.name, result.timing.duration_ms));
                        return StepOutcome {
                            result,
                            error: None,
                        };
                    }
                    Err(message) => {
                        result.errors.push(message.clone());
                        if attempt < max_attempts && retry.is_retryable(&message) {
                            let delay = retry.delay_before(attempt);
                            tracing::warn!(
                                step = step.id,
                                attempt,
                                max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %message,
                                "Retrying step"
                            );
                            result.timing.mode = AttemptMode::Retry;
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        break message;
                    }
                }
            };

            if let Some(fallback) = &step.fallback_step {
                return self.run_fallback(step, fallback, variables, result, last_error).await;
            }

            let error = if attempt > 1 {
                ChainError::RetryExhausted {
                    step_id: step.id,
                    step: step.name.clone(),
                    attempts: attempt,
                    message: last_error,
                }
            } else {
                ChainError::StepExecution {
                    step_id: step.id,
                    step: step.name.clone(),
                    message: last_error,
                }
            };
            result.finish();
            tracing::debug!(step = step.id, error = %error, "Step failed");
            StepOutcome {
                result,
                error: Some(error),
            }
        }
        .boxed()
    }

    async fn run_fallback(
        &self,
        step: &Step,
        fallback: &Step,
        variables: &Variables,
        mut result: StepResult,
        primary_error: String,
    ) -> StepOutcome {
        tracing::info!(step = step.id, fallback = fallback.id, "Using fallback step");
        result.fallback_used = true;
        result.timing.mode = AttemptMode::Fallback;
        result
            .warnings
            .push(format!("Primary step failed, fallback used: {}", primary_error));

        let outcome = match self.attempt(fallback, variables).await {
            Ok(done) => {
                result.success = true;
                result.outputs = done.outputs;
                result.warnings.extend(done.warnings);
                None
            }
            Err(message) => {
                result.errors.push(message.clone());
                Some(ChainError::StepExecution {
                    step_id: step.id,
                    step: step.name.clone(),
                    message: format!("fallback step {} failed: {}", fallback.id, message),
                })
            }
        };
        result.finish();
        StepOutcome {
            result,
            error: outcome,
        }
    }

    /// One attempt, bounded by the step's timeout.
    async fn attempt(&self, step: &Step, variables: &Variables) -> Result<Attempt, String> {
        let work = self.dispatch(step, variables);
        match step.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), work).await {
                Ok(done) => done,
                Err(_) => Err(format!("Step timeout after {} ms", ms)),
            },
            None => work.await,
        }
    }

    async fn dispatch(&self, step: &Step, variables: &Variables) -> Result<Attempt, String> {
        match step.kind {
            StepKind::InstructionSet => self.instruction(step, variables).await,
            StepKind::TemplateProcessing => self.template(step, variables),
            StepKind::DatabaseOperation => self
                .handlers
                .run_data_operation(step.operation_name(), variables)
                .await
                .map(|outputs| Attempt {
                    outputs,
                    warnings: Vec::new(),
                })
                .map_err(|err| format!("{:#}", err)),
            StepKind::ParallelGroup => self.group(step, variables).await,
        }
    }

    async fn instruction(&self, step: &Step, variables: &Variables) -> Result<Attempt, String> {
        let name = step
            .instruction_set
            .as_deref()
            .ok_or_else(|| "Instruction step requires instruction_set name".to_string())?;

        let mut warnings = Vec::new();
        let input = match &step.input_template {
            Some(template) => {
                let rendered = self.engine.render(template, variables);
                if rendered.success {
                    rendered.content
                } else {
                    warnings.push(format!(
                        "Input template could not be rendered (missing: {}); using empty input",
                        rendered.variables_missing.join(", ")
                    ));
                    String::new()
                }
            }
            None => String::new(),
        };

        let outputs = self
            .handlers
            .run_instruction(name, &input, variables)
            .await
            .map_err(|err| format!("{:#}", err))?;
        Ok(Attempt { outputs, warnings })
    }

    fn template(&self, step: &Step, variables: &Variables) -> Result<Attempt, String> {
        let name = step
            .template
            .as_deref()
            .ok_or_else(|| "Template step requires template name".to_string())?;
        let compiled = self
            .templates
            .get(name)
            .ok_or_else(|| format!("Template '{}' not found", name))?;

        let rendered = self.engine.render_compiled(compiled, variables);
        if !rendered.success {
            let mut problems = Vec::new();
            if !rendered.variables_missing.is_empty() {
                problems.push(format!("missing variables: {}", rendered.variables_missing.join(", ")));
            }
            problems.extend(rendered.security_issues);
            return Err(format!("Template rendering failed: {}", problems.join("; ")));
        }

        let key = step
            .output_variables
            .first()
            .map(String::as_str)
            .unwrap_or("template_output");
        let mut outputs = Variables::new();
        outputs.insert(key.to_string(), serde_json::Value::String(rendered.content));
        Ok(Attempt {
            outputs,
            warnings: rendered.warnings,
        })
    }

    /// Run members concurrently; outputs merge in declaration order.
    /// Members whose guard is false are left out.
    async fn group(&self, step: &Step, variables: &Variables) -> Result<Attempt, String> {
        let members: Vec<&Step> = step
            .parallel_steps
            .iter()
            .filter(|member| guard_allows(member, variables))
            .collect();
        let outcomes = join_all(members.iter().map(|member| self.run(member, variables))).await;

        let mut merged = Attempt::default();
        let mut failures = Vec::new();
        for (member, outcome) in members.iter().zip(outcomes) {
            match outcome.error {
                None => {
                    merged.outputs.extend(outcome.result.outputs);
                    merged.warnings.extend(outcome.result.warnings);
                }
                Some(err) => failures.push(format!("step {}: {}", member.id, err)),
            }
        }

        if failures.is_empty() {
            Ok(merged)
        } else {
            Err(format!("Parallel group failed: {}", failures.join("; ")))
        }
    }
}

fn guard_allows(step: &Step, variables: &Variables) -> bool {
    match step.conditional_execution.as_deref().map(Condition::parse) {
        None => true,
        Some(Ok(guard)) => guard.evaluate(variables),
        Some(Err(err)) => {
            tracing::warn!(step = step.id, error = %err, "Invalid step condition, skipping");
            false
        }
    }
}
