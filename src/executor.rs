//! Chain execution engine.

use crate::chain::ChainDefinition;
use crate::checkpoint::{self, emergency_rollback, rollback_step};
use crate::condition::Condition;
use crate::config::{EngineConfig, ExecuteOptions};
use crate::context::ExecutionContext;
use crate::error::ChainError;
use crate::handler::StepHandlers;
use crate::phase::{check_cycles, launch_order, plan_phases, Phase};
use crate::registry::{ExecutionRegistry, RunRecord};
use crate::result::{ChainResult, ChainStatus, PerformanceMetrics, RunMetadata, StepResult};
use crate::runner::{StepOutcome, StepRunner, TemplateSet};
use crate::step::{FailurePolicy, Step, StepKind};
use crate::store::{ChainStore, ExecutionRecord};
use crate::template::TemplateEngine;
use crate::value::Variables;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Runs chains against injected step handlers.
///
/// Cloning is cheap; clones share the template engine, registry and store.
#[derive(Clone)]
pub struct ChainExecutor {
    handlers: Arc<dyn StepHandlers>,
    store: Option<Arc<dyn ChainStore>>,
    engine: Arc<TemplateEngine>,
    registry: Arc<ExecutionRegistry>,
    config: EngineConfig,
}

/// A chain running on its own task.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: String,
    handle: JoinHandle<ChainResult>,
}

impl RunHandle {
    /// Wait for the run to finish.
    pub async fn wait(self) -> anyhow::Result<ChainResult> {
        self.handle.await.context("Chain run task failed")
    }
}

impl ChainExecutor {
    pub fn new(handlers: Arc<dyn StepHandlers>) -> Self {
        Self::with_config(handlers, EngineConfig::default())
    }

    pub fn with_config(handlers: Arc<dyn StepHandlers>, config: EngineConfig) -> Self {
        Self {
            handlers,
            store: None,
            engine: Arc::new(TemplateEngine::with_capacity(config.template_cache_size)),
            registry: Arc::new(ExecutionRegistry::new(config.max_concurrent_runs)),
            config,
        }
    }

    /// Source of chain definitions and templates, and sink for execution logs.
    pub fn with_store(mut self, store: Arc<dyn ChainStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_engine(mut self, engine: Arc<TemplateEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ExecutionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<TemplateEngine> {
        &self.engine
    }

    /// Execute a chain.
    ///
    /// Never fails: problems are reported through the result's `status` and
    /// `error` fields.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use chainflow::{ChainDefinition, ChainExecutor, ExecuteOptions, Step, StepHandlers, Variables};
    /// use std::sync::Arc;
    ///
    /// # async fn demo(handlers: Arc<dyn StepHandlers>) {
    /// let chain = ChainDefinition::new("trip")
    ///     .add(Step::instruction(1, "search", "flight_search").output("flights"))
    ///     .add(Step::data_operation(2, "save_itinerary").requires("flights"))
    ///     .build();
    ///
    /// let executor = ChainExecutor::new(handlers);
    /// let result = executor
    ///     .execute(&chain, Variables::new(), ExecuteOptions::default())
    ///     .await;
    /// println!("{}: {:?}", result.status, result.outputs);
    /// # }
    /// ```
    pub async fn execute(
        &self,
        chain: &ChainDefinition,
        variables: Variables,
        options: ExecuteOptions,
    ) -> ChainResult {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let mut record = RunRecord::new(&run_id, &chain.id, &chain.name, chain.steps.len());
        record.session_id = options.session_id.clone();
        if let Err(err) = self.registry.register(record).await {
            tracing::warn!(chain = %chain.name, error = %err, "Run rejected");
            return failed_before_start(&run_id, &chain.id, &options, started_at, err);
        }

        self.execute_registered(run_id, chain, variables, options).await
    }

    /// Load a chain from the store by name and execute it.
    pub async fn run_chain(&self, name: &str, variables: Variables, options: ExecuteOptions) -> ChainResult {
        match self.load_chain(name).await {
            Ok(chain) => self.execute(&chain, variables, options).await,
            Err(err) => {
                tracing::warn!(chain = %name, error = %err, "Chain could not be loaded");
                failed_before_start(&Uuid::new_v4().to_string(), name, &options, Utc::now(), err)
            }
        }
    }

    /// Start a chain on a new task and return its run id immediately.
    ///
    /// The run is registered before this returns, so it can be cancelled
    /// through [`registry`](Self::registry) right away.
    pub async fn spawn(
        &self,
        chain: ChainDefinition,
        variables: Variables,
        options: ExecuteOptions,
    ) -> Result<RunHandle, ChainError> {
        let run_id = Uuid::new_v4().to_string();
        let mut record = RunRecord::new(&run_id, &chain.id, &chain.name, chain.steps.len());
        record.session_id = options.session_id.clone();
        self.registry.register(record).await?;

        let executor = self.clone();
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            executor
                .execute_registered(task_run_id, &chain, variables, options)
                .await
        });

        Ok(RunHandle { run_id, handle })
    }

    async fn load_chain(&self, name: &str) -> Result<ChainDefinition, ChainError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| ChainError::not_found(format!("Chain '{}' not found: no store configured", name)))?;
        store.load_chain(name).await
    }

    async fn execute_registered(
        &self,
        run_id: String,
        chain: &ChainDefinition,
        variables: Variables,
        options: ExecuteOptions,
    ) -> ChainResult {
        let started_at = Utc::now();
        tracing::info!(
            chain = %chain.name,
            run = %run_id,
            steps = chain.steps.len(),
            mode = ?options.execution_mode,
            "Starting chain"
        );

        let result = match self.prepare(&run_id, chain, variables, &options).await {
            Ok(prepared) => {
                let runner = StepRunner::new(
                    &*self.handlers,
                    &self.engine,
                    &prepared.templates,
                    &self.config.default_retry,
                );
                let mut run = Run {
                    chain,
                    options: &options,
                    handlers: &*self.handlers,
                    registry: &self.registry,
                    runner,
                    guards: prepared.guards,
                    ctx: prepared.ctx,
                    step_results: Vec::new(),
                    recovery_actions: Vec::new(),
                    rollbacks_performed: 0,
                    started: Instant::now(),
                    deadline: options
                        .timeout_ms
                        .map(|ms| Instant::now() + Duration::from_millis(ms)),
                };
                let outcome = run.drive().await;
                run.finish(outcome, started_at)
            }
            Err(err) => {
                tracing::warn!(chain = %chain.name, run = %run_id, error = %err, "Chain rejected");
                failed_before_start(&run_id, &chain.id, &options, started_at, err)
            }
        };

        self.registry.remove(&run_id).await;

        tracing::info!(
            chain = %chain.name,
            run = %run_id,
            status = %result.status,
            total_ms = result.metadata.total_duration_ms,
            "Chain finished"
        );

        if options.save_progress {
            self.save(chain, &result, options.session_id.as_deref()).await;
        }
        result
    }

    async fn save(&self, chain: &ChainDefinition, result: &ChainResult, session_id: Option<&str>) {
        let Some(store) = &self.store else {
            tracing::debug!(run = %result.run_id, "No store configured; execution log not saved");
            return;
        };
        let record = ExecutionRecord::from_result(chain, result, session_id);
        if let Err(err) = store.append_execution(record).await {
            tracing::error!(run = %result.run_id, error = %err, "Failed to save execution log");
        }
    }

    /// Validate the chain, build starting variables and compile templates.
    async fn prepare(
        &self,
        run_id: &str,
        chain: &ChainDefinition,
        input: Variables,
        options: &ExecuteOptions,
    ) -> Result<Prepared, ChainError> {
        for warning in chain.validate()? {
            tracing::debug!(chain = %chain.name, "{}", warning);
        }

        let mut variables = chain.initial_variables(input)?;
        if let Some(session_id) = &options.session_id {
            variables.insert("session_id".to_string(), Value::String(session_id.clone()));
        }
        check_cycles(&chain.steps, &variables)?;

        let mut guards = HashMap::new();
        for step in &chain.steps {
            if let Some(source) = &step.conditional_execution {
                guards.insert(step.id, Condition::parse(source)?);
            }
        }

        let mut templates = TemplateSet::new();
        for name in template_names(&chain.steps) {
            if templates.contains_key(name) {
                continue;
            }
            let store = self.store.as_ref().ok_or_else(|| {
                ChainError::not_found(format!("Template '{}' not found: no store configured", name))
            })?;
            let text = store.load_template(name).await?;
            templates.insert(name.to_string(), self.engine.compile(&text));
        }

        let ctx = ExecutionContext::new(
            run_id,
            &chain.id,
            variables,
            chain.steps.len(),
            options.execution_mode,
        );
        Ok(Prepared {
            ctx,
            templates,
            guards,
        })
    }
}

/// Template names referenced anywhere in the step tree.
fn template_names(steps: &[Step]) -> Vec<&str> {
    let mut names = Vec::new();
    for step in steps {
        if step.kind == StepKind::TemplateProcessing {
            if let Some(name) = &step.template {
                names.push(name.as_str());
            }
        }
        names.extend(template_names(&step.parallel_steps));
        if let Some(fallback) = &step.fallback_step {
            names.extend(template_names(std::slice::from_ref(&**fallback)));
        }
    }
    names
}

fn failed_before_start(
    run_id: &str,
    chain_id: &str,
    options: &ExecuteOptions,
    started_at: DateTime<Utc>,
    err: ChainError,
) -> ChainResult {
    let ended_at = Utc::now();
    ChainResult {
        run_id: run_id.to_string(),
        chain_id: chain_id.to_string(),
        status: ChainStatus::Failed,
        final_context: Variables::new(),
        outputs: Variables::new(),
        error: Some(err.to_string()),
        step_results: Vec::new(),
        performance_metrics: PerformanceMetrics::default(),
        checkpoints_used: 0,
        rollbacks_performed: 0,
        metadata: RunMetadata {
            started_at,
            ended_at,
            total_duration_ms: elapsed_ms(started_at, ended_at),
            steps_executed: 0,
            steps_failed: 0,
            steps_retried: 0,
            execution_mode: options.execution_mode,
            recovery_actions: Vec::new(),
        },
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(0) as f64 / 1000.0
}

struct Prepared {
    ctx: ExecutionContext,
    templates: TemplateSet,
    guards: HashMap<u32, Condition>,
}

/// Whether processing continues after a step.
enum Flow {
    Continue,
    /// A `skip` policy fired; the run ends successfully.
    Stop,
}

/// Why a run ended early.
enum Abort {
    Failed(ChainError),
    /// A `rollback` policy already restored the context.
    RolledBack(ChainError),
    Cancelled,
}

/// State of one run while it is being driven.
struct Run<'a> {
    chain: &'a ChainDefinition,
    options: &'a ExecuteOptions,
    handlers: &'a dyn StepHandlers,
    registry: &'a ExecutionRegistry,
    runner: StepRunner<'a>,
    guards: HashMap<u32, Condition>,
    ctx: ExecutionContext,
    step_results: Vec<StepResult>,
    recovery_actions: Vec<String>,
    rollbacks_performed: usize,
    started: Instant,
    deadline: Option<Instant>,
}

impl<'a> Run<'a> {
    async fn drive(&mut self) -> Result<(), Abort> {
        let chain = self.chain;
        let phases = plan_phases(&chain.steps, self.options.execution_mode);
        let mut position = 0;

        for phase in &phases {
            match phase {
                Phase::Sequential(steps) => {
                    for step in steps {
                        position += 1;
                        self.gate(position).await?;
                        if let Flow::Stop = self.run_step(step).await? {
                            return Ok(());
                        }
                    }
                }
                Phase::Parallel(steps) => {
                    self.gate(position + 1).await?;
                    position += steps.len();
                    if let Flow::Stop = self.run_phase(steps).await? {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Checked before every step or phase.
    async fn gate(&mut self, position: usize) -> Result<(), Abort> {
        if !self.registry.is_active(&self.ctx.run_id).await {
            tracing::info!(run = %self.ctx.run_id, "Run cancelled");
            return Err(Abort::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Abort::Failed(ChainError::Timeout {
                    elapsed_ms: self.started.elapsed().as_millis() as u64,
                }));
            }
        }
        self.ctx.metadata.current_step = position;
        self.registry.set_current_step(&self.ctx.run_id, position).await;
        Ok(())
    }

    /// Guard, required variables and checkpoint. `None` means the guard
    /// skipped the step; otherwise whether a checkpoint was taken.
    fn admit(&mut self, step: &Step) -> Result<Option<bool>, Abort> {
        if let Some(guard) = self.guards.get(&step.id) {
            if !guard.evaluate(&self.ctx.variables) {
                tracing::info!(step = step.id, name = %step.name, "Skipping step, condition not met");
                return Ok(None);
            }
        }

        let missing = self.ctx.missing(&step.required_variables);
        if !missing.is_empty() {
            return Err(Abort::Failed(ChainError::validation(format!(
                "Step {} ({}) is missing required variables: {}",
                step.id,
                step.name,
                missing.join(", ")
            ))));
        }

        let checkpointed = step.checkpoint && self.options.enable_checkpoints;
        if checkpointed {
            checkpoint::checkpoint(&mut self.ctx, step.id);
        }
        Ok(Some(checkpointed))
    }

    async fn run_step(&mut self, step: &Step) -> Result<Flow, Abort> {
        let Some(checkpointed) = self.admit(step)? else {
            return Ok(Flow::Continue);
        };

        tracing::debug!(step = step.id, name = %step.name, kind = ?step.kind, "Executing step");
        let outcome = self.runner.run(step, &self.ctx.variables).await;
        self.apply(step, outcome, checkpointed).await
    }

    /// Fan out a phase, then handle results in declaration order.
    async fn run_phase(&mut self, steps: &[&'a Step]) -> Result<Flow, Abort> {
        let mut admitted: Vec<(&'a Step, bool)> = Vec::new();
        for step in steps {
            if let Some(checkpointed) = self.admit(step)? {
                admitted.push((*step, checkpointed));
            }
        }

        let members: Vec<&Step> = admitted.iter().map(|(step, _)| *step).collect();
        let order = launch_order(&members);
        tracing::debug!(steps = members.len(), "Executing parallel phase");

        let runner = &self.runner;
        let variables = &self.ctx.variables;
        let finished = join_all(order.iter().map(|&i| runner.run(members[i], variables))).await;

        let mut outcomes: Vec<Option<StepOutcome>> = members.iter().map(|_| None).collect();
        for (index, outcome) in order.into_iter().zip(finished) {
            outcomes[index] = Some(outcome);
        }

        let mut flow = Flow::Continue;
        let mut abort = None;
        for ((step, checkpointed), outcome) in admitted.into_iter().zip(outcomes) {
            let Some(outcome) = outcome else { continue };
            if abort.is_some() {
                self.record(step, outcome, checkpointed);
                continue;
            }
            match self.apply(step, outcome, checkpointed).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => flow = Flow::Stop,
                Err(err) => abort = Some(err),
            }
        }

        match abort {
            Some(err) => Err(err),
            None => Ok(flow),
        }
    }

    /// Count a phase member that finished after an earlier sibling aborted
    /// the run. Its outputs are not merged and its policy is not applied.
    fn record(&mut self, step: &Step, outcome: StepOutcome, checkpointed: bool) {
        let StepOutcome { mut result, error } = outcome;
        self.count_attempts(step, &mut result, checkpointed);
        match error {
            None => self.ctx.metadata.metrics.completed_steps += 1,
            Some(err) => {
                self.ctx.metadata.metrics.failed_steps += 1;
                tracing::warn!(step = step.id, error = %err, "Step failed in aborted phase");
            }
        }
        self.step_results.push(result);
    }

    fn count_attempts(&mut self, step: &Step, result: &mut StepResult, checkpointed: bool) {
        result.checkpoint_created = checkpointed;
        if result.is_retry() {
            self.ctx.metadata.metrics.retried_steps += 1;
            self.ctx.retry_attempts.insert(step.id, result.retry_attempt - 1);
        }
    }

    /// Merge a successful step or apply its failure policy.
    async fn apply(&mut self, step: &Step, outcome: StepOutcome, checkpointed: bool) -> Result<Flow, Abort> {
        let StepOutcome { mut result, error } = outcome;
        self.count_attempts(step, &mut result, checkpointed);

        let Some(err) = error else {
            let mut declared = step.declared_outputs();
            if result.fallback_used {
                if let Some(fallback) = &step.fallback_step {
                    declared.extend(fallback.declared_outputs());
                }
            }
            self.ctx.merge_outputs(step.id, &declared, &result.outputs);
            self.ctx.metadata.metrics.completed_steps += 1;
            tracing::debug!(step = step.id, duration_ms = result.timing.duration_ms, "Step completed");
            self.step_results.push(result);
            return Ok(Flow::Continue);
        };

        self.ctx.metadata.metrics.failed_steps += 1;
        match step.on_failure {
            FailurePolicy::Warn => {
                tracing::warn!(step = step.id, error = %err, "Step failed, continuing");
                result.warnings.push(format!("Failure ignored: {}", err));
                self.step_results.push(result);
                Ok(Flow::Continue)
            }
            FailurePolicy::Skip => {
                tracing::warn!(step = step.id, error = %err, "Step failed, skipping remaining steps");
                self.step_results.push(result);
                Ok(Flow::Stop)
            }
            FailurePolicy::Rollback if self.options.enable_rollback => {
                let restored = rollback_step(step, &mut self.ctx, self.handlers).await;
                result.rollback_performed = true;
                self.rollbacks_performed += 1;
                self.recovery_actions.push(match restored {
                    Some(target) => format!(
                        "Rolled back step {} to checkpoint at step {}",
                        step.id, target
                    ),
                    None => format!("Rolled back step {} without checkpoint restore", step.id),
                });
                self.step_results.push(result);
                Err(Abort::RolledBack(ChainError::RolledBack {
                    step_id: step.id,
                    step: step.name.clone(),
                    message: err.to_string(),
                }))
            }
            _ => {
                tracing::error!(step = step.id, error = %err, "Step failed");
                self.step_results.push(result);
                Err(Abort::Failed(err))
            }
        }
    }

    fn finish(mut self, outcome: Result<(), Abort>, started_at: DateTime<Utc>) -> ChainResult {
        let (status, error) = match outcome {
            Ok(()) => (ChainStatus::Completed, None),
            Err(Abort::Cancelled) => (ChainStatus::Cancelled, Some("Execution cancelled".to_string())),
            Err(Abort::RolledBack(err)) => (ChainStatus::Failed, Some(err.to_string())),
            Err(Abort::Failed(err)) => {
                if self.options.enable_rollback {
                    if let Some(target) = emergency_rollback(&mut self.ctx) {
                        self.rollbacks_performed += 1;
                        self.recovery_actions
                            .push(format!("Emergency rollback to checkpoint at step {}", target));
                    }
                }
                (ChainStatus::Failed, Some(err.to_string()))
            }
        };

        let mut metrics = self.ctx.metadata.metrics.clone();
        metrics.finalize(&self.step_results);

        let outputs: Variables = self
            .chain
            .output_names()
            .into_iter()
            .filter_map(|name| {
                self.ctx
                    .variables
                    .get(name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect();

        let ended_at = Utc::now();
        ChainResult {
            run_id: self.ctx.run_id.clone(),
            chain_id: self.ctx.chain_id.clone(),
            status,
            outputs,
            error,
            performance_metrics: metrics.clone(),
            checkpoints_used: self.ctx.checkpoints.len(),
            rollbacks_performed: self.rollbacks_performed,
            metadata: RunMetadata {
                started_at,
                ended_at,
                total_duration_ms: elapsed_ms(started_at, ended_at),
                steps_executed: self.step_results.len(),
                steps_failed: metrics.failed_steps,
                steps_retried: metrics.retried_steps,
                execution_mode: self.options.execution_mode,
                recovery_actions: self.recovery_actions,
            },
            step_results: self.step_results,
            final_context: self.ctx.variables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::VariableSpec;
    use crate::config::ExecutionMode;
    use crate::step::{Priority, RetryConfig, RollbackConfig, RollbackOperation, RollbackOperationKind};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Handlers scripted per operation name. Instructions and data
    /// operations share one namespace.
    #[derive(Default)]
    struct Scripted {
        outputs: HashMap<String, Variables>,
        failures: HashMap<String, String>,
        delays: HashMap<String, u64>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn returns(mut self, name: &str, outputs: Value) -> Self {
            self.outputs
                .insert(name.to_string(), outputs.as_object().cloned().unwrap());
            self
        }

        fn fails(mut self, name: &str, message: &str) -> Self {
            self.failures.insert(name.to_string(), message.to_string());
            self
        }

        fn delay(mut self, name: &str, ms: u64) -> Self {
            self.delays.insert(name.to_string(), ms);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn respond(&self, name: &str) -> anyhow::Result<Variables> {
            self.calls.lock().unwrap().push(name.to_string());
            if let Some(ms) = self.delays.get(name) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if let Some(message) = self.failures.get(name) {
                anyhow::bail!("{}", message);
            }
            Ok(self.outputs.get(name).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl StepHandlers for Scripted {
        async fn run_instruction(&self, name: &str, _input: &str, _: &Variables) -> anyhow::Result<Variables> {
            self.respond(name).await
        }

        async fn run_data_operation(&self, name: &str, _: &Variables) -> anyhow::Result<Variables> {
            self.respond(name).await
        }

        async fn compensate(&self, _step_id: u32, operation: &RollbackOperation) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("compensate:{}", operation.operation));
            Ok(())
        }
    }

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap()
    }

    fn executor(handlers: &Arc<Scripted>) -> ChainExecutor {
        init_tracing();
        ChainExecutor::new(handlers.clone())
    }

    fn recoverable() -> ExecuteOptions {
        ExecuteOptions::default().checkpoints(true).rollback(true)
    }

    fn no_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sequential_chain_with_template() {
        let handlers = Arc::new(
            Scripted::default()
                .returns("flight_search", json!({"flights": ["TP123"], "debug": "dropped"}))
                .returns("price", json!({"total": 1234.5})),
        );
        let store = Arc::new(MemoryStore::new());
        store
            .insert_template("trip_summary", "{{#each flights as f}}{f} {{/each}}costs {total|currency}")
            .await
            .unwrap();
        let executor = executor(&handlers).with_store(store);

        let chain = ChainDefinition::new("trip")
            .add(Step::instruction(1, "search", "flight_search").requires("origin").output("flights"))
            .add(Step::data_operation(2, "price").requires("flights").output("total"))
            .add(Step::template(3, "summary", "trip_summary").requires("total").output("summary"))
            .build();

        let result = executor
            .execute(&chain, vars(json!({"origin": "LIS"})), ExecuteOptions::default())
            .await;

        assert_eq!(result.status, ChainStatus::Completed, "{:?}", result.error);
        assert_eq!(result.outputs["summary"], json!("TP123 costs $1,234.50"));
        assert_eq!(result.outputs.len(), 3);
        assert!(result.final_context.get("debug").is_none());
        assert_eq!(result.step_results.len(), 3);
        assert_eq!(result.performance_metrics.completed_steps, 3);
        assert!(result.performance_metrics.fastest_step.is_some());
        assert_eq!(handlers.calls(), vec!["flight_search", "price"]);
        assert!(!executor.registry().is_active(&result.run_id).await);
    }

    #[tokio::test]
    async fn test_missing_required_variable_fails_before_step() {
        let handlers = Arc::new(Scripted::default());
        let chain = ChainDefinition::new("trip")
            .add(Step::data_operation(1, "load").output("customer"))
            .add(Step::data_operation(2, "charge").requires("card"))
            .build();

        let result = executor(&handlers)
            .execute(&chain, Variables::new(), ExecuteOptions::default())
            .await;

        assert_eq!(result.status, ChainStatus::Failed);
        assert!(result
            .error
            .unwrap()
            .contains("Step 2 (charge) is missing required variables: card"));
        assert_eq!(handlers.calls(), vec!["load"]);
    }

    #[tokio::test]
    async fn test_guard_skips_step() {
        let handlers = Arc::new(Scripted::default());
        let chain = ChainDefinition::new("upsell")
            .add(Step::data_operation(1, "lounge_offer").when("tier == 'gold' && miles > 1000"))
            .add(Step::data_operation(2, "confirm"))
            .build();

        let result = executor(&handlers)
            .execute(&chain, vars(json!({"tier": "gold", "miles": 10})), ExecuteOptions::default())
            .await;

        assert!(result.is_success());
        assert_eq!(handlers.calls(), vec!["confirm"]);
        assert!(result.step(1).is_none());
    }

    #[tokio::test]
    async fn test_warn_continues_and_skip_stops() {
        let handlers = Arc::new(
            Scripted::default()
                .fails("optional", "bad request")
                .fails("stopper", "bad request"),
        );
        let chain = ChainDefinition::new("policies")
            .add(Step::data_operation(1, "optional").on_failure(FailurePolicy::Warn))
            .add(Step::data_operation(2, "stopper").on_failure(FailurePolicy::Skip))
            .add(Step::data_operation(3, "never"))
            .build();

        let result = executor(&handlers)
            .execute(&chain, Variables::new(), ExecuteOptions::default())
            .await;

        assert_eq!(result.status, ChainStatus::Completed);
        assert_eq!(handlers.calls(), vec!["optional", "stopper"]);
        assert_eq!(result.performance_metrics.failed_steps, 2);
        assert!(result.step(1).unwrap().warnings[0].starts_with("Failure ignored"));
    }

    #[tokio::test]
    async fn test_failure_triggers_emergency_rollback() {
        let handlers = Arc::new(
            Scripted::default()
                .returns("reserve", json!({"hold": "H1"}))
                .fails("pay", "card declined"),
        );
        let chain = ChainDefinition::new("booking")
            .add(Step::data_operation(1, "reserve").output("hold").checkpoint())
            .add(Step::data_operation(2, "pay").checkpoint())
            .build();

        let result = executor(&handlers)
            .execute(&chain, vars(json!({"user": "ada"})), recoverable())
            .await;

        assert_eq!(result.status, ChainStatus::Failed);
        assert_eq!(result.checkpoints_used, 2);
        assert_eq!(result.rollbacks_performed, 1);
        assert_eq!(
            result.metadata.recovery_actions,
            vec!["Emergency rollback to checkpoint at step 2"]
        );
        assert_eq!(result.final_context["hold"], json!("H1"));
        assert!(result.error.unwrap().contains("card declined"));
    }

    #[tokio::test]
    async fn test_checkpoints_and_rollback_are_opt_in() {
        let handlers = Arc::new(
            Scripted::default()
                .returns("reserve", json!({"hold": "H1"}))
                .fails("pay", "card declined"),
        );
        let chain = ChainDefinition::new("booking")
            .add(Step::data_operation(1, "reserve").output("hold").checkpoint())
            .add(Step::data_operation(2, "pay").checkpoint())
            .build();
        let executor = executor(&handlers);

        let result = executor
            .execute(&chain, Variables::new(), ExecuteOptions::default())
            .await;
        assert_eq!(result.status, ChainStatus::Failed);
        assert_eq!(result.checkpoints_used, 0);
        assert_eq!(result.rollbacks_performed, 0);
        assert!(!result.step(1).unwrap().checkpoint_created);
        assert_eq!(result.final_context["hold"], json!("H1"));

        let result = executor
            .execute(&chain, Variables::new(), ExecuteOptions::default().checkpoints(true))
            .await;
        assert_eq!(result.checkpoints_used, 2);
        assert_eq!(result.rollbacks_performed, 0);
        assert!(result.metadata.recovery_actions.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_policy() {
        let handlers = Arc::new(
            Scripted::default()
                .returns("reserve", json!({"hold": "H1"}))
                .fails("pay", "card declined"),
        );
        let chain = ChainDefinition::new("booking")
            .add(Step::data_operation(1, "reserve").output("hold").checkpoint())
            .add(
                Step::data_operation(2, "pay")
                    .retry(no_retry())
                    .on_failure(FailurePolicy::Rollback)
                    .rollback(RollbackConfig {
                        rollback_steps: vec![1],
                        rollback_operations: vec![RollbackOperation {
                            kind: RollbackOperationKind::ApiCall,
                            operation: "release_hold".to_string(),
                            parameters: Variables::new(),
                        }],
                    }),
            )
            .build();

        let result = executor(&handlers)
            .execute(&chain, Variables::new(), recoverable())
            .await;

        assert_eq!(result.status, ChainStatus::Failed);
        let error = result.error.clone().unwrap();
        assert!(error.starts_with("Step 2 (pay) failed and rollback performed:"));
        assert!(error.contains("card declined"));
        assert!(result.final_context.get("hold").is_none());
        assert_eq!(handlers.calls(), vec!["reserve", "pay", "compensate:release_hold"]);
        assert!(result.step(2).unwrap().rollback_performed);
        assert_eq!(result.performance_metrics.rolled_back_steps, 1);
        assert_eq!(
            result.metadata.recovery_actions,
            vec!["Rolled back step 2 to checkpoint at step 1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_merge_is_declaration_order() {
        // The later-declared sibling finishes first in one run and last in
        // the other; it wins both times.
        for (first_delay, second_delay) in [(50, 10), (10, 50)] {
            let handlers = Arc::new(
                Scripted::default()
                    .returns("first", json!({"shared": "first", "a": 1}))
                    .returns("second", json!({"shared": "second", "b": 2}))
                    .delay("first", first_delay)
                    .delay("second", second_delay),
            );
            let chain = ChainDefinition::new("fan-out")
                .add(Step::data_operation(1, "first").output("shared").output("a"))
                .add(Step::data_operation(2, "second").output("shared").output("b"))
                .build();

            let result = executor(&handlers)
                .execute(
                    &chain,
                    Variables::new(),
                    ExecuteOptions::default().mode(ExecutionMode::Parallel),
                )
                .await;

            assert!(result.is_success());
            assert_eq!(result.final_context["shared"], json!("second"));
            assert_eq!(result.final_context["a"], json!(1));
            assert_eq!(result.final_context["b"], json!(2));
            let ids: Vec<u32> = result.step_results.iter().map(|r| r.step_id).collect();
            assert_eq!(ids, vec![1, 2]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_siblings_run_concurrently() {
        let handlers = Arc::new(
            Scripted::default()
                .delay("hotels", 100)
                .delay("cars", 100)
                .fails("cars", "bad request"),
        );
        let chain = ChainDefinition::new("lookups")
            .add(Step::data_operation(1, "hotels").on_failure(FailurePolicy::Warn))
            .add(Step::data_operation(2, "cars").on_failure(FailurePolicy::Warn))
            .build();

        let started = Instant::now();
        let result = executor(&handlers)
            .execute(
                &chain,
                Variables::new(),
                ExecuteOptions::default().mode(ExecutionMode::Parallel),
            )
            .await;

        assert!(result.is_success());
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(result.performance_metrics.completed_steps, 1);
        assert_eq!(result.performance_metrics.failed_steps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_abort_records_finished_siblings() {
        let handlers = Arc::new(
            Scripted::default()
                .fails("bad", "bad request")
                .returns("good", json!({"rooms": 3}))
                .fails("late_fail", "bad request")
                .delay("good", 20),
        );
        let chain = ChainDefinition::new("lookups")
            .add(Step::data_operation(1, "bad"))
            .add(Step::data_operation(2, "good").output("rooms"))
            .add(Step::data_operation(3, "late_fail"))
            .build();

        let result = executor(&handlers)
            .execute(
                &chain,
                Variables::new(),
                ExecuteOptions::default().mode(ExecutionMode::Parallel),
            )
            .await;

        assert_eq!(result.status, ChainStatus::Failed);
        assert!(result.error.as_ref().unwrap().contains("bad request"));
        assert_eq!(handlers.calls(), vec!["bad", "good", "late_fail"]);
        let ids: Vec<u32> = result.step_results.iter().map(|r| r.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(result.step(2).unwrap().success);
        assert_eq!(result.performance_metrics.completed_steps, 1);
        assert_eq!(result.performance_metrics.failed_steps, 2);
        assert_eq!(result.metadata.steps_executed, 3);
        // only the aborting member's policy applies; later outputs stay out
        assert!(result.final_context.get("rooms").is_none());
    }

    #[tokio::test]
    async fn test_hybrid_mode() {
        let handlers = Arc::new(
            Scripted::default()
                .returns("search", json!({"flights": [1]}))
                .returns("hotels", json!({"hotels": [2]}))
                .returns("book", json!({"booking": "B1"})),
        );
        let chain = ChainDefinition::new("trip")
            .add(Step::data_operation(1, "search").output("flights").priority(Priority::Low))
            .add(Step::data_operation(2, "hotels").output("hotels").priority(Priority::High))
            .add(
                Step::data_operation(3, "book")
                    .requires("flights")
                    .requires("hotels")
                    .output("booking"),
            )
            .build();

        let result = executor(&handlers)
            .execute(&chain, Variables::new(), ExecuteOptions::default().mode(ExecutionMode::Hybrid))
            .await;

        assert!(result.is_success());
        assert_eq!(result.outputs["booking"], json!("B1"));
        assert_eq!(handlers.calls(), vec!["hotels", "search", "book"]);
        assert_eq!(result.metadata.execution_mode, ExecutionMode::Hybrid);
    }

    #[tokio::test]
    async fn test_cancel_before_first_phase() {
        let handlers = Arc::new(Scripted::default());
        let executor = executor(&handlers);
        let chain = ChainDefinition::new("trip")
            .add(Step::data_operation(1, "search"))
            .build();

        let handle = executor
            .spawn(chain, Variables::new(), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(executor.registry().cancel(&handle.run_id).await);

        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, ChainStatus::Cancelled);
        assert!(handlers.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_steps() {
        let handlers = Arc::new(Scripted::default().delay("search", 100));
        let executor = executor(&handlers);
        let chain = ChainDefinition::new("trip")
            .add(Step::data_operation(1, "search"))
            .add(Step::data_operation(2, "book"))
            .build();

        let handle = executor
            .spawn(chain, Variables::new(), ExecuteOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = executor.registry().get(&handle.run_id).await.unwrap();
        assert_eq!(record.current_step, 1);
        executor.registry().cancel(&handle.run_id).await;

        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, ChainStatus::Cancelled);
        assert_eq!(handlers.calls(), vec!["search"]);
        assert_eq!(result.step_results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let handlers = Arc::new(Scripted::default().delay("slow", 100));
        let chain = ChainDefinition::new("slow")
            .add(Step::data_operation(1, "slow"))
            .add(Step::data_operation(2, "after"))
            .build();

        let result = executor(&handlers)
            .execute(&chain, Variables::new(), ExecuteOptions::default().timeout_ms(50))
            .await;

        assert_eq!(result.status, ChainStatus::Failed);
        assert!(result.error.unwrap().contains("timeout"));
        assert_eq!(handlers.calls(), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_invalid_chains_fail_before_handlers() {
        let handlers = Arc::new(Scripted::default());
        let executor = executor(&handlers);

        let dupes = ChainDefinition::new("dupes")
            .add(Step::data_operation(1, "a"))
            .add(Step::data_operation(1, "b"))
            .build();
        let result = executor.execute(&dupes, Variables::new(), ExecuteOptions::default()).await;
        assert_eq!(result.status, ChainStatus::Failed);
        assert!(result.error.unwrap().contains("Duplicate step IDs: 1"));

        let cycle = ChainDefinition::new("cycle")
            .add(Step::data_operation(1, "a").requires("y").output("x"))
            .add(Step::data_operation(2, "b").requires("x").output("y"))
            .build();
        let result = executor.execute(&cycle, Variables::new(), ExecuteOptions::default()).await;
        assert!(result.error.unwrap().contains("Circular dependency"));

        assert!(handlers.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_and_fallback_metrics() {
        let handlers = Arc::new(
            Scripted::default()
                .fails("live_rates", "network_error")
                .returns("cached_rates", json!({"rates": "cached"})),
        );
        let chain = ChainDefinition::new("rates")
            .add(
                Step::data_operation(1, "live_rates")
                    .output("rates")
                    .retry(RetryConfig {
                        max_attempts: 3,
                        retry_delay_ms: 10,
                        ..RetryConfig::default()
                    })
                    .fallback(Step::data_operation(2, "cached_rates")),
            )
            .build();

        let result = executor(&handlers)
            .execute(&chain, Variables::new(), ExecuteOptions::default())
            .await;

        assert!(result.is_success());
        assert_eq!(result.outputs["rates"], json!("cached"));
        assert_eq!(
            handlers.calls(),
            vec!["live_rates", "live_rates", "live_rates", "cached_rates"]
        );
        let step = result.step(1).unwrap();
        assert!(step.fallback_used);
        assert_eq!(step.retry_attempt, 3);
        assert_eq!(result.performance_metrics.retried_steps, 1);
        assert_eq!(result.metadata.steps_retried, 1);
    }

    #[tokio::test]
    async fn test_run_chain_from_store_and_save_progress() {
        let handlers = Arc::new(Scripted::default().returns("greet", json!({"greeting": "hi"})));
        let store = Arc::new(MemoryStore::new());
        store
            .insert_chain(
                ChainDefinition::new("hello")
                    .variable(
                        "name",
                        VariableSpec {
                            required: true,
                            ..VariableSpec::default()
                        },
                    )
                    .add(Step::instruction(1, "greet", "greet").output("greeting"))
                    .build(),
            )
            .await
            .unwrap();
        let executor = executor(&handlers).with_store(store.clone());
        let options = ExecuteOptions::default().save_progress(true).session("sess-1");

        let result = executor
            .run_chain("hello", vars(json!({"name": "Ada"})), options.clone())
            .await;
        assert!(result.is_success());
        assert_eq!(result.final_context["session_id"], json!("sess-1"));

        let records = store.executions().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_id, result.run_id);
        assert_eq!(records[0].session_id.as_deref(), Some("sess-1"));
        assert_eq!(records[0].outputs["greeting"], json!("hi"));

        let result = executor.run_chain("hello", Variables::new(), options.clone()).await;
        assert!(result.error.unwrap().contains("Missing required variables: name"));

        let result = executor.run_chain("nope", Variables::new(), options).await;
        assert_eq!(result.status, ChainStatus::Failed);
        assert!(result.error.unwrap().contains("Chain 'nope' not found"));
        assert_eq!(store.executions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_template_fails_before_start() {
        let handlers = Arc::new(Scripted::default());
        let chain = ChainDefinition::new("letters")
            .add(Step::template(1, "letter", "cover_letter"))
            .build();

        let result = executor(&handlers)
            .execute(&chain, Variables::new(), ExecuteOptions::default())
            .await;
        assert!(result
            .error
            .unwrap()
            .contains("Template 'cover_letter' not found"));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let handlers = Arc::new(Scripted::default());
        let config = EngineConfig {
            max_concurrent_runs: 1,
            ..EngineConfig::default()
        };
        let executor = ChainExecutor::with_config(handlers.clone(), config);
        executor
            .registry()
            .register(RunRecord::new("busy", "c", "other", 1))
            .await
            .unwrap();

        let chain = ChainDefinition::new("trip")
            .add(Step::data_operation(1, "search"))
            .build();
        let result = executor.execute(&chain, Variables::new(), ExecuteOptions::default()).await;

        assert_eq!(result.status, ChainStatus::Failed);
        assert!(result.error.unwrap().contains("Capacity exceeded"));
        assert!(handlers.calls().is_empty());
    }
}
