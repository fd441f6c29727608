//! Template compilation, caching and rendering.
//!
//! Syntax:
//!
//! - `{name}`, `{client.address.city}`: variable lookup by dotted path
//! - `{name|"Guest"}`: default used when the variable is absent
//! - `{price|currency}`, `{name|"x"|uppercase|trim}`: formatter chain
//! - `{{#if cond}}...{{else}}...{{/if}}`: conditional block
//! - `{{#each items as item}}...{{/each}}`: loop block
//!
//! ```rust
//! use chainflow::{TemplateEngine, Variables};
//! use serde_json::json;
//!
//! let engine = TemplateEngine::new();
//! let mut vars = Variables::new();
//! vars.insert("items".into(), json!([{"name": "a"}, {"name": "b"}]));
//!
//! let result = engine.render("{{#each items as it}}[{it.name}]{{/each}}", &vars);
//! assert_eq!(result.content, "[a][b]");
//! assert!(result.success);
//! ```

mod format;
mod parse;
mod syntax;

pub use syntax::SyntaxReport;

use crate::condition::{Condition, ConditionError};
use crate::error::ChainError;
use crate::value::{lookup_path, value_to_string, Lookup, Scope, Variables};
use chrono::{DateTime, Utc};
use parse::Node;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Default number of compiled templates kept in the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 500;

/// A `{...}` reference found in a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    /// Full dotted name as written (`client.name`).
    pub name: String,
    pub path: Vec<String>,
    /// True when no default was given.
    pub required: bool,
    pub default_value: Option<String>,
    pub formatters: Vec<String>,
}

/// An `{{#if}}` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalBlock {
    pub condition: String,
    pub content: String,
    pub else_content: Option<String>,
    pub(crate) guard: Result<Condition, ConditionError>,
    pub(crate) then_nodes: Vec<Node>,
    pub(crate) else_nodes: Vec<Node>,
}

impl ConditionalBlock {
    /// Parsed guard, or the syntax error found while compiling it.
    pub fn guard(&self) -> Result<&Condition, &ConditionError> {
        self.guard.as_ref()
    }
}

/// An `{{#each}}` block.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopBlock {
    pub content: String,
    pub array_variable: String,
    pub item_variable: String,
    pub(crate) body: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    fn classify(variables: usize, conditionals: usize, loops: usize) -> Self {
        let total = variables + conditionals + loops;
        if loops > 0 || conditionals > 3 || total > 15 {
            Complexity::Complex
        } else if conditionals > 0 || total > 5 {
            Complexity::Medium
        } else {
            Complexity::Simple
        }
    }
}

/// Parsed form of a template, reusable across renders.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    /// `tpl_` followed by the first 16 hex digits of the SHA-256 of the source.
    pub id: String,
    pub source: String,
    /// Unique by name, in order of first appearance.
    pub variables: Vec<TemplateVariable>,
    /// All conditionals, nested ones included.
    pub conditionals: Vec<ConditionalBlock>,
    /// All loops, nested ones included.
    pub loops: Vec<LoopBlock>,
    pub complexity: Complexity,
    pub compiled_at: DateTime<Utc>,
    nodes: Vec<Node>,
}

impl CompiledTemplate {
    fn build(id: String, source: &str) -> Self {
        let parsed = parse::parse(source);

        let mut variables: Vec<TemplateVariable> = Vec::new();
        for variable in parsed.variables {
            if !variables.iter().any(|v| v.name == variable.name) {
                variables.push(variable);
            }
        }

        let complexity = Complexity::classify(
            variables.len(),
            parsed.conditionals.len(),
            parsed.loops.len(),
        );

        Self {
            id,
            source: source.to_string(),
            variables,
            conditionals: parsed.conditionals,
            loops: parsed.loops,
            complexity,
            compiled_at: Utc::now(),
            nodes: parsed.nodes,
        }
    }
}

fn template_id(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("tpl_{}", hex)
}

/// Outcome of a render. Rendering never fails outright; problems are
/// reported through `success` and the lists below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    pub content: String,
    pub success: bool,
    pub variables_used: Vec<String>,
    pub variables_missing: Vec<String>,
    pub warnings: Vec<String>,
    pub security_issues: Vec<String>,
    pub conditionals_processed: usize,
    pub loops_processed: usize,
    pub processing_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct TemplateCache {
    entries: HashMap<String, Arc<CompiledTemplate>>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl TemplateCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    fn insert(&mut self, compiled: Arc<CompiledTemplate>) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    tracing::trace!(template = %oldest, "Evicted compiled template");
                }
                None => break,
            }
        }
        self.order.push_back(compiled.id.clone());
        self.entries.insert(compiled.id.clone(), compiled);
    }
}

/// Compiles, caches and renders templates.
///
/// The engine is `Sync`; share it between runs behind an `Arc`.
#[derive(Debug)]
pub struct TemplateEngine {
    cache: Mutex<TemplateCache>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(TemplateCache::new(capacity)),
        }
    }

    fn cache(&self) -> MutexGuard<'_, TemplateCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compile a template, reusing a cached result for identical text.
    pub fn compile(&self, source: &str) -> Arc<CompiledTemplate> {
        let id = template_id(source);
        let mut cache = self.cache();

        if let Some(hit) = cache.entries.get(&id).cloned() {
            cache.hits += 1;
            return hit;
        }
        cache.misses += 1;

        let compiled = Arc::new(CompiledTemplate::build(id, source));
        tracing::debug!(
            template = %compiled.id,
            variables = compiled.variables.len(),
            conditionals = compiled.conditionals.len(),
            loops = compiled.loops.len(),
            complexity = ?compiled.complexity,
            "Compiled template"
        );
        cache.insert(compiled.clone());
        compiled
    }

    /// Compile (or fetch) and render in one call.
    pub fn render(&self, source: &str, variables: &Variables) -> RenderResult {
        let compiled = self.compile(source);
        self.render_compiled(&compiled, variables)
    }

    /// Render a compiled template.
    ///
    /// Each nesting level is processed conditionals first, then loops, then
    /// plain variables. Any `{{` or `}}` left in the output afterwards is
    /// reported as a security issue.
    pub fn render_compiled(&self, template: &CompiledTemplate, variables: &Variables) -> RenderResult {
        let started = Instant::now();
        let mut renderer = Renderer {
            template,
            result: RenderResult::default(),
        };

        let content = renderer.render_nodes(&template.nodes, variables);
        let mut result = renderer.result;

        if content.contains("{{") || content.contains("}}") {
            result
                .security_issues
                .push("Unprocessed template blocks detected - potential injection risk".to_string());
        }

        result.content = content;
        result.success = result.variables_missing.is_empty() && result.security_issues.is_empty();
        result.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !result.success {
            tracing::debug!(
                template = %template.id,
                missing = ?result.variables_missing,
                security_issues = result.security_issues.len(),
                "Template rendered with problems"
            );
        }
        result
    }

    pub fn validate_syntax(&self, source: &str) -> SyntaxReport {
        validate_syntax(source)
    }

    pub fn check_syntax(&self, source: &str) -> Result<SyntaxReport, ChainError> {
        check_syntax(source)
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache();
        let lookups = cache.hits + cache.misses;
        CacheStats {
            size: cache.entries.len(),
            capacity: cache.capacity,
            hits: cache.hits,
            misses: cache.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                cache.hits as f64 / lookups as f64
            },
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache();
        cache.entries.clear();
        cache.order.clear();
        cache.hits = 0;
        cache.misses = 0;
    }
}

/// Check a template for unbalanced delimiters, malformed blocks and
/// script-like content.
pub fn validate_syntax(source: &str) -> SyntaxReport {
    syntax::validate(source)
}

/// Like [`validate_syntax`] but an invalid template is an error.
pub fn check_syntax(source: &str) -> Result<SyntaxReport, ChainError> {
    let report = syntax::validate(source);
    if report.valid {
        Ok(report)
    } else {
        Err(ChainError::TemplateSyntax {
            errors: report.errors,
        })
    }
}

struct Renderer<'t> {
    template: &'t CompiledTemplate,
    result: RenderResult,
}

impl Renderer<'_> {
    fn render_nodes(&mut self, nodes: &[Node], scope: &dyn Lookup) -> String {
        let mut rendered: Vec<Option<String>> = vec![None; nodes.len()];
        let template = self.template;

        for (slot, node) in rendered.iter_mut().zip(nodes) {
            if let Node::Conditional(index) = node {
                *slot = Some(self.conditional(&template.conditionals[*index], scope));
            }
        }

        for (slot, node) in rendered.iter_mut().zip(nodes) {
            if let Node::Loop(index) = node {
                *slot = Some(self.each(&template.loops[*index], scope));
            }
        }

        for (slot, node) in rendered.iter_mut().zip(nodes) {
            if let Node::Variable {
                variable,
                placeholder,
            } = node
            {
                *slot = Some(self.variable(variable, placeholder, scope));
            }
        }

        let mut out = String::new();
        for (slot, node) in rendered.iter().zip(nodes) {
            match (node, slot) {
                (Node::Text(text), _) => out.push_str(text),
                (_, Some(text)) => out.push_str(text),
                (_, None) => {}
            }
        }
        out
    }

    fn conditional(&mut self, block: &ConditionalBlock, scope: &dyn Lookup) -> String {
        let passed = match &block.guard {
            Ok(condition) => condition.evaluate(scope),
            Err(err) => {
                self.result
                    .warnings
                    .push(format!("Invalid condition '{}': {}", block.condition, err));
                false
            }
        };
        self.result.conditionals_processed += 1;

        let branch = if passed {
            &block.then_nodes
        } else {
            &block.else_nodes
        };
        self.render_nodes(branch, scope)
    }

    fn each(&mut self, block: &LoopBlock, scope: &dyn Lookup) -> String {
        self.result.loops_processed += 1;

        let path: Vec<&str> = block.array_variable.split('.').collect();
        match lookup_path(scope, &path) {
            Some(serde_json::Value::Array(items)) => {
                let mut out = String::new();
                for item in items {
                    let item_scope = Scope::bind(scope, &block.item_variable, item);
                    out.push_str(&self.render_nodes(&block.body, &item_scope));
                }
                out
            }
            Some(_) => {
                self.result.warnings.push(format!(
                    "Variable {} is not an array for loop processing",
                    block.array_variable
                ));
                String::new()
            }
            None => {
                push_unique(&mut self.result.variables_missing, &block.array_variable);
                String::new()
            }
        }
    }

    fn variable(&mut self, variable: &TemplateVariable, placeholder: &str, scope: &dyn Lookup) -> String {
        let resolved = lookup_path(scope, &variable.path).filter(|v| !v.is_null());

        let raw = match (resolved, &variable.default_value) {
            (Some(value), _) => {
                push_unique(&mut self.result.variables_used, &variable.name);
                value_to_string(value)
            }
            (None, Some(default)) => {
                self.result
                    .warnings
                    .push(format!("Used default value for variable: {}", variable.name));
                default.clone()
            }
            (None, None) => {
                push_unique(&mut self.result.variables_missing, &variable.name);
                return placeholder.to_string();
            }
        };

        let formatted = format::apply_formatters(raw, &variable.formatters, &mut self.result.warnings);
        format::sanitize(&formatted)
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}
