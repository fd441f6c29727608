//! Chain definition and builder.

use crate::condition::Condition;
use crate::error::ChainError;
use crate::step::{Step, StepKind};
use crate::value::Variables;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Schema entry for one chain input variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Informational type name (`string`, `number`, ...).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Free-form validation hint, carried but not enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Value>,
}

/// A chain: ordered steps sharing one variable context.
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub category: String,

    pub steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables_schema: Option<BTreeMap<String, VariableSpec>>,

    #[serde(default)]
    pub default_variables: Variables,
}

impl ChainDefinition {
    /// Create a new chain with a name.
    pub fn new(name: &str) -> ChainBuilder {
        ChainBuilder::new(name)
    }

    /// Check the chain's structure.
    ///
    /// Returns warnings for required variables that neither the schema, the
    /// defaults nor an earlier step provide; these may still arrive as caller
    /// input. Structural problems are collected into one validation error.
    pub fn validate(&self) -> Result<Vec<String>, ChainError> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.name.is_empty() {
            errors.push("Chain name cannot be empty".to_string());
        }
        if self.steps.is_empty() {
            errors.push("Chain must have at least one step".to_string());
        }

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for step in all_steps(&self.steps) {
            if !seen.insert(step.id) && !duplicates.contains(&step.id) {
                duplicates.push(step.id);
            }
            check_step(step, &mut errors);
        }
        if !duplicates.is_empty() {
            let ids: Vec<String> = duplicates.iter().map(u32::to_string).collect();
            errors.push(format!("Duplicate step IDs: {}", ids.join(", ")));
        }

        let mut available: HashSet<&str> = self.default_variables.keys().map(String::as_str).collect();
        if let Some(schema) = &self.variables_schema {
            available.extend(schema.keys().map(String::as_str));
        }
        for step in &self.steps {
            for name in &step.required_variables {
                if !available.contains(name.as_str()) {
                    warnings.push(format!(
                        "Step '{}' requires variable '{}' which is not provided by previous steps or input schema",
                        step.name, name
                    ));
                }
            }
            available.extend(step.declared_outputs());
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(ChainError::validation(format!(
                "Chain validation failed: {}",
                errors.join(", ")
            )))
        }
    }

    /// Build the starting variables for a run.
    ///
    /// Precedence, lowest first: schema defaults, `default_variables`,
    /// caller input. A required schema entry still absent afterwards is an
    /// error.
    pub fn initial_variables(&self, input: Variables) -> Result<Variables, ChainError> {
        let mut variables = Variables::new();

        if let Some(schema) = &self.variables_schema {
            for (name, spec) in schema {
                if let Some(default) = &spec.default {
                    variables.insert(name.clone(), default.clone());
                }
            }
        }
        variables.extend(self.default_variables.clone());
        variables.extend(input);

        if let Some(schema) = &self.variables_schema {
            let missing: Vec<&str> = schema
                .iter()
                .filter(|(name, spec)| spec.required && !variables.contains_key(name.as_str()))
                .map(|(name, _)| name.as_str())
                .collect();
            if !missing.is_empty() {
                return Err(ChainError::validation(format!(
                    "Missing required variables: {}",
                    missing.join(", ")
                )));
            }
        }

        Ok(variables)
    }

    /// Names of every variable some step declares as output.
    pub fn output_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for step in &self.steps {
            for name in step.declared_outputs() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Top-level steps followed by nested parallel members and fallbacks.
fn all_steps(steps: &[Step]) -> Vec<&Step> {
    let mut out = Vec::new();
    for step in steps {
        out.push(step);
        out.extend(all_steps(&step.parallel_steps));
        if let Some(fallback) = &step.fallback_step {
            out.extend(all_steps(std::slice::from_ref(fallback.as_ref())));
        }
    }
    out
}

fn check_step(step: &Step, errors: &mut Vec<String>) {
    match step.kind {
        StepKind::InstructionSet if step.instruction_set.is_none() => {
            errors.push(format!("Step {} ({}) has no instruction_set", step.id, step.name));
        }
        StepKind::TemplateProcessing if step.template.is_none() => {
            errors.push(format!("Step {} ({}) has no template", step.id, step.name));
        }
        StepKind::ParallelGroup if step.parallel_steps.is_empty() => {
            errors.push(format!("Step {} ({}) has no parallel_steps", step.id, step.name));
        }
        _ => {}
    }

    if let Some(guard) = &step.conditional_execution {
        if let Err(err) = Condition::parse(guard) {
            errors.push(format!(
                "Step {} ({}) has an invalid condition: {}",
                step.id, step.name, err
            ));
        }
    }
}

/// Builder for chain definitions.
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    chain: ChainDefinition,
}

impl ChainBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            chain: ChainDefinition {
                id: format!("chain_{}", name),
                name: name.to_string(),
                title: String::new(),
                description: String::new(),
                category: String::new(),
                steps: Vec::new(),
                variables_schema: None,
                default_variables: Variables::new(),
            },
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.chain.id = id.to_string();
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.chain.title = title.to_string();
        self
    }

    pub fn description(mut self, desc: &str) -> Self {
        self.chain.description = desc.to_string();
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.chain.category = category.to_string();
        self
    }

    /// Add a step to the chain.
    pub fn add<S: Into<Step>>(mut self, step: S) -> Self {
        self.chain.steps.push(step.into());
        self
    }

    /// Declare an input variable.
    pub fn variable(mut self, name: &str, spec: VariableSpec) -> Self {
        self.chain
            .variables_schema
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), spec);
        self
    }

    pub fn default_variable<V: Into<Value>>(mut self, name: &str, value: V) -> Self {
        self.chain.default_variables.insert(name.to_string(), value.into());
        self
    }

    pub fn build(self) -> ChainDefinition {
        self.chain
    }
}

impl From<ChainBuilder> for ChainDefinition {
    fn from(builder: ChainBuilder) -> Self {
        builder.build()
    }
}
