//! Chain definition loaders (YAML and JSON).

use crate::ChainDefinition;
use anyhow::{Context, Result};
use std::path::Path;

/// Parse a chain from a YAML string.
///
/// # Example
///
/// ```rust
/// use chainflow::parse_yaml;
///
/// let yaml = r#"
/// name: trip-planner
/// steps:
///   - id: 1
///     name: search
///     type: instruction_set
///     instruction_set: flight_search
///     required_variables: [origin]
///     output_variables: [flights]
/// "#;
///
/// let chain = parse_yaml(yaml).unwrap();
/// assert_eq!(chain.name, "trip-planner");
/// assert_eq!(chain.steps.len(), 1);
/// ```
pub fn parse_yaml(yaml: &str) -> Result<ChainDefinition> {
    let chain: ChainDefinition = serde_yaml::from_str(yaml).context("Failed to parse chain YAML")?;
    check(&chain)?;
    Ok(chain)
}

/// Parse a chain from a JSON string.
pub fn parse_json(json: &str) -> Result<ChainDefinition> {
    let chain: ChainDefinition = serde_json::from_str(json).context("Failed to parse chain JSON")?;
    check(&chain)?;
    Ok(chain)
}

/// Load and parse a chain file. Files ending in `.json` are read as JSON,
/// anything else as YAML.
///
/// ```rust,no_run
/// use chainflow::yaml::load_file;
///
/// let chain = load_file("chains/trip.yaml")?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_file(path: impl AsRef<Path>) -> Result<ChainDefinition> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read chain file: {}", path.display()))?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let parsed = if is_json {
        parse_json(&content)
    } else {
        parse_yaml(&content)
    };
    parsed.with_context(|| format!("Failed to parse chain file: {}", path.display()))
}

fn check(chain: &ChainDefinition) -> Result<()> {
    let warnings = chain.validate()?;
    for warning in warnings {
        tracing::warn!(chain = %chain.name, "{}", warning);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{FailurePolicy, StepKind};

    #[test]
    fn test_parse_simple_chain() {
        let yaml = r#"
id: chain_travel
name: travel-booking
title: Travel booking
description: Search and book a trip
category: travel
default_variables:
  currency: USD
steps:
  - id: 1
    name: search
    type: instruction_set
    instruction_set: flight_search
    required_variables: [origin, destination]
    output_variables: [flights]
    on_failure: retry
    retry_config:
      max_attempts: 2
      retry_delay_ms: 10
"#;

        let chain = parse_yaml(yaml).unwrap();
        assert_eq!(chain.name, "travel-booking");
        assert_eq!(chain.description, "Search and book a trip");
        assert_eq!(chain.default_variables["currency"], "USD");
        assert_eq!(chain.steps[0].kind, StepKind::InstructionSet);
        assert_eq!(chain.steps[0].on_failure, FailurePolicy::Retry);
        assert_eq!(chain.steps[0].retry_config.as_ref().unwrap().max_attempts, 2);
    }

    #[test]
    fn test_parse_nested_steps() {
        let yaml = r#"
name: lookups
steps:
  - id: 1
    name: fan-out
    type: parallel_group
    parallel_steps:
      - id: 2
        name: hotels
        type: database_operation
        output_variables: [hotels]
      - id: 3
        name: cars
        type: database_operation
        output_variables: [cars]
    fallback_step:
      id: 4
      name: cached
      type: database_operation
"#;

        let chain = parse_yaml(yaml).unwrap();
        assert_eq!(chain.steps[0].parallel_steps.len(), 2);
        assert_eq!(chain.steps[0].fallback_step.as_ref().unwrap().id, 4);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "name": "notify",
            "steps": [{"id": 1, "name": "send", "type": "database_operation"}]
        }"#;
        let chain = parse_json(json).unwrap();
        assert_eq!(chain.steps[0].operation_name(), "send");
    }

    #[test]
    fn test_rejects_invalid_definitions() {
        let cases = [
            ("name: \"\"\nsteps: [{id: 1, name: load, type: database_operation}]", "Chain name cannot be empty"),
            ("name: idle\nsteps: []", "Chain must have at least one step"),
            (
                "name: trip\nsteps: [{id: 1, name: search, type: instruction_set}]",
                "Step 1 (search) has no instruction_set",
            ),
            (
                "name: trip\nsteps:\n  - {id: 1, name: a, type: database_operation, conditional_execution: \"a ==\"}",
                "Step 1 (a) has an invalid condition",
            ),
        ];

        for (yaml, expected) in cases {
            let err = parse_yaml(yaml).unwrap_err();
            assert!(format!("{:#}", err).contains(expected), "{}: {:#}", expected, err);
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_file("does/not/exist.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read chain file"));
    }
}
