//! Persistence contract for chain definitions, templates and execution logs.

use crate::chain::ChainDefinition;
use crate::error::ChainError;
use crate::result::{ChainResult, ChainStatus};
use crate::template::{check_syntax, SyntaxReport};
use crate::value::Variables;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Summary of a finished run, appended to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: String,
    pub chain_id: String,
    pub chain_name: String,
    pub status: ChainStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_duration_ms: f64,
    pub steps_executed: usize,
    pub steps_failed: usize,
    pub outputs: Variables,
}

impl ExecutionRecord {
    pub fn from_result(chain: &ChainDefinition, result: &ChainResult, session_id: Option<&str>) -> Self {
        Self {
            run_id: result.run_id.clone(),
            chain_id: result.chain_id.clone(),
            chain_name: chain.name.clone(),
            status: result.status,
            error: result.error.clone(),
            session_id: session_id.map(str::to_string),
            started_at: result.metadata.started_at,
            ended_at: result.metadata.ended_at,
            total_duration_ms: result.metadata.total_duration_ms,
            steps_executed: result.metadata.steps_executed,
            steps_failed: result.metadata.steps_failed,
            outputs: result.outputs.clone(),
        }
    }
}

/// Storage backend for definitions and execution logs.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Load a chain definition by name.
    async fn load_chain(&self, name: &str) -> Result<ChainDefinition, ChainError>;

    /// Load template text by name.
    async fn load_template(&self, name: &str) -> Result<String, ChainError>;

    /// Append a record for a finished run.
    async fn append_execution(&self, record: ExecutionRecord) -> Result<(), ChainError>;
}

/// In-memory implementation of [`ChainStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    chains: RwLock<HashMap<String, ChainDefinition>>,
    templates: RwLock<HashMap<String, String>>,
    executions: RwLock<Vec<ExecutionRecord>>,
}

impl MemoryStore {
    /// Creates a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chain under its name after validating it.
    pub async fn insert_chain(&self, chain: ChainDefinition) -> Result<(), ChainError> {
        chain.validate()?;
        self.chains.write().await.insert(chain.name.clone(), chain);
        Ok(())
    }

    /// Store a template after a syntax check. The report's warnings are
    /// returned for the caller to surface.
    pub async fn insert_template(&self, name: &str, text: &str) -> Result<SyntaxReport, ChainError> {
        let report = check_syntax(text)?;
        self.templates
            .write()
            .await
            .insert(name.to_string(), text.to_string());
        Ok(report)
    }

    pub async fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions.read().await.clone()
    }
}

#[async_trait]
impl ChainStore for MemoryStore {
    async fn load_chain(&self, name: &str) -> Result<ChainDefinition, ChainError> {
        self.chains
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ChainError::not_found(format!("Chain '{}' not found", name)))
    }

    async fn load_template(&self, name: &str) -> Result<String, ChainError> {
        self.templates
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ChainError::not_found(format!("Template '{}' not found", name)))
    }

    async fn append_execution(&self, record: ExecutionRecord) -> Result<(), ChainError> {
        self.executions.write().await.push(record);
        Ok(())
    }
}
