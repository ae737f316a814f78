//! Session repository collaborator
//!
//! The orchestrator reads the current schema for a session and appends
//! transcript entries; storage details stay behind this trait.

use async_trait::async_trait;
use schemaflow_core::{Result, TranscriptEntry};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Current schema snapshot for a session (`Null` when none exists yet)
    async fn load_schema(&self, session_id: &str) -> Result<Value>;

    /// Persist one transcript entry
    async fn append_transcript(&self, session_id: &str, entry: &TranscriptEntry) -> Result<()>;
}

/// In-process repository
#[derive(Debug, Default)]
pub struct MemoryRepository {
    schemas: RwLock<HashMap<String, Value>>,
    transcripts: RwLock<HashMap<String, Vec<TranscriptEntry>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the schema for a session
    pub fn with_schema(mut self, session_id: impl Into<String>, schema: Value) -> Self {
        self.schemas.get_mut().insert(session_id.into(), schema);
        self
    }

    pub async fn transcript(&self, session_id: &str) -> Vec<TranscriptEntry> {
        self.transcripts
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn load_schema(&self, session_id: &str) -> Result<Value> {
        Ok(self
            .schemas
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn append_transcript(&self, session_id: &str, entry: &TranscriptEntry) -> Result<()> {
        self.transcripts
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }
}
