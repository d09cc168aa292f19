//! Command record storage: at-most-once command semantics keyed by
//! `commandId`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub command_id: String,
    pub command_type: String,
    pub correlation_id: String,
    pub status: CommandStatus,
    /// Compact result digest, stored once `status` becomes terminal.
    pub result_digest: Option<serde_json::Value>,
}

/// Outcome of [`CommandRecordStore::begin`]: whether the caller should run
/// the pipeline, or was handed a prior/in-flight result.
pub enum BeginOutcome {
    /// No prior record; proceed with the pipeline.
    Start,
    /// A completed record already exists; return its digest unchanged.
    AlreadyCompleted(CommandRecord),
    /// A record is mid-flight; this caller is a duplicate retry.
    InFlight(CommandRecord),
}

#[async_trait]
pub trait CommandRecordStore: Send + Sync {
    async fn begin(
        &self,
        command_id: &str,
        command_type: &str,
        correlation_id: &str,
    ) -> Result<BeginOutcome, CommandError>;

    async fn complete(
        &self,
        command_id: &str,
        result_digest: serde_json::Value,
    ) -> Result<(), CommandError>;

    async fn fail(&self, command_id: &str, reason: &str) -> Result<(), CommandError>;
}

#[derive(Default)]
pub struct InMemoryCommandRecordStore {
    records: Arc<RwLock<HashMap<String, CommandRecord>>>,
}

impl InMemoryCommandRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandRecordStore for InMemoryCommandRecordStore {
    async fn begin(
        &self,
        command_id: &str,
        command_type: &str,
        correlation_id: &str,
    ) -> Result<BeginOutcome, CommandError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(command_id) {
            return Ok(match existing.status {
                CommandStatus::Completed => BeginOutcome::AlreadyCompleted(existing.clone()),
                CommandStatus::Pending => BeginOutcome::InFlight(existing.clone()),
                CommandStatus::Failed => BeginOutcome::Start,
            });
        }
        records.insert(
            command_id.to_string(),
            CommandRecord {
                command_id: command_id.to_string(),
                command_type: command_type.to_string(),
                correlation_id: correlation_id.to_string(),
                status: CommandStatus::Pending,
                result_digest: None,
            },
        );
        Ok(BeginOutcome::Start)
    }

    async fn complete(
        &self,
        command_id: &str,
        result_digest: serde_json::Value,
    ) -> Result<(), CommandError> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(command_id) {
            record.status = CommandStatus::Completed;
            record.result_digest = Some(result_digest);
        }
        Ok(())
    }

    async fn fail(&self, command_id: &str, reason: &str) -> Result<(), CommandError> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(command_id) {
            record.status = CommandStatus::Failed;
            record.result_digest = Some(serde_json::json!({"error": reason}));
        }
        Ok(())
    }
}
