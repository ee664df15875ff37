//! Persistence collaborator, run ledger, and fetch utilities for ISLA.
//!
//! The pipeline only ever talks to storage through [`Persistence`] (insert,
//! conflict-aware upsert, column/row selects, named procedures) and
//! [`RunLedger`] (run and step bookkeeping). [`MemoryStore`] and [`PgStore`]
//! implement both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isla_core::{Row, Run, RunStatus, Step, StepStatus};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod archive;
mod http;
mod memory;
mod postgres;

pub use archive::{payload_digest, ArchivedPage, PageArchive};
pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, TokenBucket, TokenBucketConfig};
pub use memory::{MemoryStore, MemoryTables, ProcedureHandler};
pub use postgres::{PgStore, PoolConfig};

pub const CRATE_NAME: &str = "isla-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("unknown procedure `{0}`")]
    UnknownProcedure(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("{kind} {id} is already closed")]
    AlreadyClosed { kind: &'static str, id: Uuid },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// Outcome of one insert/upsert call. A call may succeed at the transport
/// level and still report a failure through `error`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub inserted: usize,
    pub updated: usize,
    pub error: Option<String>,
}

impl WriteReport {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            inserted: 0,
            updated: 0,
            error: Some(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Row filter understood by every persistence backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    NotNull(String),
    Equals(String, JsonValue),
}

impl Filter {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::NotNull(column) => row.get(column).is_some_and(|v| !v.is_null()),
            Filter::Equals(column, expected) => row.get(column) == Some(expected),
        }
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<WriteReport, StoreError>;

    /// Insert, or overwrite in place when a row with the same
    /// `conflict_columns` values already exists.
    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_columns: &[String],
    ) -> Result<WriteReport, StoreError>;

    /// Delete every row whose `key_columns` equal those of one of `keys`,
    /// null matching null. Returns the number of rows removed.
    async fn delete_keys(
        &self,
        table: &str,
        key_columns: &[String],
        keys: &[Row],
    ) -> Result<u64, StoreError>;

    async fn select_column(
        &self,
        table: &str,
        column: &str,
        filter: &Filter,
    ) -> Result<Vec<JsonValue>, StoreError>;

    async fn select_rows(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError>;

    async fn call_procedure(&self, name: &str, args: &JsonValue) -> Result<JsonValue, StoreError>;

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError>;
}

/// Durable trace of pipeline executions.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Close a running run. Closing twice is an error.
    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        metadata: &JsonValue,
    ) -> Result<(), StoreError>;

    async fn create_step(&self, step: &Step) -> Result<(), StoreError>;

    async fn finish_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        ended_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Steps of a run in creation order.
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError>;
}

/// Anything that can both store rows and record runs.
pub trait Store: Persistence + RunLedger {
    fn persistence(&self) -> &dyn Persistence;

    fn ledger(&self) -> &dyn RunLedger;
}

impl<T: Persistence + RunLedger> Store for T {
    fn persistence(&self) -> &dyn Persistence {
        self
    }

    fn ledger(&self) -> &dyn RunLedger {
        self
    }
}

/// Quote a possibly schema-qualified identifier, rejecting anything that is
/// not plain `[A-Za-z_][A-Za-z0-9_]*` per segment.
pub fn quote_ident(name: &str) -> Result<String, StoreError> {
    let mut parts = Vec::new();
    for part in name.split('.') {
        let mut chars = part.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_head || !valid_tail {
            return Err(StoreError::InvalidIdentifier(name.to_string()));
        }
        parts.push(format!("\"{part}\""));
    }
    Ok(parts.join("."))
}
