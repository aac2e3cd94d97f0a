//! Backend seam between the resilient client and a concrete store.
//!
//! [`StoreConnector`] opens connections; [`StoreConnection`] runs commands on
//! one. The Redis backend and the in-memory backend both implement these.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Rejected by the circuit breaker without touching the store.
    #[error("store circuit breaker is open")]
    CircuitOpen,

    /// Could not reach the store, or the connection dropped.
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store did not answer within the operation timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered but rejected the command.
    #[error("store command failed: {0}")]
    Command(String),

    /// The store answered with data we could not interpret.
    #[error("store value could not be decoded: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether the error says the store is unavailable (as opposed to the
    /// store answering with an error).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Timeout(_))
    }
}

/// One command inside an atomic batch.
///
/// Scores are millisecond timestamps. Every command yields an integer reply.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    /// Remove sorted-set members whose score is at most `max`.
    RemoveRangeByScore { key: String, max: i64 },
    /// Add `member` with `score` to a sorted set.
    ScoredAdd { key: String, score: i64, member: String },
    /// Number of members in a sorted set.
    Cardinality { key: String },
    /// Set the key's time-to-live.
    Expire { key: String, ttl: Duration },
}

/// Ordered batch of commands executed as one transaction.
#[derive(Debug, Clone, Default)]
pub struct StorePipeline {
    commands: Vec<StoreCommand>,
}

impl StorePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove_range_by_score(mut self, key: &str, max: i64) -> Self {
        self.commands.push(StoreCommand::RemoveRangeByScore {
            key: key.to_string(),
            max,
        });
        self
    }

    pub fn scored_add(mut self, key: &str, score: i64, member: impl Into<String>) -> Self {
        self.commands.push(StoreCommand::ScoredAdd {
            key: key.to_string(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn cardinality(mut self, key: &str) -> Self {
        self.commands.push(StoreCommand::Cardinality {
            key: key.to_string(),
        });
        self
    }

    pub fn expire(mut self, key: &str, ttl: Duration) -> Self {
        self.commands.push(StoreCommand::Expire {
            key: key.to_string(),
            ttl,
        });
        self
    }

    pub fn commands(&self) -> &[StoreCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// An open connection to the store.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Round-trip with no side effects.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Execute all commands atomically, returning one integer reply per command.
    async fn execute_atomic(&self, pipeline: &StorePipeline) -> Result<Vec<i64>, StoreError>;
}

/// Opens connections to the store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StoreConnection>, StoreError>;

    /// Human-readable target for logs, without credentials.
    fn describe(&self) -> String;
}
