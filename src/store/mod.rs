use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Node, PollOutcome};

#[cfg(test)]
pub mod memory;
pub mod sqlite;
pub use sqlite::SqliteStore;

/// Durable backing for the node registry.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// All rows, oldest `first_seen` first.
    async fn load_nodes(&self) -> Result<Vec<Node>>;

    /// Inserts the row, or updates every column except `first_seen` if
    /// the id already exists.
    async fn save_node(&self, node: &Node) -> Result<()>;

    /// Returns whether a row was removed.
    async fn delete_node(&self, id: &str) -> Result<bool>;
}

/// Append-only probe history with size-bounded pruning.
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn append_outcome(&self, outcome: &PollOutcome) -> Result<i64>;

    /// Outcomes recorded at or after `since`, newest first.
    async fn outcomes_since(&self, since: DateTime<Utc>) -> Result<Vec<PollOutcome>>;

    /// Bytes of storage currently attributed to history.
    async fn history_size(&self) -> Result<u64>;

    /// Deletes up to `batch` of the oldest outcomes; returns rows removed.
    async fn delete_oldest(&self, batch: u32) -> Result<u64>;

    /// Hands space freed by deletions back to the filesystem.
    async fn compact(&self) -> Result<()>;
}
