//! SQLite-backed node and poll-history store.
//!
//! ## Data model
//! - `nodes` holds one row per registry entry, keyed by node id.
//! - `poll_results` is append-only; `id` grows with insertion order.
//! - Timestamps are stored as integer milliseconds since the Unix epoch.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, SqlitePool};

use super::{NodeStore, PollStore};
use crate::error::{Error, Result};
use crate::types::{Node, PollOutcome};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        fqdn TEXT NOT NULL,
        ip TEXT NOT NULL,
        discovered_by TEXT NOT NULL,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS poll_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        poll_time INTEGER NOT NULL,
        success INTEGER NOT NULL,
        response_ms INTEGER NOT NULL,
        error TEXT,
        path_mtu INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_nodes_is_active ON nodes(is_active)",
    "CREATE INDEX IF NOT EXISTS idx_poll_results_node_id ON poll_results(node_id)",
    "CREATE INDEX IF NOT EXISTS idx_poll_results_poll_time ON poll_results(poll_time)",
];

const SQL_SAVE_NODE: &str = "INSERT INTO nodes \
    (id, fqdn, ip, discovered_by, first_seen, last_seen, is_active) \
    VALUES (?, ?, ?, ?, ?, ?, ?) \
    ON CONFLICT(id) DO UPDATE SET \
        fqdn = excluded.fqdn, \
        ip = excluded.ip, \
        discovered_by = excluded.discovered_by, \
        last_seen = excluded.last_seen, \
        is_active = excluded.is_active";

const SQL_INSERT_OUTCOME: &str = "INSERT INTO poll_results \
    (node_id, poll_time, success, response_ms, error, path_mtu) \
    VALUES (?, ?, ?, ?, ?, ?)";

// Pages in use, not file length: deletions show up before VACUUM runs.
const SQL_USED_BYTES: &str = "SELECT (p.page_count - f.freelist_count) * s.page_size \
    FROM pragma_page_count() AS p, pragma_freelist_count() AS f, pragma_page_size() AS s";

const SQL_DELETE_OLDEST: &str = "DELETE FROM poll_results WHERE id IN ( \
    SELECT id FROM poll_results ORDER BY poll_time ASC, id ASC LIMIT ?)";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Creates or opens the database at `path` and makes sure the schema
    /// exists.  Safe to call on every start.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .log_statements(log::LevelFilter::Trace);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.initialize().await?;
        info!("Opened node store at {}", path.display());
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready ({} statements)", SCHEMA.len());
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Persistence(format!("timestamp {} out of range", ms)))
}

fn node_from_row(row: &SqliteRow) -> Result<Node> {
    Ok(Node {
        id: row.try_get("id")?,
        fqdn: row.try_get("fqdn")?,
        ip: row.try_get("ip")?,
        discovered_by: row.try_get("discovered_by")?,
        first_seen: from_millis(row.try_get("first_seen")?)?,
        last_seen: from_millis(row.try_get("last_seen")?)?,
        is_active: row.try_get("is_active")?,
    })
}

fn outcome_from_row(row: &SqliteRow) -> Result<PollOutcome> {
    let response_ms: i64 = row.try_get("response_ms")?;
    let path_mtu: Option<i64> = row.try_get("path_mtu")?;
    Ok(PollOutcome {
        node_id: row.try_get("node_id")?,
        poll_time: from_millis(row.try_get("poll_time")?)?,
        success: row.try_get("success")?,
        response_latency_ms: u64::try_from(response_ms).unwrap_or(0),
        error_text: row.try_get("error")?,
        path_mtu: path_mtu.and_then(|v| u32::try_from(v).ok()),
    })
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn load_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT id, fqdn, ip, discovered_by, first_seen, last_seen, is_active \
             FROM nodes ORDER BY first_seen ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn save_node(&self, node: &Node) -> Result<()> {
        sqlx::query(SQL_SAVE_NODE)
            .bind(&node.id)
            .bind(&node.fqdn)
            .bind(&node.ip)
            .bind(&node.discovered_by)
            .bind(node.first_seen.timestamp_millis())
            .bind(node.last_seen.timestamp_millis())
            .bind(node.is_active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PollStore for SqliteStore {
    async fn append_outcome(&self, outcome: &PollOutcome) -> Result<i64> {
        let result = sqlx::query(SQL_INSERT_OUTCOME)
            .bind(&outcome.node_id)
            .bind(outcome.poll_time.timestamp_millis())
            .bind(outcome.success)
            .bind(i64::try_from(outcome.response_latency_ms).unwrap_or(i64::MAX))
            .bind(outcome.error_text.as_deref())
            .bind(outcome.path_mtu.map(i64::from))
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn outcomes_since(&self, since: DateTime<Utc>) -> Result<Vec<PollOutcome>> {
        let rows = sqlx::query(
            "SELECT node_id, poll_time, success, response_ms, error, path_mtu \
             FROM poll_results WHERE poll_time >= ? ORDER BY poll_time DESC, id DESC",
        )
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outcome_from_row).collect()
    }

    async fn history_size(&self) -> Result<u64> {
        let used: i64 = sqlx::query_scalar(SQL_USED_BYTES)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(used).unwrap_or(0))
    }

    async fn delete_oldest(&self, batch: u32) -> Result<u64> {
        let result = sqlx::query(SQL_DELETE_OLDEST)
            .bind(i64::from(batch))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn compact(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}
