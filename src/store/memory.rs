//! In-memory store used by unit tests.  Writes can be made to fail on
//! demand to exercise degraded-durability paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{NodeStore, PollStore};
use crate::error::{Error, Result};
use crate::types::{Node, PollOutcome};

#[derive(Default)]
pub struct MemoryStore {
    nodes: Mutex<HashMap<String, Node>>,
    outcomes: Mutex<Vec<(i64, PollOutcome)>>,
    next_id: Mutex<i64>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every node write take `delay`, widening race windows.
    pub fn slow_writes(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(Error::Persistence("injected write failure".into()))
        } else {
            Ok(())
        }
    }

    pub async fn stored_node(&self, id: &str) -> Option<Node> {
        self.nodes.lock().await.get(id).cloned()
    }

    pub async fn outcomes(&self) -> Vec<PollOutcome> {
        self.outcomes
            .lock()
            .await
            .iter()
            .map(|(_, o)| o.clone())
            .collect()
    }
}

fn outcome_size(outcome: &PollOutcome) -> u64 {
    serde_json::to_vec(outcome).map(|v| v.len() as u64).unwrap_or(0)
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn load_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.lock().await.values().cloned().collect();
        nodes.sort_by(|a, b| (a.first_seen, &a.id).cmp(&(b.first_seen, &b.id)));
        Ok(nodes)
    }

    async fn save_node(&self, node: &Node) -> Result<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_writable()?;
        let mut nodes = self.nodes.lock().await;
        let mut row = node.clone();
        if let Some(existing) = nodes.get(&node.id) {
            row.first_seen = existing.first_seen;
        }
        nodes.insert(row.id.clone(), row);
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        Ok(self.nodes.lock().await.remove(id).is_some())
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn append_outcome(&self, outcome: &PollOutcome) -> Result<i64> {
        self.check_writable()?;
        let mut next_id = self.next_id.lock().await;
        *next_id += 1;
        self.outcomes.lock().await.push((*next_id, outcome.clone()));
        Ok(*next_id)
    }

    async fn outcomes_since(&self, since: DateTime<Utc>) -> Result<Vec<PollOutcome>> {
        let mut recent: Vec<(i64, PollOutcome)> = self
            .outcomes
            .lock()
            .await
            .iter()
            .filter(|(_, o)| o.poll_time >= since)
            .cloned()
            .collect();
        recent.sort_by(|a, b| (b.1.poll_time, b.0).cmp(&(a.1.poll_time, a.0)));
        Ok(recent.into_iter().map(|(_, o)| o).collect())
    }

    async fn history_size(&self) -> Result<u64> {
        Ok(self
            .outcomes
            .lock()
            .await
            .iter()
            .map(|(_, o)| outcome_size(o))
            .sum())
    }

    async fn delete_oldest(&self, batch: u32) -> Result<u64> {
        self.check_writable()?;
        let mut outcomes = self.outcomes.lock().await;
        outcomes.sort_by(|a, b| (a.1.poll_time, a.0).cmp(&(b.1.poll_time, b.0)));
        let n = outcomes.len().min(batch as usize);
        outcomes.drain(..n);
        Ok(n as u64)
    }

    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}
