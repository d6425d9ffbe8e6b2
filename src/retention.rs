//! Size-bounded poll history.
//!
//! Outcomes of any age are kept while the history fits the byte budget.
//! Once it does not, the oldest rows go in batches until it fits again
//! (or nothing is left), and the store is compacted afterwards.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::schedule::run_periodic;
use crate::store::PollStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub size_before: u64,
    pub size_after: u64,
    pub rows_deleted: u64,
    pub compacted: bool,
}

pub struct RetentionManager {
    history: Arc<dyn PollStore>,
    budget_bytes: u64,
    batch: u32,
}

impl RetentionManager {
    pub fn new(history: Arc<dyn PollStore>, budget_bytes: u64, batch: u32) -> Self {
        Self {
            history,
            budget_bytes,
            batch: batch.max(1),
        }
    }

    pub async fn enforce(&self) -> Result<RetentionReport> {
        let size_before = self.history.history_size().await?;
        let mut report = RetentionReport {
            size_before,
            size_after: size_before,
            ..Default::default()
        };
        if size_before <= self.budget_bytes {
            debug!(
                "Poll history at {} bytes, budget {}",
                size_before, self.budget_bytes
            );
            return Ok(report);
        }

        info!(
            "Poll history at {} bytes exceeds budget of {}, pruning",
            size_before, self.budget_bytes
        );
        let mut size = size_before;
        while size > self.budget_bytes {
            let deleted = self.history.delete_oldest(self.batch).await?;
            if deleted == 0 {
                break;
            }
            report.rows_deleted += deleted;
            size = self.history.history_size().await?;
        }

        self.history.compact().await?;
        report.compacted = true;
        report.size_after = self.history.history_size().await?;
        info!(
            "Pruned {} poll results, history now {} bytes",
            report.rows_deleted, report.size_after
        );
        Ok(report)
    }

    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        run_periodic("retention service", period, cancel, || {
            let manager = self.clone();
            async move {
                if let Err(e) = manager.enforce().await {
                    warn!("Failed to enforce poll history budget: {}", e);
                }
            }
        })
        .await
    }
}
