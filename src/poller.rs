//! Polling scheduler.
//!
//! Each tick probes one active peer, walking the active list round-robin
//! so every peer is visited once per cycle.  The first probe of a peer
//! also runs path discovery.  A successful probe marks the peer active
//! and merges the peer list it returned; anything else (timeout,
//! transport error, bad status) marks it inactive.  Every probe appends
//! one [`PollOutcome`] to history.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::merge::MergeEngine;
use crate::path_mtu;
use crate::registry::Registry;
use crate::schedule::run_periodic;
use crate::store::PollStore;
use crate::transport::ProbeTransport;
use crate::types::{now, Node, PollOutcome};

pub struct Poller {
    registry: Arc<Registry>,
    merger: Arc<MergeEngine>,
    transport: Arc<dyn ProbeTransport>,
    history: Arc<dyn PollStore>,
    probe_timeout: Duration,
    cursor: Mutex<usize>,
    /// Peers that already had path discovery.
    path_probed: Mutex<HashSet<String>>,
}

impl Poller {
    pub fn new(
        registry: Arc<Registry>,
        merger: Arc<MergeEngine>,
        transport: Arc<dyn ProbeTransport>,
        history: Arc<dyn PollStore>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            merger,
            transport,
            history,
            probe_timeout,
            cursor: Mutex::new(0),
            path_probed: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        run_periodic("polling service", period, cancel, || {
            let poller = self.clone();
            async move {
                poller.tick().await;
            }
        })
        .await
    }

    /// Probes the next peer in rotation.  Returns `None` when there is no
    /// active peer other than ourselves.
    pub async fn tick(&self) -> Option<PollOutcome> {
        let self_id = self.registry.self_id();
        let peers: Vec<Node> = self
            .registry
            .active()
            .await
            .into_iter()
            .filter(|n| n.id != self_id)
            .collect();
        if peers.is_empty() {
            debug!("No active peers to poll");
            return None;
        }

        let target = {
            let mut cursor = self.cursor.lock().await;
            let index = *cursor % peers.len();
            *cursor = index + 1;
            peers[index].clone()
        };

        let outcome = self.poll_node(&target).await;
        if let Err(e) = self.history.append_outcome(&outcome).await {
            warn!("Failed to store poll result for node {}: {}", target.id, e);
        }
        Some(outcome)
    }

    /// Probes one node and applies the result to the registry.  Never
    /// fails: problems end up in the returned outcome.
    pub async fn poll_node(&self, target: &Node) -> PollOutcome {
        let poll_time = now();
        let path_mtu = self.discover_path_once(target).await;

        let started = Instant::now();
        let result = timeout(self.probe_timeout, self.transport.fetch_node_info(target))
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(self.probe_timeout)));
        let response_latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let error_text = match result {
            Ok(info) => {
                info!(
                    "Poll successful for node {} ({}): {}ms",
                    target.id,
                    target.locator(),
                    response_latency_ms
                );
                if let Err(e) = self.registry.set_active(&target.id, true).await {
                    warn!("Failed to update node status for {}: {}", target.id, e);
                }
                let report = self.merger.merge(&info, &target.id).await;
                if report.inserted > 0 {
                    info!(
                        "Learned {} new node(s) from {}",
                        report.inserted, target.id
                    );
                }
                None
            }
            Err(e) => {
                warn!(
                    "Poll failed for node {} ({}): {} (response time: {}ms)",
                    target.id,
                    target.locator(),
                    e,
                    response_latency_ms
                );
                if let Err(e) = self.registry.set_active(&target.id, false).await {
                    warn!("Failed to update node status for {}: {}", target.id, e);
                }
                Some(e.to_string())
            }
        };

        PollOutcome {
            node_id: target.id.clone(),
            poll_time,
            success: error_text.is_none(),
            response_latency_ms,
            error_text,
            path_mtu: path_mtu.and_then(|size| u32::try_from(size).ok()),
        }
    }

    /// Runs path discovery the first time a peer is probed; later calls
    /// for the same peer return `None` without touching the network.
    async fn discover_path_once(&self, target: &Node) -> Option<usize> {
        if !self.path_probed.lock().await.insert(target.id.clone()) {
            return None;
        }

        let found = timeout(
            self.probe_timeout,
            path_mtu::discover(self.transport.as_ref(), target),
        )
        .await
        .ok()
        .flatten();

        match found {
            Some(size) => info!("Path MTU to node {} ({}): {}", target.id, target.locator(), size),
            None => warn!("Failed to determine path MTU to node {}", target.id),
        }
        found
    }
}
