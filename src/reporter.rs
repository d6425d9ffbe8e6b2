//! Periodic push of the full registry to the reporting server.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::schedule::run_periodic;
use crate::transport::ProbeTransport;
use crate::types::{now, NetworkSnapshot, Node, ReportingServer};

pub struct Reporter {
    registry: Arc<Registry>,
    transport: Arc<dyn ProbeTransport>,
    server: Option<ReportingServer>,
    push_timeout: Duration,
}

impl Reporter {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn ProbeTransport>,
        server: Option<ReportingServer>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            server,
            push_timeout,
        }
    }

    fn snapshot(&self, nodes: Vec<Node>) -> NetworkSnapshot {
        NetworkSnapshot {
            timestamp: now(),
            reporting_node_id: self.registry.self_id().to_string(),
            nodes,
        }
    }

    /// Pushes one snapshot.  `Ok(false)` means no server is configured.
    pub async fn send_report(&self) -> Result<bool> {
        let Some(server) = &self.server else {
            return Ok(false);
        };
        let snapshot = self.snapshot(self.registry.all().await);
        let count = snapshot.nodes.len();

        timeout(self.push_timeout, self.transport.push_snapshot(server, &snapshot))
            .await
            .map_err(|_| Error::Timeout(self.push_timeout))??;

        info!("Sent report with {} nodes to {}", count, server.locator());
        Ok(true)
    }

    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        if self.server.is_none() {
            info!("No reporting server configured, reports are disabled");
        }
        run_periodic("reporting service", period, cancel, || {
            let reporter = self.clone();
            async move {
                match reporter.send_report().await {
                    Ok(true) => {}
                    Ok(false) => debug!("Skipping report, no reporting server configured"),
                    Err(e) => warn!("Failed to send report: {}", e),
                }
            }
        })
        .await
    }
}
