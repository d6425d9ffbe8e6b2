//! Gossip merge.
//!
//! Folds a peer-reported node list into the local [`Registry`].  Unknown
//! nodes are inserted with the reporter credited as their provenance;
//! known nodes keep their provenance and `first_seen`, take the reported
//! locators if those drifted, and have `last_seen` refreshed because the
//! reporter vouches for them.
//!
//! A merge is a best-effort batch.  A failure on one entry is logged and
//! the rest of the list is still applied.  Applying the same report twice
//! leaves the registry as after the first application, except for
//! `last_seen`.  Conflicting locators from different reporters resolve
//! to whichever report was merged last.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::Error;
use crate::registry::{EntryChange, Registry};
use crate::types::{Node, NodeInfo};

/// Per-merge counters, mostly for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Nodes this registry had never seen.
    pub inserted: usize,
    /// Known nodes whose fqdn or ip changed.
    pub updated: usize,
    /// Known nodes that only had `last_seen` refreshed.
    pub refreshed: usize,
    /// Entries ignored (own id, empty id).
    pub skipped: usize,
    pub failed: usize,
}

pub struct MergeEngine {
    registry: Arc<Registry>,
}

impl MergeEngine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Merges `info`, received from `source_id`, into the registry.
    ///
    /// `source_id` is the peer that handed us the list (or `"report"` for
    /// a pushed snapshot); `info.id` is the node that produced it.  The
    /// reporter itself is credited to `source_id`, its list entries to
    /// `info.id`.  A node never credits itself: when the list came straight
    /// from its producer, only the entries are merged.
    pub async fn merge(&self, info: &NodeInfo, source_id: &str) -> MergeReport {
        let self_id = self.registry.self_id();
        let mut report = MergeReport::default();

        if !info.id.is_empty() && info.id != self_id && info.id != source_id {
            let reporter = Node::discovered(&info.id, &info.fqdn, &info.ip, source_id);
            match self.registry.insert_if_absent(reporter).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => {}
                Err(e) => record_failure(&info.id, e, &mut report),
            }
        }

        for reported in &info.nodes {
            if reported.id.is_empty() || reported.id == self_id {
                report.skipped += 1;
                continue;
            }

            match self.registry.merge_entry(reported, &info.id).await {
                Ok(EntryChange::Inserted) => {
                    info!(
                        "Discovered new node {} ({}) via {}",
                        reported.id,
                        reported.locator(),
                        info.id
                    );
                    report.inserted += 1;
                }
                Ok(EntryChange::Updated) => {
                    debug!(
                        "Node {} moved to {} / {}",
                        reported.id, reported.fqdn, reported.ip
                    );
                    report.updated += 1;
                }
                Ok(EntryChange::Refreshed) => report.refreshed += 1,
                Err(e) => record_failure(&reported.id, e, &mut report),
            }
        }

        debug!("Merged report from {} via {}: {:?}", info.id, source_id, report);
        report
    }

}

/// A persistence failure still counts as failed even though the cache moved.
fn record_failure(id: &str, err: Error, report: &mut MergeReport) {
    match err {
        Error::Persistence(e) => warn!("Node {} merged in memory only: {}", id, e),
        e => warn!("Failed to merge node {}: {}", id, e),
    }
    report.failed += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::{now, NetworkSnapshot, REPORT_SOURCE};

    fn engine() -> (Arc<MemoryStore>, Arc<Registry>, MergeEngine) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new(store.clone(), "self-node"));
        let engine = MergeEngine::new(registry.clone());
        (store, registry, engine)
    }

    fn peer(id: &str, fqdn: &str, ip: &str) -> Node {
        Node::discovered(id, fqdn, ip, "elsewhere")
    }

    fn info(id: &str, nodes: Vec<Node>) -> NodeInfo {
        NodeInfo {
            id: id.into(),
            fqdn: format!("{}.example.com", id),
            ip: "10.0.0.1".into(),
            nodes,
        }
    }

    /// Registry state with `last_seen` masked out.
    async fn state(registry: &Registry) -> Vec<(String, String, String, String, bool)> {
        registry
            .all()
            .await
            .into_iter()
            .map(|n| (n.id, n.fqdn, n.ip, n.discovered_by, n.is_active))
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_nodes_credit_reporter() {
        let (_store, registry, engine) = engine();
        registry
            .upsert(peer("p1", "p1.example.com", "10.0.0.1"))
            .await
            .unwrap();

        let report = engine
            .merge(&info("p1", vec![peer("q1", "q.example.com", "10.0.0.7")]), "p1")
            .await;
        assert_eq!(report.inserted, 1);

        let q1 = registry.get("q1").await.unwrap();
        assert_eq!(q1.discovered_by, "p1");
        assert!(q1.is_active);
        assert_eq!(q1.first_seen, q1.last_seen);
    }

    #[tokio::test]
    async fn test_unknown_reporter_credited_to_source() {
        let (_store, registry, engine) = engine();
        let report = engine
            .merge(&info("r1", vec![peer("q1", "", "10.0.0.7")]), "p9")
            .await;
        assert_eq!(report.inserted, 2);

        let r1 = registry.get("r1").await.unwrap();
        assert_eq!(r1.discovered_by, "p9");
        assert_eq!(r1.fqdn, "r1.example.com");
        assert!(r1.is_active);
        assert_eq!(registry.get("q1").await.unwrap().discovered_by, "r1");
    }

    #[tokio::test]
    async fn test_known_reporter_is_left_alone() {
        let (_store, registry, engine) = engine();
        let mut known = peer("r1", "old.example.com", "10.0.0.2");
        known.discovered_by = "seed".into();
        known.is_active = false;
        registry.upsert(known).await.unwrap();

        engine.merge(&info("r1", vec![]), "p9").await;

        let r1 = registry.get("r1").await.unwrap();
        assert_eq!(r1.discovered_by, "seed");
        assert_eq!(r1.fqdn, "old.example.com");
        assert!(!r1.is_active);
    }

    #[tokio::test]
    async fn test_self_never_enters_registry() {
        let (_store, registry, engine) = engine();
        let report = engine
            .merge(
                &info(
                    "p1",
                    vec![
                        peer("self-node", "me.example.com", "10.0.0.5"),
                        peer("q1", "", "10.0.0.7"),
                    ],
                ),
                "p1",
            )
            .await;
        assert_eq!(report.skipped, 1);

        // A snapshot that claims to come from us is ignored as a reporter too.
        engine
            .merge(&info("self-node", vec![peer("self-node", "", "")]), "report")
            .await;

        assert!(!registry.contains("self-node").await);
        assert!(registry.contains("q1").await);
    }

    #[tokio::test]
    async fn test_drifted_locators_overwrite_but_keep_provenance() {
        let (_store, registry, engine) = engine();
        let original = registry
            .upsert(Node::discovered("q1", "q.example.com", "10.0.0.7", "seed"))
            .await
            .unwrap();

        let report = engine
            .merge(&info("p1", vec![peer("q1", "q.example.com", "10.0.0.8")]), "p1")
            .await;
        assert_eq!(report.updated, 1);

        let q1 = registry.get("q1").await.unwrap();
        assert_eq!(q1.ip, "10.0.0.8");
        assert_eq!(q1.discovered_by, "seed");
        assert_eq!(q1.first_seen, original.first_seen);
        assert!(q1.last_seen >= original.last_seen);
    }

    #[tokio::test]
    async fn test_inactive_node_stays_inactive_on_refresh() {
        let (_store, registry, engine) = engine();
        registry
            .upsert(Node::discovered("q1", "", "10.0.0.7", "seed"))
            .await
            .unwrap();
        registry.set_active("q1", false).await.unwrap();

        let report = engine
            .merge(&info("p1", vec![peer("q1", "", "10.0.0.7")]), "p1")
            .await;
        assert_eq!(report.refreshed, 1);
        assert!(!registry.get("q1").await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent_modulo_last_seen() {
        let (_store, registry, engine) = engine();
        let snapshot = NetworkSnapshot {
            timestamp: now(),
            reporting_node_id: "r1".into(),
            nodes: vec![
                peer("q1", "q1.example.com", "10.0.0.7"),
                peer("q2", "unknown", "10.0.0.8"),
            ],
        };

        engine
            .merge(&NodeInfo::from(snapshot.clone()), REPORT_SOURCE)
            .await;
        let once = state(&registry).await;
        let first_seen: Vec<_> = registry.all().await.iter().map(|n| n.first_seen).collect();

        let second = engine
            .merge(&NodeInfo::from(snapshot), REPORT_SOURCE)
            .await;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.refreshed, 2);

        assert_eq!(state(&registry).await, once);
        let again: Vec<_> = registry.all().await.iter().map(|n| n.first_seen).collect();
        assert_eq!(again, first_seen);
    }

    #[tokio::test]
    async fn test_reordered_reports_converge() {
        let a = info("r1", vec![peer("q1", "", "10.0.0.7")]);
        let b = info("r2", vec![peer("q1", "", "10.0.0.7"), peer("q2", "", "10.0.0.9")]);

        let (_s1, reg1, eng1) = engine();
        eng1.merge(&a, "r1").await;
        eng1.merge(&b, "r2").await;

        let (_s2, reg2, eng2) = engine();
        eng2.merge(&b, "r2").await;
        eng2.merge(&a, "r1").await;

        let ids = |nodes: Vec<Node>| {
            let mut ids: Vec<String> = nodes.into_iter().map(|n| n.id).collect();
            ids.sort();
            ids
        };
        assert_eq!(ids(reg1.all().await), ids(reg2.all().await));
        for id in ["q1", "q2"] {
            let n1 = reg1.get(id).await.unwrap();
            let n2 = reg2.get(id).await.unwrap();
            assert_eq!((n1.fqdn, n1.ip), (n2.fqdn, n2.ip));
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_abort_batch() {
        let (store, registry, engine) = engine();
        store.fail_writes(true);

        let report = engine
            .merge(
                &info(
                    "p1",
                    vec![peer("q1", "", "10.0.0.7"), peer("q2", "", "10.0.0.8")],
                ),
                "p1",
            )
            .await;
        assert_eq!(report.failed, 2);
        assert!(registry.contains("q1").await);
        assert!(registry.contains("q2").await);
    }

    #[tokio::test]
    async fn test_liveness_flip_survives_concurrent_refresh() {
        let (store, registry, engine) = engine();
        registry
            .upsert(peer("q1", "q.example.com", "10.0.0.7"))
            .await
            .unwrap();
        store.slow_writes(std::time::Duration::from_millis(20));

        let report = info("r1", vec![peer("q1", "q.example.com", "10.0.0.7")]);
        let (merged, flipped) = tokio::join!(
            engine.merge(&report, REPORT_SOURCE),
            registry.set_active("q1", false)
        );
        assert_eq!(merged.refreshed, 1);
        assert!(!flipped.unwrap().is_active);
        assert!(!registry.get("q1").await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_concurrent_first_sightings_keep_one_provenance() {
        let (store, registry, engine) = engine();
        store.slow_writes(std::time::Duration::from_millis(20));

        let from_r1 = info("r1", vec![peer("q1", "", "10.0.0.7")]);
        let from_r2 = info("r2", vec![peer("q1", "", "10.0.0.7")]);
        let (a, b) = tokio::join!(
            engine.merge(&from_r1, REPORT_SOURCE),
            engine.merge(&from_r2, REPORT_SOURCE)
        );

        // r1, r2 and q1, each inserted exactly once.
        assert_eq!(a.inserted + b.inserted, 3);
        assert_eq!(a.refreshed + b.refreshed, 1);
        let winner = if a.inserted == 2 { "r1" } else { "r2" };
        assert_eq!(registry.get("q1").await.unwrap().discovered_by, winner);
    }

    #[tokio::test]
    async fn test_reporter_is_not_credited_to_itself() {
        let (_store, registry, engine) = engine();
        let report = engine
            .merge(&info("p1", vec![peer("q1", "", "10.0.0.7")]), "p1")
            .await;

        assert_eq!(report.inserted, 1);
        assert!(!registry.contains("p1").await);
        assert_eq!(registry.get("q1").await.unwrap().discovered_by, "p1");
    }
}
