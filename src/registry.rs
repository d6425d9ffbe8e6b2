//! Node registry.
//!
//! The registry is the in-process view of every peer this daemon knows
//! about.  It owns a map from node id to [`Node`] behind a tokio
//! `RwLock` and writes every change through to a [`NodeStore`] before
//! returning.  Lookups and listings take the read side of the lock and
//! may run concurrently; every mutation takes the write side, including
//! the store write, so cache order and store order agree.
//!
//! Accessors return owned copies.  Nothing outside this module ever
//! holds a reference into the live map.
//!
//! If the store write fails the cache has already been updated and the
//! caller gets [`Error::Persistence`]: the local view keeps moving, but
//! the loss of durability is visible.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::store::NodeStore;
use crate::types::{now, Node, SeedEntry, SEED_PROVENANCE};

/// What [`Registry::merge_entry`] did with a reported node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryChange {
    Inserted,
    /// Known node whose fqdn or ip changed.
    Updated,
    /// Known node that only had `last_seen` moved.
    Refreshed,
}

pub struct Registry {
    self_id: String,
    store: Arc<dyn NodeStore>,
    nodes: RwLock<HashMap<String, Node>>,
}

fn sorted(mut nodes: Vec<Node>) -> Vec<Node> {
    nodes.sort_by(|a, b| (a.first_seen, &a.id).cmp(&(b.first_seen, &b.id)));
    nodes
}

impl Registry {
    pub fn new(store: Arc<dyn NodeStore>, self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            store,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Populates the cache from the store.  Must run before anything else.
    pub async fn load(&self) -> Result<usize> {
        let rows = self.store.load_nodes().await?;
        let mut nodes = self.nodes.write().await;
        nodes.clear();
        for node in rows {
            if node.id == self.self_id {
                warn!("Ignoring persisted row for own node id {}", node.id);
                continue;
            }
            nodes.insert(node.id.clone(), node);
        }
        info!("Loaded {} known nodes from store", nodes.len());
        Ok(nodes.len())
    }

    pub async fn get(&self, id: &str) -> Result<Node> {
        self.nodes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Creates or replaces a node.
    ///
    /// A new id gets `first_seen = now`.  An existing id keeps its
    /// `first_seen`, and `last_seen` never moves backwards.  Returns the
    /// row as cached.
    pub async fn upsert(&self, node: Node) -> Result<Node> {
        self.check_id(&node.id)?;

        let mut nodes = self.nodes.write().await;
        let row = match nodes.get(&node.id) {
            Some(existing) => Node {
                first_seen: existing.first_seen,
                last_seen: existing.last_seen.max(node.last_seen),
                ..node
            },
            None => {
                let created = now();
                Node {
                    first_seen: created,
                    last_seen: node.last_seen.max(created),
                    ..node
                }
            }
        };
        let persisted = self.store.save_node(&row).await;
        nodes.insert(row.id.clone(), row.clone());
        persisted.map(|_| row)
    }

    /// Inserts `node` only if its id is unknown.  Returns whether it was
    /// inserted; a known row is left untouched.
    pub async fn insert_if_absent(&self, node: Node) -> Result<bool> {
        self.check_id(&node.id)?;

        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Ok(false);
        }
        let created = now();
        let row = Node {
            first_seen: created,
            last_seen: node.last_seen.max(created),
            ..node
        };
        let persisted = self.store.save_node(&row).await;
        nodes.insert(row.id.clone(), row);
        persisted.map(|_| true)
    }

    /// Applies one peer-reported entry in a single write section.
    ///
    /// Unknown ids are inserted active and credited to `reporter_id`.
    /// Known ids take the reported fqdn and ip and a fresh `last_seen`;
    /// their provenance, `first_seen` and liveness stay as they are.
    pub async fn merge_entry(&self, reported: &Node, reporter_id: &str) -> Result<EntryChange> {
        self.check_id(&reported.id)?;

        let mut nodes = self.nodes.write().await;
        let (row, change) = match nodes.get(&reported.id) {
            Some(existing) => {
                let drifted = existing.fqdn != reported.fqdn || existing.ip != reported.ip;
                let row = Node {
                    fqdn: reported.fqdn.clone(),
                    ip: reported.ip.clone(),
                    last_seen: existing.last_seen.max(now()),
                    ..existing.clone()
                };
                let change = if drifted {
                    EntryChange::Updated
                } else {
                    EntryChange::Refreshed
                };
                (row, change)
            }
            None => (
                Node::discovered(&reported.id, &reported.fqdn, &reported.ip, reporter_id),
                EntryChange::Inserted,
            ),
        };
        let persisted = self.store.save_node(&row).await;
        nodes.insert(row.id.clone(), row);
        persisted.map(|_| change)
    }

    fn check_id(&self, id: &str) -> Result<()> {
        if id == self.self_id {
            return Err(Error::Validation(format!(
                "refusing to register own node id {}",
                id
            )));
        }
        if id.is_empty() {
            return Err(Error::Validation("node id is empty".into()));
        }
        Ok(())
    }

    /// Every known node, oldest `first_seen` first.
    pub async fn all(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        sorted(nodes.values().cloned().collect())
    }

    /// Nodes currently marked active, oldest `first_seen` first.
    pub async fn active(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        sorted(nodes.values().filter(|n| n.is_active).cloned().collect())
    }

    /// Flips liveness and touches `last_seen`.
    pub async fn set_active(&self, id: &str, active: bool) -> Result<Node> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        node.is_active = active;
        node.last_seen = node.last_seen.max(now());
        let row = node.clone();
        self.store.save_node(&row).await?;
        Ok(row)
    }

    /// Loads bootstrap hints.  Known ids are left alone, so repeated loads
    /// of the same list add nothing.  Returns how many entries were new.
    pub async fn seed(&self, entries: &[SeedEntry]) -> usize {
        let mut added = 0;
        for entry in entries {
            let id = entry.node_id();
            if id == self.self_id || self.contains(&id).await {
                continue;
            }
            let node = Node::discovered(id, &entry.fqdn, &entry.ip, SEED_PROVENANCE);
            match self.upsert(node).await {
                Ok(node) => {
                    info!("Added seed node {} ({})", node.id, node.locator());
                    added += 1;
                }
                Err(Error::Persistence(e)) => {
                    warn!("Seed node {} cached but not persisted: {}", entry.locator(), e);
                    added += 1;
                }
                Err(e) => warn!("Failed to add seed node {}: {}", entry.locator(), e),
            }
        }
        added
    }

    /// Administrative removal.  The background protocol never calls this.
    pub async fn delete(&self, id: &str) -> Result<Node> {
        let mut nodes = self.nodes.write().await;
        let removed = nodes
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.store.delete_node(id).await?;
        Ok(removed)
    }
}
