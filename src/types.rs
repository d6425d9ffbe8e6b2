//! Data structures shared by every subsystem of the probe daemon.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and
//! exchanged with peers over HTTPS.  `Node` rows are what each daemon
//! knows about the network; a `NodeInfo` is what a daemon says about
//! itself when probed, and a `NetworkSnapshot` is what it pushes to a
//! reporting server.  Timestamps are RFC 3339 on the wire.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Provenance recorded for nodes loaded from the bootstrap seed list.
pub const SEED_PROVENANCE: &str = "seed";

/// Source id used when merging a snapshot pushed to `POST /report`.
pub const REPORT_SOURCE: &str = "report";

/// Placeholder some peers use for a locator they could not determine.
pub const UNKNOWN_LOCATOR: &str = "unknown";

/// Current time, truncated to millisecond precision so that values
/// survive a round trip through the store unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Picks the address used to reach a peer: the FQDN unless it is empty
/// or `"unknown"`, then the IP.
pub fn locator<'a>(fqdn: &'a str, ip: &'a str) -> &'a str {
    if fqdn.is_empty() || fqdn == UNKNOWN_LOCATOR {
        ip
    } else {
        fqdn
    }
}

/// Peers with an empty registry send `"nodes": null`.
fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A peer known to this daemon.
///
/// `id` is self-asserted by the owning node.  `first_seen` is fixed when
/// the row is created; `last_seen` only moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub ip: String,
    /// Id of the peer that introduced this node, or `"seed"`.
    #[serde(default)]
    pub discovered_by: String,
    #[serde(default = "now")]
    pub first_seen: DateTime<Utc>,
    #[serde(default = "now")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub is_active: bool,
}

impl Node {
    /// A freshly discovered, active node.
    pub fn discovered(
        id: impl Into<String>,
        fqdn: impl Into<String>,
        ip: impl Into<String>,
        discovered_by: impl Into<String>,
    ) -> Self {
        let seen = now();
        Self {
            id: id.into(),
            fqdn: fqdn.into(),
            ip: ip.into(),
            discovered_by: discovered_by.into(),
            first_seen: seen,
            last_seen: seen,
            is_active: true,
        }
    }

    pub fn locator(&self) -> &str {
        locator(&self.fqdn, &self.ip)
    }
}

/// Result of a single probe.  Append-only once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOutcome {
    pub node_id: String,
    pub poll_time: DateTime<Utc>,
    pub success: bool,
    #[serde(rename = "response_ms")]
    pub response_latency_ms: u64,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_mtu: Option<u32>,
}

/// The self-description served on `GET /nodeinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub nodes: Vec<Node>,
}

impl From<NetworkSnapshot> for NodeInfo {
    /// A pushed snapshot carries no locators for its reporter.
    fn from(snapshot: NetworkSnapshot) -> Self {
        Self {
            id: snapshot.reporting_node_id,
            fqdn: String::new(),
            ip: String::new(),
            nodes: snapshot.nodes,
        }
    }
}

/// Full view of one daemon's registry, pushed to a reporting server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "node_id")]
    pub reporting_node_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub nodes: Vec<Node>,
}

impl NetworkSnapshot {
    /// Rejects snapshots that would put anonymous rows into a registry.
    pub fn validate(&self) -> Result<()> {
        if self.reporting_node_id.trim().is_empty() {
            return Err(Error::Validation("snapshot has no node_id".into()));
        }
        if let Some(pos) = self.nodes.iter().position(|n| n.id.trim().is_empty()) {
            return Err(Error::Validation(format!(
                "snapshot entry {} has an empty id",
                pos
            )));
        }
        Ok(())
    }
}

/// Bootstrap hint from the seed list.  Seeds have no id of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedEntry {
    #[serde(default)]
    pub fqdn: String,
    #[serde(default)]
    pub ip: String,
}

impl SeedEntry {
    /// Deterministic id so that loading the same seed twice is a no-op.
    pub fn node_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.fqdn.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.ip.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("seed-{}", &digest[..16])
    }

    pub fn locator(&self) -> &str {
        locator(&self.fqdn, &self.ip)
    }
}

/// On-disk shape of `seed.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub nodes: Vec<SeedEntry>,
}

/// Locator of the server that receives periodic snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingServer {
    #[serde(default)]
    pub server_fqdn: String,
    #[serde(default)]
    pub server_ip: String,
}

impl ReportingServer {
    pub fn locator(&self) -> &str {
        locator(&self.server_fqdn, &self.server_ip)
    }
}
