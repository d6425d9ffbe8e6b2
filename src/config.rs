use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{ReportingServer, SeedEntry, SeedFile, UNKNOWN_LOCATOR};

const NODE_ID_FILE: &str = "node.id";
const SEED_FILE: &str = "seed.json";
const REPORTING_FILE: &str = "reportingserver.json";
const DATABASE_FILE: &str = "nodeprobe.db";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
    pub peer_port: u16,
    pub peer_scheme: String,
    pub poll_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub report_interval_secs: u64,
    pub retention_interval_secs: u64,
    pub history_budget_bytes: u64,
    pub retention_batch: u32,
    pub shutdown_grace_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_fqdn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,
    pub seeds: Vec<SeedEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporting_server: Option<ReportingServer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/app/data"),
            listen: SocketAddr::from(([0, 0, 0, 0], 443)),
            tls_cert: None,
            tls_key: None,
            peer_port: 443,
            peer_scheme: "https".into(),
            poll_interval_secs: 30,
            probe_timeout_secs: 30,
            report_interval_secs: 300,
            retention_interval_secs: 3600,
            history_budget_bytes: 10 * 1024 * 1024,
            retention_batch: 1000,
            shutdown_grace_secs: 5,
            node_fqdn: None,
            node_ip: None,
            seeds: Vec::new(),
            reporting_server: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("nodeprobe.toml"))
                .merge(Json::file("nodeprobe.json"))
                .merge(Env::prefixed("NODEPROBE_")),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        for (name, secs) in [
            ("poll_interval_secs", config.poll_interval_secs),
            ("probe_timeout_secs", config.probe_timeout_secs),
            ("report_interval_secs", config.report_interval_secs),
            ("retention_interval_secs", config.retention_interval_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            anyhow::bail!("tls_cert and tls_key must be set together");
        }
        if config.probe_timeout_secs > config.poll_interval_secs {
            warn!(
                "probe_timeout_secs ({}) exceeds poll_interval_secs ({}); \
                 slow peers will cost ticks",
                config.probe_timeout_secs, config.poll_interval_secs
            );
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Certificate and key paths when the listener should serve TLS.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// How this daemon describes itself to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: String,
    pub fqdn: String,
    pub ip: String,
}

/// Startup inputs that live outside the node store.
pub trait ConfigSource: Send + Sync {
    fn node_identity(&self) -> Result<NodeIdentity>;
    fn seed_entries(&self) -> Result<Vec<SeedEntry>>;
    fn reporting_server(&self) -> Result<Option<ReportingServer>>;
}

/// Reads `node.id`, `seed.json` and `reportingserver.json` from the data
/// directory, layered with whatever the [`Config`] carries inline.
pub struct FileConfigSource {
    dir: PathBuf,
    inline_seeds: Vec<SeedEntry>,
    inline_server: Option<ReportingServer>,
    fqdn_override: Option<String>,
    ip_override: Option<String>,
}

impl FileConfigSource {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.data_dir.clone(),
            inline_seeds: config.seeds.clone(),
            inline_server: config.reporting_server.clone(),
            fqdn_override: config.node_fqdn.clone(),
            ip_override: config.node_ip.clone(),
        }
    }

    /// Drops `.example` copies of the optional files next to the real ones.
    pub fn write_samples(&self) -> Result<()> {
        let seeds = SeedFile {
            nodes: vec![
                SeedEntry {
                    fqdn: "node1.example.com".into(),
                    ip: "192.168.1.100".into(),
                },
                SeedEntry {
                    fqdn: "node2.example.com".into(),
                    ip: "192.168.1.101".into(),
                },
            ],
        };
        let server = ReportingServer {
            server_fqdn: "reporting.example.com".into(),
            server_ip: "192.168.1.200".into(),
        };
        write_json(&self.dir.join(format!("{}.example", SEED_FILE)), &seeds)?;
        write_json(&self.dir.join(format!("{}.example", REPORTING_FILE)), &server)
    }

    fn load_or_create_id(&self) -> Result<String> {
        let path = self.dir.join(NODE_ID_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(config_error(&path, e)),
        }

        let id = uuid::Uuid::new_v4().to_string();
        fs::write(&path, &id).map_err(|e| config_error(&path, e))?;
        info!("Generated new node id {}", id);
        Ok(id)
    }
}

impl ConfigSource for FileConfigSource {
    fn node_identity(&self) -> Result<NodeIdentity> {
        let id = self.load_or_create_id()?;
        let fqdn = self.fqdn_override.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| UNKNOWN_LOCATOR.to_string())
        });
        let ip = self
            .ip_override
            .clone()
            .or_else(outbound_ip)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Ok(NodeIdentity { id, fqdn, ip })
    }

    fn seed_entries(&self) -> Result<Vec<SeedEntry>> {
        let mut entries = read_json::<SeedFile>(&self.dir.join(SEED_FILE))?
            .map(|file| file.nodes)
            .unwrap_or_default();
        entries.extend(self.inline_seeds.iter().cloned());
        Ok(entries)
    }

    fn reporting_server(&self) -> Result<Option<ReportingServer>> {
        if let Some(server) = &self.inline_server {
            return Ok(Some(server.clone()));
        }
        read_json(&self.dir.join(REPORTING_FILE))
    }
}

/// Local address the kernel would use for outbound traffic.  Connecting
/// a UDP socket sends nothing.
fn outbound_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

fn config_error(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Config(format!("{}: {}", path.display(), err))
}

/// `Ok(None)` when the file does not exist.
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(config_error(path, e)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| config_error(path, e))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|e| config_error(path, e))?;
    fs::write(path, data).map_err(|e| config_error(path, e))
}
