//! Outbound network calls: node-info probes, snapshot pushes and the raw
//! payload sends used by path discovery.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::types::{NetworkSnapshot, Node, NodeInfo, ReportingServer};

const USER_AGENT: &str = concat!("NodeProbe/", env!("CARGO_PKG_VERSION"));

/// Allowance for IP and TCP headers when sizing a path-discovery payload.
pub const HEADER_OVERHEAD: usize = 40;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// `GET /nodeinfo` on the target.
    async fn fetch_node_info(&self, target: &Node) -> Result<NodeInfo>;

    /// `POST /report` to the reporting server.
    async fn push_snapshot(&self, server: &ReportingServer, snapshot: &NetworkSnapshot)
        -> Result<()>;

    /// Opens a raw connection to the target and writes one payload of
    /// `size` bytes on the wire.
    async fn send_payload(&self, target: &Node, size: usize) -> Result<()>;
}

/// Formats `scheme://host:port`, bracketing IPv6 literals.
fn endpoint(scheme: &str, host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("{}://[{}]:{}", scheme, v6, port),
        _ => format!("{}://{}:{}", scheme, host, port),
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    resolver: Option<TokioAsyncResolver>,
    scheme: String,
    port: u16,
}

impl HttpTransport {
    /// Peers serve self-signed certificates, so certificate validation is
    /// off.  `request_timeout` bounds each HTTP exchange end to end.
    pub fn new(scheme: impl Into<String>, port: u16, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;

        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(resolver),
            Err(e) => {
                warn!(
                    "Failed to load system resolv.conf: {}. Path discovery will use peer IPs.",
                    e
                );
                None
            }
        };

        Ok(Self {
            client,
            resolver,
            scheme: scheme.into(),
            port,
        })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("{}/{}", endpoint(&self.scheme, host, self.port), path)
    }

    /// Address for raw sends: literal IPs as-is, names through the
    /// resolver, and the node's recorded IP when resolution fails.
    async fn resolve(&self, target: &Node) -> Result<IpAddr> {
        let host = target.locator();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        if let Some(resolver) = &self.resolver {
            match resolver.lookup_ip(host).await {
                Ok(lookup) => {
                    if let Some(ip) = lookup.iter().next() {
                        return Ok(ip);
                    }
                }
                Err(e) => debug!("Resolver lookup failed for {}: {}", host, e),
            }
        }
        target
            .ip
            .parse::<IpAddr>()
            .map_err(|_| Error::Transport(format!("cannot resolve {}", host)))
    }
}

#[async_trait]
impl ProbeTransport for HttpTransport {
    async fn fetch_node_info(&self, target: &Node) -> Result<NodeInfo> {
        let url = self.url(target.locator(), "nodeinfo");
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "received non-success status code: {}",
                status.as_u16()
            )));
        }
        response
            .json::<NodeInfo>()
            .await
            .map_err(|e| Error::Transport(format!("failed to decode response: {}", e)))
    }

    async fn push_snapshot(
        &self,
        server: &ReportingServer,
        snapshot: &NetworkSnapshot,
    ) -> Result<()> {
        let url = self.url(server.locator(), "report");
        let response = self.client.post(&url).json(snapshot).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            status => Err(Error::Transport(format!(
                "received non-success status code: {}",
                status.as_u16()
            ))),
        }
    }

    async fn send_payload(&self, target: &Node, size: usize) -> Result<()> {
        let addr = SocketAddr::new(self.resolve(target).await?, self.port);

        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(CONNECT_TIMEOUT))?
            .map_err(|e| Error::Transport(format!("connect to {} failed: {}", addr, e)))?;

        let payload = vec![0u8; size.saturating_sub(HEADER_OVERHEAD)];
        timeout(WRITE_TIMEOUT, stream.write_all(&payload))
            .await
            .map_err(|_| Error::Timeout(WRITE_TIMEOUT))?
            .map_err(|e| Error::Transport(format!("write of {} bytes failed: {}", size, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_formatting() {
        assert_eq!(
            endpoint("https", "node1.example.com", 443),
            "https://node1.example.com:443"
        );
        assert_eq!(endpoint("https", "10.0.0.1", 443), "https://10.0.0.1:443");
        assert_eq!(endpoint("http", "::1", 8443), "http://[::1]:8443");
    }

    #[tokio::test]
    async fn test_send_payload_writes_minus_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf.len()
        });

        let transport = HttpTransport::new("http", port, Duration::from_secs(5)).unwrap();
        let target = Node::discovered("p1", "", "127.0.0.1", "seed");
        transport.send_payload(&target, 1500).await.unwrap();
        drop(transport);

        assert_eq!(reader.await.unwrap(), 1500 - HEADER_OVERHEAD);
    }

    #[tokio::test]
    async fn test_send_payload_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new("http", port, Duration::from_secs(5)).unwrap();
        let target = Node::discovered("p1", "unknown", "127.0.0.1", "seed");
        let err = transport.send_payload(&target, 576).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_) | Error::Timeout(_)));
    }
}
