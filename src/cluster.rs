//! Cluster membership and peer routing.
//!
//! Every node periodically writes its own (ip, port, timestamp) into a
//! shared hash in the cache, refreshed only after a successful
//! self-health-check.  Discovery reads the hash and lazily evicts
//! entries older than the staleness window.  Ownership of a uid is
//! resolved by fanning a probe out to all live peers and taking the
//! first positive answer; exactly one peer is expected to own a uid's
//! staging directory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::Cache;

/// Cache hash holding one field per live node, keyed by ip.
const REGISTRY_KEY: &str = "service:gateway";

/// Delay before retrying a failed self-health-check.
const HEALTH_RETRY: Duration = Duration::from_secs(3);

/// One live node as announced in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub ip: String,
    pub port: u16,
    /// Last successful heartbeat, ISO-8601.
    pub created_at: String,
}

impl PeerRecord {
    /// `host:port` form of this peer's address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Registers this node and resolves uid ownership across the cluster.
pub struct ClusterRegistry {
    cache: Arc<dyn Cache>,
    client: reqwest::Client,
    scheme: String,
    self_ip: String,
    self_port: u16,
    heartbeat_interval: Duration,
    stale_seconds: i64,
}

impl ClusterRegistry {
    pub fn new(
        cache: Arc<dyn Cache>,
        scheme: impl Into<String>,
        self_ip: impl Into<String>,
        self_port: u16,
        heartbeat_interval: Duration,
        stale_seconds: i64,
    ) -> Self {
        Self {
            cache,
            client: reqwest::Client::new(),
            scheme: scheme.into(),
            self_ip: self_ip.into(),
            self_port,
            heartbeat_interval,
            stale_seconds,
        }
    }

    /// This node's advertised `host:port`.
    pub fn self_addr(&self) -> String {
        format!("{}:{}", self.self_ip, self.self_port)
    }

    /// Whether `addr` names this node.
    pub fn is_self(&self, addr: &str) -> bool {
        addr == self.self_addr()
    }

    /// Full URL for `path_and_query` on the peer at `addr`.
    pub fn peer_url(&self, addr: &str, path_and_query: &str) -> String {
        format!("{}{}", self.base_url(addr), path_and_query)
    }

    fn base_url(&self, addr: &str) -> String {
        format!("{}://{}", self.scheme, addr)
    }

    /// Write this node's registry entry with a fresh timestamp.
    pub async fn register(&self) -> anyhow::Result<()> {
        let record = PeerRecord {
            ip: self.self_ip.clone(),
            port: self.self_port,
            created_at: Utc::now().to_rfc3339(),
        };
        let value = serde_json::to_string(&record)?;
        self.cache.hset(REGISTRY_KEY, &self.self_ip, &value).await
    }

    /// Heartbeat loop: announce only after this node answers its own
    /// health check, and keep retrying the check on failure rather than
    /// silently dropping out of the registry.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delay = if self.self_health_check().await {
                if let Err(e) = self.register().await {
                    warn!(error = %e, "registry announce failed");
                }
                self.heartbeat_interval
            } else {
                warn!("self health check failed, retrying");
                HEALTH_RETRY
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("heartbeat stopping");
                    return;
                }
            }
        }
    }

    async fn self_health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url(&self.self_addr()));
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// All live peers, lazily evicting stale registry entries.
    pub async fn discover(&self) -> anyhow::Result<Vec<PeerRecord>> {
        let entries = self.cache.hget_all(REGISTRY_KEY).await?;
        let now = Utc::now();
        let mut peers = Vec::new();
        for (field, value) in entries {
            let record: PeerRecord = match serde_json::from_str(&value) {
                Ok(r) => r,
                Err(e) => {
                    // Undecodable entries are treated like stale ones.
                    warn!(field = %field, error = %e, "evicting corrupt registry entry");
                    self.cache.hdel(REGISTRY_KEY, &field).await?;
                    continue;
                }
            };
            let age = DateTime::parse_from_rfc3339(&record.created_at)
                .map(|ts| (now - ts.with_timezone(&Utc)).num_seconds())
                .unwrap_or(i64::MAX);
            if age > self.stale_seconds {
                debug!(peer = %record.addr(), age, "evicting stale registry entry");
                self.cache.hdel(REGISTRY_KEY, &field).await?;
                continue;
            }
            peers.push(record);
        }
        Ok(peers)
    }

    /// Find the peer that owns `uid`'s staging directory, excluding this
    /// node.  Probes all live peers concurrently and takes the first
    /// positive answer.
    pub async fn locate_owner(&self, uid: i64) -> anyhow::Result<Option<PeerRecord>> {
        let peers = self.discover().await?;
        let mut probes = JoinSet::new();
        for peer in peers {
            if peer.ip == self.self_ip && peer.port == self.self_port {
                continue;
            }
            let client = self.client.clone();
            let url = format!("{}/proxy?uid={}", self.base_url(&peer.addr()), uid);
            probes.spawn(async move {
                let owns = probe_ownership(&client, &url).await;
                (peer, owns)
            });
        }

        while let Some(result) = probes.join_next().await {
            if let Ok((peer, true)) = result {
                probes.abort_all();
                return Ok(Some(peer));
            }
        }
        Ok(None)
    }
}

/// Body of the ownership probe response.
#[derive(Deserialize)]
struct ProbeBody {
    data: Option<bool>,
}

async fn probe_ownership(client: &reqwest::Client, url: &str) -> bool {
    let resp = match client
        .get(url)
        .timeout(Duration::from_secs(2))
        .send()
        .await
    {
        Ok(r) if r.status().is_success() => r,
        _ => return false,
    };
    matches!(
        resp.json::<ProbeBody>().await,
        Ok(ProbeBody { data: Some(true) })
    )
}

/// Best-effort outbound IP of this host, learned by opening a UDP
/// socket toward a public address (no packets are sent).
pub fn outbound_ip() -> anyhow::Result<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;

    fn registry(cache: Arc<dyn Cache>, ip: &str) -> ClusterRegistry {
        ClusterRegistry::new(cache, "http", ip, 8888, Duration::from_secs(180), 300)
    }

    #[tokio::test]
    async fn test_register_and_discover() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        registry(cache.clone(), "10.0.0.1").register().await.unwrap();
        registry(cache.clone(), "10.0.0.2").register().await.unwrap();

        let peers = registry(cache, "10.0.0.1").discover().await.unwrap();
        assert_eq!(peers.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_entries_evicted() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let stale = PeerRecord {
            ip: "10.0.0.9".to_string(),
            port: 8888,
            created_at: (Utc::now() - chrono::Duration::seconds(600)).to_rfc3339(),
        };
        cache
            .hset(
                REGISTRY_KEY,
                &stale.ip,
                &serde_json::to_string(&stale).unwrap(),
            )
            .await
            .unwrap();
        registry(cache.clone(), "10.0.0.1").register().await.unwrap();

        let peers = registry(cache.clone(), "10.0.0.1").discover().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip, "10.0.0.1");
        // Eviction is persistent, not just filtered from the result.
        let entries = cache.hget_all(REGISTRY_KEY).await.unwrap();
        assert!(!entries.contains_key("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_corrupt_entries_evicted() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        cache
            .hset(REGISTRY_KEY, "10.0.0.8", "not json")
            .await
            .unwrap();
        let peers = registry(cache.clone(), "10.0.0.1").discover().await.unwrap();
        assert!(peers.is_empty());
        assert!(cache.hget_all(REGISTRY_KEY).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locate_owner_skips_self_and_handles_no_peers() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let reg = registry(cache, "10.0.0.1");
        reg.register().await.unwrap();
        // Only this node is registered, so nobody else can own the uid.
        let owner = reg.locate_owner(42).await.unwrap();
        assert!(owner.is_none());
    }
}
