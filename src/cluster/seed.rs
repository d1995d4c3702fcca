// Seed-node directory.
//
// A provider supplies the bootstrap set of candidate peer addresses. The
// manager wraps the configured provider so callers never see nulls or raw
// provider failures, and runs a periodic sweep that pings known addresses
// and unregisters unreachable ones that are not in the currently known
// alive set.

use crate::config::NetworkConfig;
use crate::error::{ClusterError, Result};
use crate::network::ping::{ping, PingResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Contract for seed-node discovery backends.
#[async_trait]
pub trait SeedNodeProvider: Send + Sync {
    /// Candidate peer addresses for the named cluster.
    async fn seed_nodes(&self, cluster: &str) -> Result<Vec<SocketAddr>>;

    async fn start_discovery(&self, _cluster: &str, _local: SocketAddr) -> Result<()> {
        Ok(())
    }

    async fn suspend_discovery(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_discovery(&self, _cluster: &str, _local: SocketAddr) -> Result<()> {
        Ok(())
    }

    async fn register_remote(&self, _cluster: &str, _addr: SocketAddr) -> Result<()> {
        Ok(())
    }

    async fn unregister_remote(&self, _cluster: &str, _addr: SocketAddr) -> Result<()> {
        Ok(())
    }

    /// Interval of the manager's liveness sweep.
    fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Fixed-list provider backed by the configured seed addresses.
pub struct StaticSeedNodeProvider {
    addresses: Vec<SocketAddr>,
}

impl StaticSeedNodeProvider {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    /// Parses "host:port" entries; bad entries are configuration errors.
    pub fn parse(entries: &[String]) -> Result<Self> {
        use std::net::ToSocketAddrs;
        let mut addresses = Vec::new();
        for entry in entries {
            let mut resolved = entry.as_str().to_socket_addrs().map_err(|e| {
                ClusterError::Configuration(format!("invalid seed address '{}': {}", entry, e))
            })?;
            match resolved.next() {
                Some(addr) => addresses.push(addr),
                None => {
                    return Err(ClusterError::Configuration(format!(
                        "unresolvable seed address: {}",
                        entry
                    )))
                }
            }
        }
        Ok(Self { addresses })
    }
}

#[async_trait]
impl SeedNodeProvider for StaticSeedNodeProvider {
    async fn seed_nodes(&self, _cluster: &str) -> Result<Vec<SocketAddr>> {
        Ok(self.addresses.clone())
    }
}

/// Shared-directory provider: every node registers itself as a marker file
/// named `<host>_<port>` under `<dir>/<cluster>/`.
pub struct FilesystemSeedNodeProvider {
    dir: PathBuf,
    cleanup_interval: Duration,
}

impl FilesystemSeedNodeProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cleanup_interval: Duration::from_secs(60),
        }
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.dir.join(cluster)
    }

    fn file_name(addr: SocketAddr) -> String {
        format!("{}_{}", addr.ip(), addr.port())
    }

    fn parse_file_name(name: &str) -> Option<SocketAddr> {
        let (host, port) = name.rsplit_once('_')?;
        let ip: std::net::IpAddr = host.parse().ok()?;
        let port: u16 = port.parse().ok()?;
        Some(SocketAddr::new(ip, port))
    }
}

#[async_trait]
impl SeedNodeProvider for FilesystemSeedNodeProvider {
    async fn seed_nodes(&self, cluster: &str) -> Result<Vec<SocketAddr>> {
        let dir = self.cluster_dir(cluster);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ClusterError::Io(e)),
        };

        let mut nodes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                match Self::parse_file_name(name) {
                    Some(addr) => nodes.push(addr),
                    None => tracing::warn!(file = name, "ignoring malformed seed entry"),
                }
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    async fn start_discovery(&self, cluster: &str, local: SocketAddr) -> Result<()> {
        self.register_remote(cluster, local).await
    }

    async fn stop_discovery(&self, cluster: &str, local: SocketAddr) -> Result<()> {
        self.unregister_remote(cluster, local).await
    }

    async fn register_remote(&self, cluster: &str, addr: SocketAddr) -> Result<()> {
        let dir = self.cluster_dir(cluster);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(Self::file_name(addr)), b"").await?;
        Ok(())
    }

    async fn unregister_remote(&self, cluster: &str, addr: SocketAddr) -> Result<()> {
        let path = self.cluster_dir(cluster).join(Self::file_name(addr));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClusterError::Io(e)),
        }
    }

    fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }
}

/// Wraps the configured provider with error conversion and the liveness
/// sweep.
pub struct SeedNodeManager {
    cluster: String,
    provider: Arc<dyn SeedNodeProvider>,
    network: NetworkConfig,
    alive: Arc<RwLock<HashSet<SocketAddr>>>,
    stop_tx: watch::Sender<bool>,
}

impl SeedNodeManager {
    pub fn new(
        cluster: impl Into<String>,
        provider: Arc<dyn SeedNodeProvider>,
        network: NetworkConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            cluster: cluster.into(),
            provider,
            network,
            alive: Arc::new(RwLock::new(HashSet::new())),
            stop_tx,
        }
    }

    /// Provider result with failures converted and nulls flattened to an
    /// empty list.
    pub async fn seed_nodes(&self) -> Result<Vec<SocketAddr>> {
        self.provider
            .seed_nodes(&self.cluster)
            .await
            .map_err(|e| match e {
                ClusterError::Configuration(_) => e,
                other => {
                    ClusterError::Configuration(format!("seed node provider failed: {}", other))
                }
            })
    }

    /// Addresses the membership layer currently believes alive; the sweep
    /// never unregisters these.
    pub fn update_alive(&self, alive: HashSet<SocketAddr>) {
        *self.alive.write() = alive;
    }

    /// Starts discovery and the periodic cleanup sweep. Restartable after
    /// `stop` (rejoin path).
    pub async fn start(&self, local: SocketAddr) -> Result<()> {
        self.stop_tx.send_replace(false);
        self.provider.start_discovery(&self.cluster, local).await?;

        let provider = self.provider.clone();
        let cluster = self.cluster.clone();
        let network = self.network.clone();
        let alive = self.alive.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = self.provider.cleanup_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *stop_rx.borrow() {
                    break;
                }

                let seeds = match provider.seed_nodes(&cluster).await {
                    Ok(seeds) => seeds,
                    Err(e) => {
                        tracing::warn!(error = %e, "seed cleanup: provider failed");
                        continue;
                    }
                };

                for addr in seeds {
                    if addr == local || alive.read().contains(&addr) {
                        continue;
                    }
                    if ping(addr, &network).await != PingResult::Success {
                        tracing::info!(%addr, "seed cleanup: unregistering unreachable address");
                        if let Err(e) = provider.unregister_remote(&cluster, addr).await {
                            tracing::warn!(%addr, error = %e, "seed cleanup: unregister failed");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Stops the sweep and the provider's discovery.
    pub async fn stop(&self, local: SocketAddr) -> Result<()> {
        self.stop_tx.send_replace(true);
        self.provider.stop_discovery(&self.cluster, local).await
    }

    pub fn provider(&self) -> Arc<dyn SeedNodeProvider> {
        self.provider.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ping::PingHandler;
    use crate::network::transport::{Connector, NetworkTransport};
    use crate::network::PING_PROTOCOL;

    fn test_network() -> NetworkConfig {
        NetworkConfig {
            connect_timeout: Duration::from_millis(300),
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_static_provider_parse() {
        let provider =
            StaticSeedNodeProvider::parse(&["127.0.0.1:7001".to_string(), "127.0.0.1:7002".into()])
                .unwrap();
        let seeds = provider.seed_nodes("c").await.unwrap();
        assert_eq!(seeds.len(), 2);

        assert!(StaticSeedNodeProvider::parse(&["not an address".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_filesystem_provider_register_scan_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemSeedNodeProvider::new(dir.path());

        let a: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:7002".parse().unwrap();

        provider.register_remote("c", a).await.unwrap();
        provider.register_remote("c", b).await.unwrap();

        let mut seeds = provider.seed_nodes("c").await.unwrap();
        seeds.sort();
        assert_eq!(seeds, vec![a, b]);

        provider.unregister_remote("c", a).await.unwrap();
        assert_eq!(provider.seed_nodes("c").await.unwrap(), vec![b]);

        // Unregistering a missing entry is fine.
        provider.unregister_remote("c", a).await.unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_provider_empty_when_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemSeedNodeProvider::new(dir.path().join("missing"));
        assert!(provider.seed_nodes("c").await.unwrap().is_empty());
    }

    struct FailingProvider;

    #[async_trait]
    impl SeedNodeProvider for FailingProvider {
        async fn seed_nodes(&self, _cluster: &str) -> Result<Vec<SocketAddr>> {
            Err(ClusterError::Internal("backend down".into()))
        }
    }

    #[tokio::test]
    async fn test_manager_converts_provider_errors() {
        let manager = SeedNodeManager::new("c", Arc::new(FailingProvider), test_network());
        let err = manager.seed_nodes().await.unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_cleanup_unregisters_dead_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            FilesystemSeedNodeProvider::new(dir.path())
                .with_cleanup_interval(Duration::from_millis(100)),
        );

        // One live peer that answers pings, one dead address.
        let transport = NetworkTransport::new(test_network());
        transport
            .register(Connector::new(PING_PROTOCOL, Arc::new(PingHandler)))
            .unwrap();
        let live = transport.bind().await.unwrap();

        let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = dead_listener.local_addr().unwrap();
        drop(dead_listener);

        provider.register_remote("c", live).await.unwrap();
        provider.register_remote("c", dead).await.unwrap();

        let local: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let manager = SeedNodeManager::new("c", provider.clone(), test_network());
        manager.start(local).await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let seeds = provider.seed_nodes("c").await.unwrap();
                if !seeds.contains(&dead) && seeds.contains(&live) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("dead seed was not unregistered");

        manager.stop(local).await.unwrap();
        transport.shutdown();
    }
}
