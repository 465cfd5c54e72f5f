//! Cluster-backed proxy: wires the watchers, caches and port-forward
//! transport to a [`ReconcilingProxy`]

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use kube::Client;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::address_table::AddressTable;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::proxy::ReconcilingProxy;
use crate::transport::KubePortForwarder;
use crate::tunnel::TunnelContext;
use crate::watch::{cluster_caches, spawn_watchers, ClusterCaches};

/// Keeps every service in the watched namespaces reachable by its
/// cluster DNS name through [`ServiceProxy::dial`].
pub struct ServiceProxy {
    inner: Arc<ReconcilingProxy>,
    caches: ClusterCaches,
    cancel: CancellationToken,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceProxy {
    /// Build a client from `config` and start watching the cluster.
    ///
    /// Kubeconfig and client errors are returned; nothing after this point
    /// fails the proxy.
    pub async fn connect(config: ProxyConfig) -> Result<Self> {
        let client = config.client().await?;
        Ok(Self::with_client(client, &config))
    }

    /// Start watching the cluster with an existing client.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_client(client: Client, config: &ProxyConfig) -> Self {
        let (caches, writers) = cluster_caches();
        let ctx = TunnelContext::new(
            Arc::new(caches.clone()),
            Arc::new(KubePortForwarder::new(client.clone())),
            AddressTable::new(),
        )
        .with_retry_backoff(config.retry_backoff);
        let inner = Arc::new(ReconcilingProxy::new(ctx));

        let cancel = CancellationToken::new();
        let watchers = spawn_watchers(
            client,
            config.namespace.as_deref(),
            writers,
            caches.clone(),
            inner.clone(),
            cancel.clone(),
        );
        info!(
            namespace = config.namespace.as_deref().unwrap_or("<all>"),
            "Service proxy watching cluster"
        );

        Self {
            inner,
            caches,
            cancel,
            watchers: Mutex::new(watchers),
        }
    }

    /// Wait for the initial pod and service lists to be cached.
    pub async fn start(&self) -> Result<()> {
        self.caches.wait_until_synced().await?;
        info!(services = self.caches.service_count(), "Cluster caches synced");
        Ok(())
    }

    /// Connect to `address` (`<service>.<namespace>.svc.cluster.local:<port>`
    /// or any other address, dialed as given when unmapped).
    pub async fn dial(&self, network: &str, address: &str) -> io::Result<TcpStream> {
        self.inner.dial(network, address).await
    }

    pub fn table(&self) -> &AddressTable {
        self.inner.table()
    }

    /// Current address mappings, sorted by key.
    pub fn addresses(&self) -> BTreeMap<String, String> {
        self.inner.table().snapshot()
    }

    pub fn proxy(&self) -> &ReconcilingProxy {
        &self.inner
    }

    /// Stop the watchers and every tunnel group without waiting.
    pub fn stop(&self) {
        self.cancel.cancel();
        drop(self.inner.stop_all());
    }

    /// Stop everything and wait for the tunnel and watch tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for group in self.inner.stop_all() {
            group.join().await;
        }

        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in watchers {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Watch task ended abnormally");
            }
        }
        info!("Service proxy stopped");
    }
}

impl Drop for ServiceProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
