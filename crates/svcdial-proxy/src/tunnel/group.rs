//! Tunnels for one (service, pod) binding

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TunnelContext, TunnelItem, TunnelState};
use crate::types::{address_key, PodInfo, PodKey, PortMapping};

struct ItemHandle {
    key: String,
    state: watch::Receiver<TunnelState>,
    task: JoinHandle<()>,
}

/// One tunnel item per service port, all sharing one cancellation token.
///
/// Dropping a group cancels it; [`TunnelGroup::join`] waits for the items
/// to finish.
pub struct TunnelGroup {
    host: String,
    pod: PodKey,
    cancel: CancellationToken,
    items: Vec<ItemHandle>,
}

impl TunnelGroup {
    /// Spawn an item for every port of the service, forwarding to `pod`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(host: &str, pod: &PodInfo, ports: &[PortMapping], ctx: &TunnelContext) -> Self {
        let cancel = CancellationToken::new();
        let pod_key = pod.key();

        let items = ports
            .iter()
            .map(|mapping| {
                let key = address_key(host, mapping.port);
                let (item, state) = TunnelItem::new(
                    key.clone(),
                    pod_key.clone(),
                    mapping.target.clone(),
                    ctx.clone(),
                    cancel.clone(),
                );
                debug!(key = %key, pod = %pod_key, target = %mapping.target, "Starting tunnel");
                ItemHandle {
                    key,
                    state,
                    task: tokio::spawn(item.run()),
                }
            })
            .collect();

        Self {
            host: host.to_string(),
            pod: pod_key,
            cancel,
            items,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pod(&self) -> &PodKey {
        &self.pod
    }

    /// Address table keys served by this group, in service port order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.key.as_str())
    }

    /// Current state of every item.
    pub fn states(&self) -> Vec<(String, TunnelState)> {
        self.items
            .iter()
            .map(|item| (item.key.clone(), *item.state.borrow()))
            .collect()
    }

    /// Cancel every item. Calling this again is a no-op.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(host = %self.host, pod = %self.pod, "Stopping tunnel group");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the group and wait for all items to exit.
    pub async fn join(mut self) {
        self.stop();
        for item in std::mem::take(&mut self.items) {
            if let Err(e) = item.task.await {
                warn!(key = %item.key, error = %e, "Tunnel task ended abnormally");
            }
        }
    }
}

impl Drop for TunnelGroup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::address_table::AddressTable;
    use crate::testing::{eventually, running_pod, FakeTransport, StaticPods};
    use crate::types::build_host;

    fn context(transport: Arc<FakeTransport>) -> TunnelContext {
        let pods = Arc::new(StaticPods::new(vec![running_pod("p1", "web")]));
        TunnelContext::new(pods, transport, AddressTable::new())
            .with_retry_backoff(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_one_item_per_port() {
        let transport = Arc::new(FakeTransport::new());
        let ctx = context(transport.clone());
        let host = build_host("web", "default");
        let ports = vec![PortMapping::new(8080, 80), PortMapping::new(8443, 443)];

        let group = TunnelGroup::new(&host, &running_pod("p1", "web"), &ports, &ctx);
        assert_eq!(
            group.keys().collect::<Vec<_>>(),
            vec![
                "web.default.svc.cluster.local:8080",
                "web.default.svc.cluster.local:8443"
            ]
        );

        eventually(|| ctx.table.len() == 2).await;
        assert!(group
            .states()
            .iter()
            .all(|(_, state)| *state == TunnelState::Forwarding));

        group.join().await;
        assert!(ctx.table.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = Arc::new(FakeTransport::new());
        let ctx = context(transport);
        let group = TunnelGroup::new(
            &build_host("web", "default"),
            &running_pod("p1", "web"),
            &[PortMapping::new(8080, 80)],
            &ctx,
        );
        eventually(|| ctx.table.len() == 1).await;

        group.stop();
        group.stop();
        assert!(group.is_stopped());

        group.join().await;
        assert!(ctx.table.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unblocks_in_flight_forward() {
        let transport = Arc::new(FakeTransport::new());
        let ctx = context(transport);
        let group = TunnelGroup::new(
            &build_host("web", "default"),
            &running_pod("p1", "web"),
            &[PortMapping::new(8080, 80)],
            &ctx,
        );
        eventually(|| ctx.table.len() == 1).await;

        // The fake forward only returns on cancellation or an explicit break
        tokio::time::timeout(Duration::from_secs(2), group.join())
            .await
            .expect("group did not stop promptly");
    }

    #[tokio::test]
    async fn test_join_survives_panicking_item() {
        let mut pods = crate::watch::MockPodIndex::new();
        pods.expect_get_pod().returning(|_| panic!("pod index poisoned"));
        let ctx = TunnelContext::new(
            Arc::new(pods),
            Arc::new(FakeTransport::new()),
            AddressTable::new(),
        );
        let group = TunnelGroup::new(
            &build_host("web", "default"),
            &running_pod("p1", "web"),
            &[PortMapping::new(8080, 80)],
            &ctx,
        );

        tokio::time::timeout(Duration::from_secs(2), group.join())
            .await
            .expect("join did not return after item panic");
        assert!(ctx.table.is_empty());
    }

    #[tokio::test]
    async fn test_drop_cancels_items() {
        let transport = Arc::new(FakeTransport::new());
        let ctx = context(transport);
        let group = TunnelGroup::new(
            &build_host("web", "default"),
            &running_pod("p1", "web"),
            &[PortMapping::new(8080, 80)],
            &ctx,
        );
        eventually(|| ctx.table.len() == 1).await;

        drop(group);
        eventually(|| ctx.table.is_empty()).await;
    }
}
