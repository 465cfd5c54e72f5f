//! In-memory collaborators for driving the proxy without a cluster

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::{Tunnel, TunnelTarget, TunnelTransport};
use crate::types::{PodInfo, PodKey, PodPhase};
use crate::watch::PodIndex;

/// Running pod in `default` labelled `app=<app>`, with a named port `http` = 8000.
pub fn running_pod(name: &str, app: &str) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        namespace: "default".to_string(),
        phase: PodPhase::Running,
        labels: BTreeMap::from([("app".to_string(), app.to_string())]),
        named_ports: BTreeMap::from([("http".to_string(), 8000)]),
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Mutable pod cache
#[derive(Default)]
pub struct StaticPods {
    pods: Mutex<Vec<PodInfo>>,
}

impl StaticPods {
    pub fn new(pods: Vec<PodInfo>) -> Self {
        Self {
            pods: Mutex::new(pods),
        }
    }

    pub fn upsert(&self, pod: PodInfo) {
        let mut pods = self.pods.lock();
        pods.retain(|p| p.key() != pod.key());
        pods.push(pod);
    }

    pub fn remove(&self, key: &PodKey) {
        self.pods.lock().retain(|p| &p.key() != key);
    }
}

impl PodIndex for StaticPods {
    fn get_pod(&self, key: &PodKey) -> Option<PodInfo> {
        self.pods.lock().iter().find(|p| &p.key() == key).cloned()
    }

    fn select_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<PodInfo> {
        self.pods
            .lock()
            .iter()
            .filter(|p| p.namespace == namespace && p.matches(selector))
            .cloned()
            .collect()
    }
}

/// Transport handing out fake tunnels on increasing local ports
pub struct FakeTransport {
    next_port: AtomicU16,
    failures: AtomicU32,
    ready_failures: AtomicU32,
    next_open_delay: Mutex<Option<Duration>>,
    opened: Mutex<Vec<TunnelTarget>>,
    breaker: Mutex<CancellationToken>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            next_port: AtomicU16::new(40000),
            failures: AtomicU32::new(0),
            ready_failures: AtomicU32::new(0),
            next_open_delay: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
            breaker: Mutex::new(CancellationToken::new()),
        }
    }

    /// Make the next `n` opens fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make the tunnels returned by the next `n` successful opens fail `ready`.
    pub fn fail_next_readies(&self, n: u32) {
        self.ready_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next open take `delay` before returning, ignoring cancellation.
    pub fn delay_next_open(&self, delay: Duration) {
        *self.next_open_delay.lock() = Some(delay);
    }

    /// Every open attempt so far, failed ones included.
    pub fn opened(&self) -> Vec<TunnelTarget> {
        self.opened.lock().clone()
    }

    /// Make every currently forwarding tunnel fail.
    pub fn break_tunnels(&self) {
        let mut breaker = self.breaker.lock();
        breaker.cancel();
        *breaker = CancellationToken::new();
    }
}

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn open(
        &self,
        target: &TunnelTarget,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Tunnel>> {
        self.opened.lock().push(target.clone());

        let delay = self.next_open_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::tunnel_setup(&target.pod.name, target.port, "injected failure"));
        }

        let fail_ready = self
            .ready_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        Ok(Box::new(FakeTunnel {
            target: target.clone(),
            fail_ready,
            local_port: self.next_port.fetch_add(1, Ordering::SeqCst),
            cancel,
            breaker: self.breaker.lock().clone(),
        }))
    }
}

struct FakeTunnel {
    target: TunnelTarget,
    fail_ready: bool,
    local_port: u16,
    cancel: CancellationToken,
    breaker: CancellationToken,
}

#[async_trait]
impl Tunnel for FakeTunnel {
    async fn ready(&mut self) -> Result<u16> {
        if self.fail_ready {
            return Err(Error::tunnel_setup(
                &self.target.pod.name,
                self.target.port,
                "listener not ready",
            ));
        }
        Ok(self.local_port)
    }

    async fn forward(self: Box<Self>) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            _ = self.breaker.cancelled() => Err(Error::tunnel_forward(
                &self.target.pod.name,
                self.target.port,
                "connection lost",
            )),
        }
    }
}
