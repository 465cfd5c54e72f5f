//! Reconciling proxy: binds services to pods and manages their tunnel groups
//!
//! Every event handler takes the state lock for its whole duration, so
//! index mutations are strictly serialized. The address table is not covered
//! by this lock; tunnel tasks write it on their own.
//!
//! Invariant: a host has at most one tunnel group. Binding a new pod always
//! retires the previous group first.

use std::collections::{BTreeMap, HashMap};
use std::io;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::address_table::AddressTable;
use crate::dial;
use crate::tunnel::{TunnelContext, TunnelGroup, TunnelState};
use crate::types::{choose_pod, PodKey, ServiceTarget};
use crate::watch::ClusterEventHandler;

#[derive(Default)]
struct ProxyState {
    /// host -> pods bound for that host
    host_pods: HashMap<String, Vec<PodKey>>,
    /// host -> active tunnel group
    host_groups: HashMap<String, TunnelGroup>,
    /// pod -> services (by host) it currently backs
    pod_services: HashMap<PodKey, BTreeMap<String, ServiceTarget>>,
    /// Set by `stop_all`; later events are ignored
    stopped: bool,
}

/// Keeps one tunnel group per proxied service and re-binds on pod loss.
pub struct ReconcilingProxy {
    ctx: TunnelContext,
    state: Mutex<ProxyState>,
}

impl ReconcilingProxy {
    pub fn new(ctx: TunnelContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(ProxyState::default()),
        }
    }

    pub fn table(&self) -> &AddressTable {
        &self.ctx.table
    }

    fn start_proxy_to(&self, state: &mut ProxyState, service: &ServiceTarget) {
        if state.stopped {
            return;
        }
        let host = service.host();
        if service.ports.is_empty() {
            debug!(host = %host, "Service has no ports, nothing to forward");
            return;
        }
        if state.host_groups.contains_key(&host) {
            self.stop_proxy_to(state, service);
        }

        let candidates = self.ctx.pods.select_pods(&service.namespace, &service.selector);
        let Some(pod) = choose_pod(candidates) else {
            info!(host = %host, "No pods match service selector, leaving unproxied");
            return;
        };
        let pod_key = pod.key();

        let group = TunnelGroup::new(&host, &pod, &service.ports, &self.ctx);
        info!(
            host = %host,
            pod = %pod_key,
            ports = service.ports.len(),
            "Bound service to pod"
        );

        state.host_pods.insert(host.clone(), vec![pod_key.clone()]);
        state.host_groups.insert(host.clone(), group);
        state
            .pod_services
            .entry(pod_key)
            .or_default()
            .insert(host, service.clone());
    }

    fn stop_proxy_to(&self, state: &mut ProxyState, service: &ServiceTarget) {
        let host = service.host();

        for pod in state.host_pods.remove(&host).unwrap_or_default() {
            if let Some(services) = state.pod_services.get_mut(&pod) {
                services.remove(&host);
                if services.is_empty() {
                    state.pod_services.remove(&pod);
                }
            }
        }

        if let Some(group) = state.host_groups.remove(&host) {
            group.stop();
        }
    }

    fn re_proxy_to(&self, state: &mut ProxyState, service: &ServiceTarget) {
        self.stop_proxy_to(state, service);
        self.start_proxy_to(state, service);
    }

    /// Stop every tunnel group and ignore further events.
    ///
    /// Returns the retired groups so the caller can wait for them.
    pub fn stop_all(&self) -> Vec<TunnelGroup> {
        let mut state = self.state.lock();
        state.stopped = true;
        state.host_pods.clear();
        state.pod_services.clear();

        let groups: Vec<TunnelGroup> = state.host_groups.drain().map(|(_, g)| g).collect();
        if !groups.is_empty() {
            info!(count = groups.len(), "Stopping all tunnel groups");
        }
        for group in &groups {
            group.stop();
        }
        groups
    }

    /// Pod currently backing `host`, if any.
    pub fn bound_pod(&self, host: &str) -> Option<PodKey> {
        self.state
            .lock()
            .host_groups
            .get(host)
            .map(|group| group.pod().clone())
    }

    /// Tunnel states for `host`, keyed by address table key.
    pub fn tunnel_states(&self, host: &str) -> Vec<(String, TunnelState)> {
        self.state
            .lock()
            .host_groups
            .get(host)
            .map(TunnelGroup::states)
            .unwrap_or_default()
    }

    /// Hosts with an active tunnel group, sorted.
    pub fn proxied_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.state.lock().host_groups.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Connect to `address`, going through a tunnel when one is mapped.
    pub async fn dial(&self, network: &str, address: &str) -> io::Result<TcpStream> {
        dial::dial(&self.ctx.table, network, address).await
    }
}

impl ClusterEventHandler for ReconcilingProxy {
    /// Start proxying a new service. Services without ports are ignored.
    fn on_service_add(&self, service: &ServiceTarget) {
        if service.ports.is_empty() {
            debug!(host = %service.host(), "Service has no ports, ignoring");
            return;
        }
        let mut state = self.state.lock();
        self.start_proxy_to(&mut state, service);
    }

    /// Rebuild a service's tunnels from scratch.
    fn on_service_update(&self, old: &ServiceTarget, new: &ServiceTarget) {
        let mut state = self.state.lock();
        self.stop_proxy_to(&mut state, old);
        self.start_proxy_to(&mut state, new);
    }

    fn on_service_delete(&self, service: &ServiceTarget) {
        let mut state = self.state.lock();
        self.stop_proxy_to(&mut state, service);
    }

    /// Re-bind every service the deleted pod was backing.
    fn on_pod_delete(&self, pod: &PodKey) {
        let mut state = self.state.lock();
        let Some(services) = state.pod_services.get(pod) else {
            return;
        };
        let services: Vec<ServiceTarget> = services.values().cloned().collect();

        for service in services {
            info!(host = %service.host(), pod = %pod, "Bound pod deleted, re-binding service");
            self.re_proxy_to(&mut state, &service);
        }
    }
}
