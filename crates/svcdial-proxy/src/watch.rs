//! Cluster watch: cached pods and services plus change notifications
//!
//! Two kube-rs reflectors keep local caches of pods and services. Their event
//! streams are folded by a [`ChangeTracker`] into informer-style
//! add/update/delete notifications, delivered to a [`ClusterEventHandler`]
//! after the corresponding cache has been updated.
//!
//! Service notifications are held back until the pod cache has synced, so the
//! initial service adds can already see their backend pods.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{PodInfo, PodKey, ServiceTarget};

/// Point lookups and selector queries over cached pods.
#[cfg_attr(test, mockall::automock)]
pub trait PodIndex: Send + Sync {
    /// Current cached state of one pod.
    fn get_pod(&self, key: &PodKey) -> Option<PodInfo>;

    /// All cached pods in `namespace` whose labels match `selector`.
    fn select_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<PodInfo>;
}

/// Receives cluster change notifications.
#[cfg_attr(test, mockall::automock)]
pub trait ClusterEventHandler: Send + Sync {
    fn on_service_add(&self, service: &ServiceTarget);
    fn on_service_update(&self, old: &ServiceTarget, new: &ServiceTarget);
    fn on_service_delete(&self, service: &ServiceTarget);
    fn on_pod_delete(&self, pod: &PodKey);
}

/// An informer-style change derived from watcher events
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

/// Objects whose changes can be tracked across watch restarts
pub trait Tracked: Clone {
    /// Stable identity of the object
    fn identity(&self) -> String;
    /// Version used to drop no-op updates after a re-list
    fn version(&self) -> Option<&str>;
}

impl Tracked for ServiceTarget {
    fn identity(&self) -> String {
        self.host()
    }

    fn version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }
}

impl Tracked for PodInfo {
    fn identity(&self) -> String {
        self.key().to_string()
    }

    fn version(&self) -> Option<&str> {
        None
    }
}

/// Turns watcher events into add/update/delete changes.
///
/// Remembers the last seen version of every object. A (re-)list is buffered
/// from `Init` to `InitDone` and then diffed against what was known, so
/// objects that vanished while the watch was down are reported as deleted.
pub struct ChangeTracker<T> {
    known: BTreeMap<String, T>,
    relist: Option<BTreeMap<String, T>>,
}

impl<T> Default for ChangeTracker<T> {
    fn default() -> Self {
        Self {
            known: BTreeMap::new(),
            relist: None,
        }
    }
}

impl<T: Tracked> ChangeTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one watcher event into zero or more changes.
    pub fn handle(&mut self, event: Event<T>) -> Vec<Change<T>> {
        match event {
            Event::Init => {
                self.relist = Some(BTreeMap::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                self.relist
                    .get_or_insert_with(BTreeMap::new)
                    .insert(obj.identity(), obj);
                Vec::new()
            }
            Event::InitDone => {
                let listed = self.relist.take().unwrap_or_default();
                let mut changes = Vec::new();

                for (id, old) in &self.known {
                    match listed.get(id) {
                        None => changes.push(Change::Deleted(old.clone())),
                        Some(new) if !same_version(old, new) => changes.push(Change::Updated {
                            old: old.clone(),
                            new: new.clone(),
                        }),
                        Some(_) => {}
                    }
                }
                for (id, obj) in &listed {
                    if !self.known.contains_key(id) {
                        changes.push(Change::Added(obj.clone()));
                    }
                }

                self.known = listed;
                changes
            }
            Event::Apply(obj) => match self.known.insert(obj.identity(), obj.clone()) {
                None => vec![Change::Added(obj)],
                Some(old) if same_version(&old, &obj) => Vec::new(),
                Some(old) => vec![Change::Updated { old, new: obj }],
            },
            Event::Delete(obj) => {
                self.known.remove(&obj.identity());
                vec![Change::Deleted(obj)]
            }
        }
    }
}

fn same_version<T: Tracked>(old: &T, new: &T) -> bool {
    matches!((old.version(), new.version()), (Some(a), Some(b)) if a == b)
}

/// Reflector-backed caches for pods and services
#[derive(Clone)]
pub struct ClusterCaches {
    pods: Store<Pod>,
    services: Store<Service>,
}

/// Writer halves of [`ClusterCaches`], consumed by [`spawn_watchers`]
pub struct CacheWriters {
    pods: reflector::store::Writer<Pod>,
    services: reflector::store::Writer<Service>,
}

/// Create empty caches and the writers that fill them.
pub fn cluster_caches() -> (ClusterCaches, CacheWriters) {
    let (pods, pod_writer) = reflector::store();
    let (services, service_writer) = reflector::store();
    (
        ClusterCaches { pods, services },
        CacheWriters {
            pods: pod_writer,
            services: service_writer,
        },
    )
}

impl ClusterCaches {
    /// Block until the initial list of both pods and services is cached.
    pub async fn wait_until_synced(&self) -> Result<()> {
        self.pods
            .wait_until_ready()
            .await
            .map_err(|_| Error::CacheSync { resource: "pod" })?;
        self.services
            .wait_until_ready()
            .await
            .map_err(|_| Error::CacheSync {
                resource: "service",
            })?;
        Ok(())
    }

    /// Number of cached services.
    pub fn service_count(&self) -> usize {
        self.services.state().len()
    }
}

impl PodIndex for ClusterCaches {
    fn get_pod(&self, key: &PodKey) -> Option<PodInfo> {
        let obj_ref = ObjectRef::<Pod>::new(&key.name).within(&key.namespace);
        self.pods.get(&obj_ref).map(|pod| PodInfo::from(pod.as_ref()))
    }

    fn select_pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<PodInfo> {
        self.pods
            .state()
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .map(|pod| PodInfo::from(pod.as_ref()))
            .filter(|pod| pod.matches(selector))
            .collect()
    }
}

/// Spawn the pod and service watch tasks.
///
/// `namespace` limits both watches; `None` watches all namespaces. The tasks
/// exit when `cancel` fires.
pub fn spawn_watchers(
    client: Client,
    namespace: Option<&str>,
    writers: CacheWriters,
    caches: ClusterCaches,
    handler: Arc<dyn ClusterEventHandler>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let (pod_api, service_api): (Api<Pod>, Api<Service>) = match namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    let pods = tokio::spawn(watch_pods(
        pod_api,
        writers.pods,
        handler.clone(),
        cancel.clone(),
    ));
    let services = tokio::spawn(watch_services(
        service_api,
        writers.services,
        caches.pods,
        handler,
        cancel,
    ));
    vec![pods, services]
}

async fn watch_pods(
    api: Api<Pod>,
    writer: reflector::store::Writer<Pod>,
    handler: Arc<dyn ClusterEventHandler>,
    cancel: CancellationToken,
) {
    let stream = reflector::reflector(
        writer,
        watcher::watcher(api, watcher::Config::default()).default_backoff(),
    );
    let mut stream = std::pin::pin!(stream);
    let mut tracker = ChangeTracker::<PodInfo>::new();

    info!("Pod watcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for change in tracker.handle(map_event(event, |pod| PodInfo::from(pod))) {
                        if let Change::Deleted(pod) = change {
                            debug!(pod = %pod.key(), "Pod deleted");
                            handler.on_pod_delete(&pod.key());
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Pod watcher error, will retry"),
                None => break,
            }
        }
    }
    info!("Pod watcher stopped");
}

async fn watch_services(
    api: Api<Service>,
    writer: reflector::store::Writer<Service>,
    pods: Store<Pod>,
    handler: Arc<dyn ClusterEventHandler>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        ready = pods.wait_until_ready() => {
            if ready.is_err() {
                warn!("Pod cache dropped before sync, not watching services");
                return;
            }
        }
    }

    let stream = reflector::reflector(
        writer,
        watcher::watcher(api, watcher::Config::default()).default_backoff(),
    );
    let mut stream = std::pin::pin!(stream);
    let mut tracker = ChangeTracker::<ServiceTarget>::new();

    info!("Service watcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    for change in tracker.handle(map_event(event, |svc| ServiceTarget::from(svc))) {
                        dispatch_service_change(handler.as_ref(), change);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Service watcher error, will retry"),
                None => break,
            }
        }
    }
    info!("Service watcher stopped");
}

fn dispatch_service_change(handler: &dyn ClusterEventHandler, change: Change<ServiceTarget>) {
    match change {
        Change::Added(service) => {
            debug!(host = %service.host(), "Service added");
            handler.on_service_add(&service);
        }
        Change::Updated { old, new } => {
            debug!(host = %new.host(), "Service updated");
            handler.on_service_update(&old, &new);
        }
        Change::Deleted(service) => {
            debug!(host = %service.host(), "Service deleted");
            handler.on_service_delete(&service);
        }
    }
}

fn map_event<K, T>(event: Event<K>, f: impl Fn(&K) -> T) -> Event<T> {
    match event {
        Event::Apply(obj) => Event::Apply(f(&obj)),
        Event::Delete(obj) => Event::Delete(f(&obj)),
        Event::Init => Event::Init,
        Event::InitApply(obj) => Event::InitApply(f(&obj)),
        Event::InitDone => Event::InitDone,
    }
}
