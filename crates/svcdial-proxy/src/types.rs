//! Domain model for services, pods and host keys
//!
//! The proxy works on these trimmed-down views instead of the full
//! `k8s_openapi` objects so reconciliation can be driven without a cluster.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::error::{Error, Result};

/// Suffix appended to `<name>.<namespace>` to form a service host key.
pub const CLUSTER_DOMAIN_SUFFIX: &str = "svc.cluster.local";

/// Build the host key for a service: `<name>.<namespace>.svc.cluster.local`.
pub fn build_host(name: &str, namespace: &str) -> String {
    format!("{}.{}.{}", name, namespace, CLUSTER_DOMAIN_SUFFIX)
}

/// Build the address table key for one exposed port of a host.
pub fn address_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// Target side of a service port mapping
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetPort {
    /// A numeric container port
    Number(u16),
    /// A container port referenced by its declared name
    Named(String),
}

impl TargetPort {
    /// Resolve to a concrete container port on the given pod.
    pub fn resolve(&self, pod: &PodInfo) -> Result<u16> {
        match self {
            TargetPort::Number(port) => Ok(*port),
            TargetPort::Named(name) => {
                pod.named_ports
                    .get(name)
                    .copied()
                    .ok_or_else(|| Error::UnknownPortName {
                        pod: pod.name.clone(),
                        port: name.clone(),
                    })
            }
        }
    }
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPort::Number(port) => write!(f, "{}", port),
            TargetPort::Named(name) => f.write_str(name),
        }
    }
}

/// One (exposed port, target container port) pair of a service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    /// Port the service exposes; part of the address table key
    pub port: u16,
    /// Container port the tunnel forwards to
    pub target: TargetPort,
}

impl PortMapping {
    /// Mapping with a numeric target port
    pub fn new(port: u16, target_port: u16) -> Self {
        Self {
            port,
            target: TargetPort::Number(target_port),
        }
    }
}

/// The parts of a Service the proxy reconciles on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceTarget {
    pub name: String,
    pub namespace: String,
    /// Label selector choosing the backend pods
    pub selector: BTreeMap<String, String>,
    /// Ordered port list as declared on the service
    pub ports: Vec<PortMapping>,
    pub resource_version: Option<String>,
}

impl ServiceTarget {
    /// Host key identifying this service
    pub fn host(&self) -> String {
        build_host(&self.name, &self.namespace)
    }
}

impl From<&Service> for ServiceTarget {
    fn from(service: &Service) -> Self {
        let spec = service.spec.as_ref();
        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|p| {
                        let port = u16::try_from(p.port).ok()?;
                        let target = match &p.target_port {
                            Some(IntOrString::Int(n)) => TargetPort::Number(u16::try_from(*n).ok()?),
                            Some(IntOrString::String(s)) => match s.parse::<u16>() {
                                Ok(n) => TargetPort::Number(n),
                                Err(_) => TargetPort::Named(s.clone()),
                            },
                            None => TargetPort::Number(port),
                        };
                        Some(PortMapping { port, target })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: service.metadata.name.clone().unwrap_or_default(),
            namespace: service
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            selector: spec.and_then(|s| s.selector.clone()).unwrap_or_default(),
            ports,
            resource_version: service.metadata.resource_version.clone(),
        }
    }
}

/// Pod lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the `status.phase` string; anything unrecognized is `Unknown`.
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Namespace-qualified pod identity
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The parts of a Pod needed to bind and forward to it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    pub labels: BTreeMap<String, String>,
    /// Container ports declared with a name, for resolving named target ports
    pub named_ports: BTreeMap<String, u16>,
}

impl PodInfo {
    pub fn key(&self) -> PodKey {
        PodKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }

    /// Equality-based selector match. An empty selector selects nothing.
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        !selector.is_empty()
            && selector
                .iter()
                .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

impl From<&Pod> for PodInfo {
    fn from(pod: &Pod) -> Self {
        let named_ports = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .flat_map(|c| c.ports.iter().flatten())
            .filter_map(|p| Some((p.name.clone()?, u16::try_from(p.container_port).ok()?)))
            .collect();

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            phase: PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref())),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            named_ports,
        }
    }
}

/// Pick the pod a service binds to: Running pods first, then lowest name.
pub fn choose_pod(mut candidates: Vec<PodInfo>) -> Option<PodInfo> {
    candidates.sort_by(|a, b| {
        b.is_running()
            .cmp(&a.is_running())
            .then_with(|| a.name.cmp(&b.name))
    });
    candidates.into_iter().next()
}
