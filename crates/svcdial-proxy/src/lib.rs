//! Dial Kubernetes services by cluster DNS name from outside the cluster
//!
//! Each watched service is bound to one ready pod chosen by its selector.
//! For every service port a tunnel task keeps a local port-forward open to
//! that pod and publishes `<name>.<namespace>.svc.cluster.local:<port>` ->
//! `:<local port>` in an [`AddressTable`]. [`ServiceProxy::dial`] consults
//! the table before connecting, so callers use service addresses as if they
//! were inside the cluster.
//!
//! When the bound pod goes away the service is re-bound to another matching
//! pod and its tunnels are rebuilt.

pub mod address_table;
pub mod config;
pub mod dial;
pub mod error;
pub mod proxy;
pub mod service_proxy;
pub mod transport;
pub mod tunnel;
pub mod types;
pub mod watch;

#[cfg(test)]
mod testing;

pub use address_table::AddressTable;
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use proxy::ReconcilingProxy;
pub use service_proxy::ServiceProxy;
pub use tunnel::TunnelState;
pub use types::{build_host, PodKey, ServiceTarget};
