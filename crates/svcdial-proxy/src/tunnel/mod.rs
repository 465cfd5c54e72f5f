//! Tunnel lifecycle: per-port retry loops and the groups that own them
//!
//! A [`TunnelGroup`] is created for one (service, pod) binding and spawns one
//! [`TunnelItem`] per service port. All items of a group share a single
//! cancellation token; stopping the group is the only way an item exits.

mod group;
mod item;

pub use group::TunnelGroup;
pub use item::{TunnelItem, TunnelState};

use std::sync::Arc;
use std::time::Duration;

use crate::address_table::AddressTable;
use crate::transport::TunnelTransport;
use crate::watch::PodIndex;

/// Fixed delay between tunnel attempts
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Collaborators shared by every group and item of one proxy
#[derive(Clone)]
pub struct TunnelContext {
    /// Fresh pod lookups before each attempt
    pub pods: Arc<dyn PodIndex>,
    pub transport: Arc<dyn TunnelTransport>,
    /// Where ready tunnels publish their local address
    pub table: AddressTable,
    pub retry_backoff: Duration,
}

impl TunnelContext {
    pub fn new(
        pods: Arc<dyn PodIndex>,
        transport: Arc<dyn TunnelTransport>,
        table: AddressTable,
    ) -> Self {
        Self {
            pods,
            transport,
            table,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }
}
