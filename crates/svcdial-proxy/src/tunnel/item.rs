//! Retry loop for a single service port

use std::fmt;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::TunnelContext;
use crate::address_table::AddressTable;
use crate::error::{Error, Result};
use crate::transport::TunnelTarget;
use crate::types::{PodKey, TargetPort};

/// Lifecycle state of a tunnel item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    /// Checking the pod and setting up a tunnel, or backing off after a failure
    Connecting,
    /// Address published; the forward call is running
    Forwarding,
    /// Group cancelled; the loop has exited
    Stopped,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Connecting => f.write_str("Connecting"),
            TunnelState::Forwarding => f.write_str("Forwarding"),
            TunnelState::Stopped => f.write_str("Stopped"),
        }
    }
}

/// Keeps one `host:port` key forwarded to a pod port until its group stops.
pub struct TunnelItem {
    key: String,
    pod: PodKey,
    target: TargetPort,
    ctx: TunnelContext,
    cancel: CancellationToken,
    state: watch::Sender<TunnelState>,
}

impl TunnelItem {
    /// Build an item and a receiver observing its state.
    pub fn new(
        key: String,
        pod: PodKey,
        target: TargetPort,
        ctx: TunnelContext,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<TunnelState>) {
        let (state, state_rx) = watch::channel(TunnelState::Connecting);
        let item = Self {
            key,
            pod,
            target,
            ctx,
            cancel,
            state,
        };
        (item, state_rx)
    }

    /// Run attempts until the group's token is cancelled.
    ///
    /// Retries are unbounded with a fixed backoff. Cancellation is checked
    /// after each attempt returns and while backing off.
    pub async fn run(self) {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            self.state.send_replace(TunnelState::Connecting);

            match self.attempt().await {
                Ok(()) => debug!(key = %self.key, pod = %self.pod, attempt, "Tunnel closed"),
                Err(e) => debug!(
                    key = %self.key,
                    pod = %self.pod,
                    attempt,
                    error = %e,
                    "Tunnel attempt failed"
                ),
            }

            if self.cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.retry_backoff) => {}
            }
        }

        self.state.send_replace(TunnelState::Stopped);
        debug!(key = %self.key, pod = %self.pod, "Tunnel stopped");
    }

    async fn attempt(&self) -> Result<()> {
        let pod = self
            .ctx
            .pods
            .get_pod(&self.pod)
            .ok_or_else(|| Error::PodNotFound {
                namespace: self.pod.namespace.clone(),
                name: self.pod.name.clone(),
            })?;
        if !pod.is_running() {
            return Err(Error::PodNotRunning {
                namespace: pod.namespace,
                name: pod.name,
                phase: pod.phase.to_string(),
            });
        }

        let target = TunnelTarget {
            pod: self.pod.clone(),
            port: self.target.resolve(&pod)?,
        };
        let mut tunnel = self.ctx.transport.open(&target, self.cancel.clone()).await?;

        let local_port = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            ready = tunnel.ready() => ready?,
        };

        // A retired item must not overwrite the key its replacement owns
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let published = Published::new(&self.ctx.table, &self.key, format!(":{}", local_port));
        self.state.send_replace(TunnelState::Forwarding);
        info!(
            key = %self.key,
            pod = %self.pod,
            port = target.port,
            address = %published.address,
            "Tunnel forwarding"
        );

        let result = tunnel.forward().await;
        drop(published);
        result
    }
}

/// An address table entry owned by the current attempt; removed on drop.
struct Published<'a> {
    table: &'a AddressTable,
    key: &'a str,
    address: String,
}

impl<'a> Published<'a> {
    fn new(table: &'a AddressTable, key: &'a str, address: String) -> Self {
        table.set(key, &address);
        Self {
            table,
            key,
            address,
        }
    }
}

impl Drop for Published<'_> {
    fn drop(&mut self) {
        // A replacement tunnel may already own the key
        self.table.clear_if(self.key, &self.address);
    }
}
