//! Tunnel transport: the forwarded path from a local port to a pod port
//!
//! The reconciliation core only sees the [`TunnelTransport`] and [`Tunnel`]
//! traits. [`KubePortForwarder`] implements them on top of the API server's
//! `pods/portforward` subresource.
//!
//! Flow of one tunnel:
//! 1. `open` binds an ephemeral local listener and opens a port-forward
//!    connection to the pod that is kept idle as a liveness signal
//! 2. `ready` reports the local port
//! 3. `forward` accepts local connections and bridges each one over its own
//!    port-forward stream. It returns when the token is cancelled, the
//!    listener fails, or the liveness connection closes. A failing
//!    connection is logged and does not affect the others.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Portforwarder};
use kube::Client;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::types::PodKey;

/// Where a tunnel forwards to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelTarget {
    pub pod: PodKey,
    /// Container port on the pod
    pub port: u16,
}

/// Creates tunnels to pod ports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Set up a tunnel to `target`.
    ///
    /// `cancel` is the owning group's token; the returned tunnel must stop
    /// forwarding promptly once it fires.
    async fn open(&self, target: &TunnelTarget, cancel: CancellationToken)
        -> Result<Box<dyn Tunnel>>;
}

/// A single forwarded path, used once.
#[async_trait]
pub trait Tunnel: Send {
    /// Wait until the local listener is bound and return its port.
    async fn ready(&mut self) -> Result<u16>;

    /// Keep the path alive until it fails or the cancellation token fires.
    async fn forward(self: Box<Self>) -> Result<()>;
}

/// Port-forward transport backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubePortForwarder {
    client: Client,
    bind_addr: IpAddr,
}

impl KubePortForwarder {
    /// Transport that binds local listeners on the loopback interface.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// Override the interface local listeners bind to.
    pub fn with_bind_addr(mut self, bind_addr: IpAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }
}

#[async_trait]
impl TunnelTransport for KubePortForwarder {
    async fn open(
        &self,
        target: &TunnelTarget,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Tunnel>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.pod.namespace);
        let ports = [target.port];

        // Upgrade failures surface here, before anything is published
        let liveness = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::tunnel_setup(&target.pod.name, target.port, "cancelled"));
            }
            pf = pods.portforward(&target.pod.name, &ports) => {
                pf.map_err(|e| Error::tunnel_setup(&target.pod.name, target.port, e.to_string()))?
            }
        };

        let listener = TcpListener::bind((self.bind_addr, 0))
            .await
            .map_err(|e| Error::tunnel_setup(&target.pod.name, target.port, e.to_string()))?;

        Ok(Box::new(PortForwardTunnel {
            pods,
            target: target.clone(),
            listener,
            cancel,
            liveness,
        }))
    }
}

struct PortForwardTunnel {
    pods: Api<Pod>,
    target: TunnelTarget,
    listener: TcpListener,
    cancel: CancellationToken,
    /// Idle port-forward; it closes when the pod or the API server connection goes away
    liveness: Portforwarder,
}

#[async_trait]
impl Tunnel for PortForwardTunnel {
    async fn ready(&mut self) -> Result<u16> {
        let addr = self
            .listener
            .local_addr()
            .map_err(|e| Error::tunnel_setup(&self.target.pod.name, self.target.port, e.to_string()))?;
        Ok(addr.port())
    }

    async fn forward(self: Box<Self>) -> Result<()> {
        let PortForwardTunnel {
            pods,
            target,
            listener,
            cancel,
            liveness,
        } = *self;

        let lost = async move {
            match liveness.join().await {
                Ok(()) => "port-forward connection closed".to_string(),
                Err(e) => format!("port-forward connection lost: {}", e),
            }
        };

        let pod = target.pod.name.clone();
        let port = target.port;
        serve(listener, cancel, lost, &target, move |conn| {
            bridge(conn, pods.clone(), pod.clone(), port)
        })
        .await
    }
}

/// Accept local connections and run `bridge` for each until the token is
/// cancelled, `lost` resolves, or the listener fails.
///
/// A failed bridge is only logged. On cancellation running bridges are
/// aborted; otherwise they are left to finish on their own.
async fn serve<B, F>(
    listener: TcpListener,
    cancel: CancellationToken,
    lost: impl Future<Output = String> + Send,
    target: &TunnelTarget,
    bridge: B,
) -> Result<()>
where
    B: Fn(TcpStream) -> F + Send,
    F: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    let pod = target.pod.name.as_str();
    let port = target.port;
    let mut bridges = JoinSet::new();
    tokio::pin!(lost);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(pod, port, "Tunnel cancelled");
                return Ok(());
            }
            reason = &mut lost => {
                bridges.detach_all();
                return Err(Error::tunnel_forward(pod, port, reason));
            }
            Some(joined) = bridges.join_next(), if !bridges.is_empty() => {
                if let Err(e) = joined {
                    warn!(pod, port, error = %e, "Connection bridge task failed");
                }
            }
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        bridges.detach_all();
                        return Err(Error::tunnel_forward(pod, port, e.to_string()));
                    }
                };
                trace!(pod, port, %peer, "Accepted local connection");

                let connection = bridge(conn);
                bridges.spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(port, %peer, error = %e, "Connection bridge failed");
                    }
                });
            }
        }
    }
}

/// Copy bytes between a local connection and a fresh port-forward stream.
async fn bridge(
    mut conn: TcpStream,
    pods: Api<Pod>,
    pod: String,
    port: u16,
) -> std::result::Result<(), String> {
    let ports = [port];
    let mut forwarder = pods
        .portforward(&pod, &ports)
        .await
        .map_err(|e| e.to_string())?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| format!("no stream for port {}", port))?;

    match tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
        Ok((sent, received)) => trace!(pod = %pod, port, sent, received, "Connection closed"),
        Err(e) => debug!(pod = %pod, port, error = %e, "Connection bridge error"),
    }
    drop(upstream);

    forwarder.join().await.map_err(|e| e.to_string())
}
