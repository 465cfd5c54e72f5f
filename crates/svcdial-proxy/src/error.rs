//! Error types for the service proxy
//!
//! Construction-time errors (kubeconfig, client) propagate to the caller.
//! Everything a tunnel attempt can hit is also represented here so the retry
//! loop can log it with context, but those errors never leave the tunnel task.

use thiserror::Error;

/// Proxy result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the proxy and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes client error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be read or turned into a client config
    #[error("kubeconfig error: {message}")]
    KubeConfig {
        /// What went wrong while loading the configuration
        message: String,
    },

    /// A reflector writer went away before its cache finished the initial list
    #[error("{resource} cache was dropped before it synced")]
    CacheSync {
        /// Resource kind whose cache never became ready
        resource: &'static str,
    },

    /// The pod bound to a tunnel is no longer in the cache
    #[error("pod {namespace}/{name} not found")]
    PodNotFound {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
    },

    /// The pod bound to a tunnel exists but cannot be forwarded to
    #[error("pod {namespace}/{name} is {phase}, not Running")]
    PodNotRunning {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
        /// Observed lifecycle phase
        phase: String,
    },

    /// A named target port is not declared by any container of the pod
    #[error("pod {pod} has no container port named '{port}'")]
    UnknownPortName {
        /// Pod name
        pod: String,
        /// The unresolved port name
        port: String,
    },

    /// The transport could not set up a forwarded path
    #[error("tunnel setup to {pod}:{port} failed: {message}")]
    TunnelSetup {
        /// Target pod name
        pod: String,
        /// Target container port
        port: u16,
        /// Underlying failure
        message: String,
    },

    /// An established forwarded path broke
    #[error("tunnel to {pod}:{port} failed: {message}")]
    TunnelForward {
        /// Target pod name
        pod: String,
        /// Target container port
        port: u16,
        /// Underlying failure
        message: String,
    },
}

impl Error {
    /// Create a kubeconfig error
    pub fn kube_config(message: impl Into<String>) -> Self {
        Error::KubeConfig {
            message: message.into(),
        }
    }

    /// Create a tunnel setup error
    pub fn tunnel_setup(pod: impl Into<String>, port: u16, message: impl Into<String>) -> Self {
        Error::TunnelSetup {
            pod: pod.into(),
            port,
            message: message.into(),
        }
    }

    /// Create a tunnel forward error
    pub fn tunnel_forward(pod: impl Into<String>, port: u16, message: impl Into<String>) -> Self {
        Error::TunnelForward {
            pod: pod.into(),
            port,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_not_running_message() {
        let err = Error::PodNotRunning {
            namespace: "default".to_string(),
            name: "p1".to_string(),
            phase: "Pending".to_string(),
        };
        assert_eq!(err.to_string(), "pod default/p1 is Pending, not Running");
    }

    #[test]
    fn test_tunnel_setup_helper() {
        let err = Error::tunnel_setup("p1", 80, "upgrade refused");
        assert!(matches!(err, Error::TunnelSetup { port: 80, .. }));
        assert_eq!(err.to_string(), "tunnel setup to p1:80 failed: upgrade refused");
    }
}
