//! Proxy configuration and kube client construction

use std::path::PathBuf;
use std::time::Duration;

use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tunnel::DEFAULT_RETRY_BACKOFF;

/// Default connection timeout for the kube client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for the kube client
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Install aws-lc-rs as the process-wide rustls provider.
///
/// Safe to call repeatedly; only the first call has an effect.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// How to reach the cluster and how tunnels behave
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Kubeconfig file; in-cluster or default kubeconfig discovery when absent
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context; the file's current context when absent
    pub context: Option<String>,
    /// Namespace to watch; all namespaces when absent
    pub namespace: Option<String>,
    /// Delay between tunnel attempts
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            namespace: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    fn kubeconfig_options(&self) -> KubeConfigOptions {
        KubeConfigOptions {
            context: self.context.clone(),
            ..KubeConfigOptions::default()
        }
    }

    /// Build the kube client.
    ///
    /// An explicit kubeconfig path or context loads that kubeconfig;
    /// otherwise the configuration is inferred (in-cluster, then
    /// `$KUBECONFIG`/`~/.kube/config`).
    pub async fn client(&self) -> Result<Client> {
        install_crypto_provider();

        let mut config = match (&self.kubeconfig, &self.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::kube_config(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &self.kubeconfig_options())
                    .await
                    .map_err(|e| Error::kube_config(format!("failed to load kubeconfig: {}", e)))?
            }
            (None, Some(_)) => Config::from_kubeconfig(&self.kubeconfig_options())
                .await
                .map_err(|e| Error::kube_config(format!("failed to load kubeconfig: {}", e)))?,
            (None, None) => Config::infer()
                .await
                .map_err(|e| Error::kube_config(format!("failed to infer config: {}", e)))?,
        };
        config.connect_timeout = Some(self.connect_timeout);
        config.read_timeout = Some(self.read_timeout);

        debug!(cluster_url = %config.cluster_url, "Creating kube client");
        Ok(Client::try_from(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert!(config.kubeconfig.is_none());
        assert!(config.namespace.is_none());
        assert_eq!(config.retry_backoff, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT);
    }

    #[test]
    fn test_builders() {
        let config = ProxyConfig::default()
            .with_kubeconfig("/tmp/kubeconfig")
            .with_context("staging")
            .with_namespace("apps")
            .with_retry_backoff(Duration::from_millis(250));

        assert_eq!(config.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
        assert_eq!(config.namespace.as_deref(), Some("apps"));
        assert_eq!(config.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.kubeconfig_options().context.as_deref(), Some("staging"));
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_is_an_error() {
        let config = ProxyConfig::default().with_kubeconfig("/nonexistent/svcdial/kubeconfig");

        let Err(err) = config.client().await else {
            panic!("expected kubeconfig error");
        };
        assert!(matches!(err, Error::KubeConfig { .. }));
        assert!(err.to_string().contains("/nonexistent/svcdial/kubeconfig"));
    }

    #[tokio::test]
    async fn test_kubeconfig_context_selects_cluster() {
        let dir = std::env::temp_dir().join(format!("svcdial-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("kubeconfig");
        std::fs::write(
            &path,
            r#"apiVersion: v1
kind: Config
current-context: prod
clusters:
- name: prod
  cluster:
    server: https://prod.example.com:6443
- name: staging
  cluster:
    server: https://staging.example.com:6443
contexts:
- name: prod
  context:
    cluster: prod
    user: dev
- name: staging
  context:
    cluster: staging
    user: dev
users:
- name: dev
  user:
    token: abc
"#,
        )
        .unwrap();

        let config = ProxyConfig::default()
            .with_kubeconfig(&path)
            .with_context("staging");
        let client = config.client().await;
        assert!(client.is_ok());

        let unknown = ProxyConfig::default()
            .with_kubeconfig(&path)
            .with_context("missing");
        assert!(matches!(
            unknown.client().await,
            Err(Error::KubeConfig { .. })
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
