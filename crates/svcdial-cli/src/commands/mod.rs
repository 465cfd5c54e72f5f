//! CLI commands

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Args;
use tracing::debug;

use svcdial_proxy::tunnel::DEFAULT_RETRY_BACKOFF;
use svcdial_proxy::ProxyConfig;

use crate::{Error, Result};

pub mod get;
pub mod run;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Cluster connection flags shared by every command
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Path to kubeconfig; inferred (in-cluster, KUBECONFIG, ~/.kube/config) when unset
    #[arg(long, env = "SVCDIAL_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, env = "SVCDIAL_CONTEXT")]
    pub context: Option<String>,

    /// Only proxy services in this namespace (default: all namespaces)
    #[arg(short = 'n', long, env = "SVCDIAL_NAMESPACE")]
    pub namespace: Option<String>,

    /// Delay between tunnel attempts (e.g. 500ms, 2s)
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub retry_backoff: Duration,
}

impl ClusterArgs {
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            kubeconfig: self.kubeconfig.clone(),
            context: self.context.clone(),
            namespace: self.namespace.clone(),
            retry_backoff: self.retry_backoff,
            ..ProxyConfig::default()
        }
    }
}

impl Default for ClusterArgs {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            namespace: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Parse a human-friendly duration.
///
/// Supports `Nms`, `Ns`, `Nm` and `Nh`; a bare number is seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration '{}', expected e.g. 500ms, 30s, 5m", s);

    let (digits, millis_per_unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1_000)
    };

    let n: u64 = digits.parse().map_err(|_| invalid())?;
    n.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - Condition met, return the value
/// - `Ok(None)` - Condition not met yet, keep polling
/// - `Err(e)` - Fatal error, stop polling immediately
pub type PollResult<T> = std::result::Result<Option<T>, String>;

/// Poll `check_fn` every `interval` until it yields a value, fails, or
/// `timeout` passes.
pub async fn wait_with_timeout<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    mut check_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let start = Instant::now();

    loop {
        match check_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                if start.elapsed() > timeout {
                    return Err(Error::command_failed(format!(
                        "Timeout waiting for {}",
                        description
                    )));
                }
                debug!("Waiting for {}...", description);
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                return Err(Error::command_failed(format!(
                    "Error waiting for {}: {}",
                    description, e
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration(" 7 "), Ok(Duration::from_secs(7)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_cluster_args_to_config() {
        let args = ClusterArgs {
            kubeconfig: Some(PathBuf::from("/tmp/kc")),
            context: Some("dev".to_string()),
            ..ClusterArgs::default()
        };
        let config = args.proxy_config();
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/tmp/kc")));
        assert_eq!(config.context.as_deref(), Some("dev"));
        assert!(config.namespace.is_none());
        assert_eq!(config.retry_backoff, DEFAULT_RETRY_BACKOFF);
    }

    #[tokio::test]
    async fn test_wait_with_timeout_returns_value() {
        let mut calls = 0;
        let value = wait_with_timeout(
            Duration::from_secs(1),
            Duration::from_millis(1),
            "counter",
            || {
                calls += 1;
                let n = calls;
                async move { Ok((n >= 3).then_some(n)) }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_wait_with_timeout_times_out() {
        let err = wait_with_timeout::<(), _, _>(
            Duration::from_millis(20),
            Duration::from_millis(5),
            "nothing",
            || async { Ok(None) },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Timeout waiting for nothing"));
    }

    #[tokio::test]
    async fn test_wait_with_timeout_stops_on_error() {
        let err = wait_with_timeout::<(), _, _>(
            Duration::from_secs(1),
            Duration::from_millis(5),
            "broken",
            || async { Err("boom".to_string()) },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
