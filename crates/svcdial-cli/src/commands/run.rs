//! Run command - keep tunnels open until interrupted

use std::collections::BTreeMap;

use clap::Args;
use tracing::{info, warn};

use svcdial_proxy::ServiceProxy;

use super::ClusterArgs;
use crate::Result;

/// Proxy every watched service and log the address table as it changes
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let proxy = ServiceProxy::connect(args.cluster.proxy_config()).await?;
    proxy.start().await?;

    let mut changes = proxy.table().subscribe();
    let mut last = BTreeMap::new();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for interrupt");
                }
                info!("Interrupted, shutting down");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = proxy.addresses();
                log_changes(&last, &current);
                last = current;
            }
        }
    }

    proxy.shutdown().await;
    Ok(())
}

fn log_changes(previous: &BTreeMap<String, String>, current: &BTreeMap<String, String>) {
    for (key, address) in current {
        if previous.get(key) != Some(address) {
            info!(key = %key, address = %address, "Service reachable");
        }
    }
    for key in previous.keys().filter(|key| !current.contains_key(*key)) {
        info!(key = %key, "Service unreachable");
    }
}
