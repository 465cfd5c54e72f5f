//! Get command - one HTTP GET to a cluster service through its tunnel

use std::time::Duration;

use clap::Args;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use svcdial_proxy::ServiceProxy;

use super::{parse_duration, wait_with_timeout, ClusterArgs, CommandErrorExt};
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fetch `url` from a service, e.g. `http://web.default.svc.cluster.local:8080/healthz`
#[derive(Args, Debug)]
pub struct GetArgs {
    /// http URL addressed by service DNS name
    pub url: String,

    /// How long to wait for the service tunnel to come up
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub wait: Duration,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

/// Where a parsed URL points
#[derive(Debug, PartialEq, Eq)]
struct Target {
    /// `host:port`, the address table key
    address: String,
    /// Host header value
    authority: String,
    path: String,
}

fn parse_target(url: &str) -> Result<Target> {
    let uri: Uri = url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| Error::invalid_url(url, e.to_string()))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(Error::invalid_url(
                url,
                format!("unsupported scheme {}", other),
            ))
        }
        None => return Err(Error::invalid_url(url, "missing scheme")),
    }
    let authority = uri
        .authority()
        .ok_or_else(|| Error::invalid_url(url, "missing host"))?;
    let port = authority.port_u16().unwrap_or(80);

    Ok(Target {
        address: format!("{}:{}", authority.host(), port),
        authority: authority.as_str().to_string(),
        path: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
    })
}

pub async fn run(args: GetArgs) -> Result<()> {
    let target = parse_target(&args.url)?;

    let proxy = ServiceProxy::connect(args.cluster.proxy_config()).await?;
    proxy.start().await?;

    let result = fetch(&proxy, &target, args.wait).await;
    proxy.shutdown().await;
    let body = result?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&body).await?;
    stdout.flush().await?;
    Ok(())
}

async fn fetch(proxy: &ServiceProxy, target: &Target, wait: Duration) -> Result<Bytes> {
    let local = wait_with_timeout(wait, POLL_INTERVAL, &target.address, || {
        let mapped = proxy.table().resolve(&target.address);
        async move { Ok(mapped) }
    })
    .await?;
    debug!(address = %target.address, local = %local, "Service tunnel ready");

    let stream = proxy.dial("tcp", &target.address).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "HTTP connection error");
        }
    });

    let request = Request::get(target.path.as_str())
        .header(HOST, target.authority.as_str())
        .body(Empty::<Bytes>::new())
        .cmd_err()?;

    let response = sender.send_request(request).await?;
    info!(status = %response.status(), address = %target.address, "Response received");

    let body = response.into_body().collect().await?.to_bytes();
    Ok(body)
}
