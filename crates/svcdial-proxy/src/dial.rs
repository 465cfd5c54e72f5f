//! Network dialing with address table substitution

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::trace;

use crate::address_table::AddressTable;

/// Connect to `address`, substituting a mapped local tunnel address if the
/// table has one.
///
/// Unmapped addresses are dialed as given. Errors are the plain connection
/// errors of the underlying dial.
pub async fn dial(table: &AddressTable, network: &str, address: &str) -> io::Result<TcpStream> {
    let target = match table.resolve(address) {
        Some(local) => {
            trace!(address, local = %local, "Dialing through tunnel");
            local
        }
        None => address.to_string(),
    };
    dial_direct(network, &target).await
}

/// Dial without consulting any table.
///
/// Supports `tcp`, `tcp4` and `tcp6`. A host-less `:<port>` address is
/// dialed on the loopback interface of the requested family.
pub async fn dial_direct(network: &str, address: &str) -> io::Result<TcpStream> {
    match network {
        "tcp" | "tcp4" => {
            let address = with_loopback(address, "127.0.0.1");
            if network == "tcp" {
                TcpStream::connect(address.as_str()).await
            } else {
                connect_family(&address, SocketAddr::is_ipv4).await
            }
        }
        "tcp6" => connect_family(&with_loopback(address, "[::1]"), SocketAddr::is_ipv6).await,
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported network: {}", other),
        )),
    }
}

fn with_loopback(address: &str, loopback: &str) -> String {
    if address.starts_with(':') {
        format!("{}{}", loopback, address)
    } else {
        address.to_string()
    }
}

async fn connect_family(address: &str, wanted: fn(&SocketAddr) -> bool) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host(address).await?.filter(|a| wanted(a)) {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no suitable address for {}", address),
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_with_loopback() {
        assert_eq!(with_loopback(":40001", "127.0.0.1"), "127.0.0.1:40001");
        assert_eq!(with_loopback(":40001", "[::1]"), "[::1]:40001");
        assert_eq!(with_loopback("10.0.0.1:80", "127.0.0.1"), "10.0.0.1:80");
    }

    #[tokio::test]
    async fn test_mapped_address_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let table = AddressTable::new();
        table.set("web.default.svc.cluster.local:8080", &format!(":{}", port));

        let stream = dial(&table, "tcp", "web.default.svc.cluster.local:8080")
            .await
            .unwrap();
        let (_accepted, peer) = listener.accept().await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_unmapped_address_dials_directly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let table = AddressTable::new();
        let stream = dial(&table, "tcp4", &addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().to_string(), addr);
    }

    #[tokio::test]
    async fn test_unmapped_failure_matches_direct_dial() {
        // Grab a free port, then close the listener so nothing accepts
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let table = AddressTable::new();
        let via_table = dial(&table, "tcp", &addr).await.unwrap_err();
        let direct = TcpStream::connect(addr.as_str()).await.unwrap_err();
        assert_eq!(via_table.kind(), direct.kind());
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let table = AddressTable::new();
        let err = dial(&table, "udp", "127.0.0.1:53").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
