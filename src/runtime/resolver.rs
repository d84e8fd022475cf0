//! Name resolution and connection establishment for the driver.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::upstream::{IoFault, ResolveOutcome};

/// Resolve `name` through the system resolver.
pub(crate) async fn resolve(name: &str, port: u16) -> ResolveOutcome {
    match tokio::net::lookup_host((name, port)).await {
        Ok(addrs) => {
            let mut addrs: Vec<SocketAddr> = addrs.collect();
            addrs.dedup();
            tracing::trace!(name, count = addrs.len(), "Resolved");
            ResolveOutcome::Addresses(addrs)
        }
        Err(e) => ResolveOutcome::Failed(e.to_string()),
    }
}

/// Try `addrs` in turn, beginning at `start` and wrapping around.
/// Returns the index of the address that accepted.
pub(crate) async fn connect(addrs: &[SocketAddr], start: usize) -> Result<(usize, TcpStream), IoFault> {
    let mut last = IoFault::Io("no addresses".to_string());
    for k in 0..addrs.len() {
        let index = (start + k) % addrs.len();
        match TcpStream::connect(addrs[index]).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(addr = %addrs[index], error = %e, "Couldn't disable Nagle's algorithm");
                }
                return Ok((index, stream));
            }
            Err(e) => {
                tracing::debug!(addr = %addrs[index], error = %e, "Connect attempt failed");
                last = e.into();
            }
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn resolves_literal_address() {
        match resolve("127.0.0.1", 8123).await {
            ResolveOutcome::Addresses(addrs) => {
                assert_eq!(addrs, vec!["127.0.0.1:8123".parse::<SocketAddr>().unwrap()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn connect_skips_dead_addresses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        // Bind then drop to get a port nobody listens on.
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (index, _stream) = connect(&[dead, live], 0).await.unwrap();
        assert_eq!(index, 1);
        let (index, _stream) = connect(&[dead, live], 1).await.unwrap();
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn connect_with_no_addresses_fails() {
        assert!(connect(&[], 0).await.is_err());
    }
}
