//! Outbound connect to a relay target

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::config::{Target, TargetAddr};
use crate::Result;

/// Resolve `target` and connect to the first address that accepts.
///
/// The whole attempt, name resolution included, is bounded by
/// `connect_timeout`. There is no retry.
pub async fn connect(target: &Target, connect_timeout: Duration) -> Result<TcpStream> {
    match timeout(connect_timeout, connect_inner(target)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "connect to {} timed out after {:?}",
            target,
            connect_timeout
        )),
    }
}

async fn connect_inner(target: &Target) -> Result<TcpStream> {
    let addrs = resolve(target).await?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!(target_addr = %target, addr = %addr, "Connected to target");
                return Ok(stream);
            }
            Err(e) => {
                debug!(target_addr = %target, addr = %addr, error = %e, "Target address refused");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(anyhow!("connect to {} failed: {}", target, e)),
        None => Err(anyhow!("connect to {} failed: no addresses resolved", target)),
    }
}

/// Resolve a target to the socket addresses to try, in resolver order
pub async fn resolve(target: &Target) -> Result<Vec<SocketAddr>> {
    if let Some(addr) = target.socket_addr() {
        return Ok(vec![addr]);
    }

    let TargetAddr::Domain(domain) = &target.host else {
        return Err(anyhow!("target {} has no address", target));
    };

    let addrs: Vec<SocketAddr> = lookup_host((domain.as_str(), target.port))
        .await
        .with_context(|| format!("DNS resolution failed for {}", domain))?
        .collect();

    if addrs.is_empty() {
        return Err(anyhow!("DNS resolution returned no addresses for {}", domain));
    }

    debug!(domain = %domain, count = addrs.len(), "Resolved target");
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_literal_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = Target::new(TargetAddr::Ipv4(Ipv4Addr::LOCALHOST), port);
        let stream = connect(&target, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let target = Target::new(TargetAddr::Ipv4(Ipv4Addr::LOCALHOST), port);
        let err = connect(&target, Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("failed"), "{}", err);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let target = Target::new(TargetAddr::Domain("localhost".to_string()), 80);
        let addrs = resolve(&target).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 80));
    }

    #[tokio::test]
    async fn test_resolve_literal_skips_dns() {
        let target = Target::new(TargetAddr::Ipv4(Ipv4Addr::new(192, 0, 2, 1)), 7);
        assert_eq!(
            resolve(&target).await.unwrap(),
            vec!["192.0.2.1:7".parse::<SocketAddr>().unwrap()]
        );
    }
}
