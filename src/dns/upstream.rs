//! Upstream DNS server discovery.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to read resolver config: {0}")]
    Io(#[from] std::io::Error),
    #[error("no nameserver entry found")]
    NoNameserver,
    #[error("unparsable nameserver address: {0}")]
    InvalidAddress(String),
}

const DNS_PORT: u16 = 53;

/// Returns `<address>:53` for the first `nameserver` line of a resolv.conf
/// style file.
pub fn read_first_nameserver(path: impl AsRef<Path>) -> Result<SocketAddr, UpstreamError> {
    let content = fs::read_to_string(path)?;
    parse_first_nameserver(&content)
}

fn parse_first_nameserver(content: &str) -> Result<SocketAddr, UpstreamError> {
    let addr = content
        .lines()
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            (fields.next() == Some("nameserver")).then(|| fields.next())?
        })
        .ok_or(UpstreamError::NoNameserver)?;

    // Drop an IPv6 zone suffix ("fe80::1%eth0").
    let host = addr.split('%').next().unwrap_or(addr);
    let ip = host
        .parse::<IpAddr>()
        .map_err(|_| UpstreamError::InvalidAddress(addr.to_string()))?;

    Ok(SocketAddr::new(ip, DNS_PORT))
}

/// Discovers the upstream DNS server, falling back to `fallback` when the
/// resolver config is unreadable or has no usable nameserver.
pub fn discover_upstream(resolv_conf: impl AsRef<Path>, fallback: SocketAddr) -> SocketAddr {
    let resolv_conf = resolv_conf.as_ref();
    match read_first_nameserver(resolv_conf) {
        Ok(upstream) => {
            info!("using {} as upstream DNS", upstream);
            upstream
        }
        Err(e) => {
            warn!(
                "could not read DNS server from {} ({}), using {}",
                resolv_conf.display(),
                e,
                fallback
            );
            fallback
        }
    }
}
