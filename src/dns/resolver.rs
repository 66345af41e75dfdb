//! Name resolution used by the interceptor and the firewall slow path.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lookup of {name} failed: {source}")]
    Lookup {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no {family} addresses for {name}")]
    NoRecords { name: String, family: &'static str },
    #[error("exchange with upstream {server} failed: {source}")]
    Exchange {
        server: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream {0} did not answer within {1:?}")]
    Timeout(SocketAddr, Duration),
    #[error("query too short to carry a transaction id")]
    MalformedQuery,
}

pub type ResolveFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ResolveError>> + Send + 'a>>;

/// Source of DNS answers.
///
/// Names may be passed with or without the trailing root dot.
pub trait Resolver: Send + Sync {
    /// Resolves IPv4 addresses through the host resolver.
    fn lookup_ipv4<'a>(&'a self, name: &'a str) -> ResolveFuture<'a, Vec<Ipv4Addr>>;

    /// Resolves IPv6 addresses through the host resolver.
    fn lookup_ipv6<'a>(&'a self, name: &'a str) -> ResolveFuture<'a, Vec<Ipv6Addr>>;

    /// Sends a wire-format query to the upstream server and returns the raw
    /// response message.
    fn exchange<'a>(&'a self, query: &'a [u8]) -> ResolveFuture<'a, Vec<u8>>;

    /// The upstream server queries are forwarded to.
    fn upstream(&self) -> SocketAddr;
}

/// Buffer size for upstream responses (EDNS0 supports up to 4096).
const DNS_BUF_SIZE: usize = 4096;

/// Resolver backed by the host's `getaddrinfo` and a plain UDP upstream.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    upstream: SocketAddr,
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }

    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let host = name.trim_end_matches('.');
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| ResolveError::Lookup {
                name: name.to_string(),
                source,
            })?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }

    async fn exchange_once(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        if query.len() < 2 {
            return Err(ResolveError::MalformedQuery);
        }
        let server = self.upstream;
        let io_err = |source| ResolveError::Exchange { server, source };

        let bind_addr: SocketAddr = if server.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(io_err)?;
        socket.connect(server).await.map_err(io_err)?;
        socket.send(query).await.map_err(io_err)?;

        let mut buf = vec![0u8; DNS_BUF_SIZE];
        loop {
            let len = socket.recv(&mut buf).await.map_err(io_err)?;
            // Stray datagrams with another transaction id are ignored.
            if len >= 2 && buf[..2] == query[..2] {
                buf.truncate(len);
                return Ok(buf);
            }
            debug!("ignoring upstream datagram with unexpected id from {}", server);
        }
    }
}

impl Resolver for SystemResolver {
    fn lookup_ipv4<'a>(&'a self, name: &'a str) -> ResolveFuture<'a, Vec<Ipv4Addr>> {
        Box::pin(async move {
            let ips: Vec<Ipv4Addr> = self
                .lookup(name)
                .await?
                .into_iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(v6) => v6.to_ipv4_mapped(),
                })
                .collect();
            if ips.is_empty() {
                return Err(ResolveError::NoRecords {
                    name: name.to_string(),
                    family: "IPv4",
                });
            }
            Ok(ips)
        })
    }

    fn lookup_ipv6<'a>(&'a self, name: &'a str) -> ResolveFuture<'a, Vec<Ipv6Addr>> {
        Box::pin(async move {
            let ips: Vec<Ipv6Addr> = self
                .lookup(name)
                .await?
                .into_iter()
                .filter_map(|ip| match ip {
                    IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Some(v6),
                    _ => None,
                })
                .collect();
            if ips.is_empty() {
                return Err(ResolveError::NoRecords {
                    name: name.to_string(),
                    family: "IPv6",
                });
            }
            Ok(ips)
        })
    }

    fn exchange<'a>(&'a self, query: &'a [u8]) -> ResolveFuture<'a, Vec<u8>> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.exchange_once(query))
                .await
                .map_err(|_| ResolveError::Timeout(self.upstream, self.timeout))?
        })
    }

    fn upstream(&self) -> SocketAddr {
        self.upstream
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that the upstream exchange returns the response carrying the
    /// query's transaction id and skips unrelated datagrams.
    #[tokio::test]
    async fn exchange_matches_transaction_id() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = buf[..len].to_vec();
            server.send_to(&[0xde, 0xad, 0x00], peer).await.unwrap();
            let mut reply = query.clone();
            reply.push(0xff);
            server.send_to(&reply, peer).await.unwrap();
        });

        let resolver = SystemResolver::new(server_addr, Duration::from_secs(2));
        let response = resolver.exchange(&[0x12, 0x34, 0x01]).await.unwrap();
        assert_eq!(response, vec![0x12, 0x34, 0x01, 0xff]);
    }

    /// Tests that a silent upstream is reported as a timeout.
    #[tokio::test]
    async fn exchange_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver =
            SystemResolver::new(server.local_addr().unwrap(), Duration::from_millis(100));
        assert!(matches!(
            resolver.exchange(&[0x00, 0x01]).await,
            Err(ResolveError::Timeout(..))
        ));
    }

    #[tokio::test]
    async fn exchange_rejects_short_query() {
        let resolver = SystemResolver::new("127.0.0.1:53".parse().unwrap(), Duration::from_secs(1));
        assert!(matches!(
            resolver.exchange(&[0x01]).await,
            Err(ResolveError::MalformedQuery)
        ));
    }

    #[tokio::test]
    async fn lookup_localhost_ipv4() {
        let resolver = SystemResolver::new("127.0.0.1:53".parse().unwrap(), Duration::from_secs(1));
        let ips = resolver.lookup_ipv4("localhost").await.unwrap();
        assert!(ips.contains(&Ipv4Addr::LOCALHOST));
    }
}
