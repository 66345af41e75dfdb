//! DNS-gated egress firewall and transparent proxy for a sandboxed network
//! namespace.
//!
//! Traffic leaving the sandbox arrives as flows (see [`flow`]). The
//! [`Mux`] routes each flow by destination pattern, asks the [`Firewall`]
//! whether it may proceed, and hands it to either the [`DnsInterceptor`]
//! (port 53) or the [`ConnectionProxy`].
//!
//! # Policy
//!
//! With no rules the firewall only caps the number of flows. With rules it
//! admits literal addresses plus whatever the allowed domains currently
//! resolve to. Queries for any other domain are answered with no records,
//! so the sandbox never learns their addresses.
//!
//! # Example
//!
//! ```no_run
//! use egress_tap::{RuleSet, Tap, TapConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = TapConfig::default();
//! let rules = RuleSet::load_or_unrestricted(&config.rules);
//! let tap = Tap::new(config, &rules);
//! tap.install_default_routes();
//! let _frontends = tap.start_frontends().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dns;
pub mod firewall;
pub mod flow;
pub mod frontend;
pub mod mux;
pub mod proxy;

pub use config::{ConfigError, DEFAULT_RESOLV_CONF, DEFAULT_RULES_PATH, FrontendConfig, TapConfig};
pub use dns::{DnsInterceptor, InterceptError, ResolveError, Resolver, SystemResolver};
pub use firewall::{Firewall, PolicyMode, Rule, RuleSet, RulesError};
pub use flow::{DatagramFlow, FlowRequest, FlowStream};
pub use mux::{Mux, TcpFlowListener};
pub use proxy::ConnectionProxy;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::getppid;
use tokio::task::JoinHandle;
use tracing::info;

use frontend::{DnsListener, RedirectListener};

/// The running tap: firewall state plus the routing registries, shared by
/// every flow handler.
pub struct Tap {
    config: TapConfig,
    firewall: Arc<Firewall>,
    mux: Arc<Mux>,
    interceptor: Arc<DnsInterceptor>,
    proxy: ConnectionProxy,
}

impl Tap {
    /// Builds the tap with the system resolver. The upstream DNS server is
    /// taken from the config or discovered from the resolver config.
    pub fn new(config: TapConfig, rules: &RuleSet) -> Self {
        let upstream = match config.upstream_dns {
            Some(upstream) => upstream,
            None => dns::discover_upstream(&config.resolv_conf, config.fallback_dns),
        };
        let resolver = Arc::new(SystemResolver::new(upstream, config.resolve_timeout()));
        Self::with_resolver(config, rules, resolver)
    }

    pub fn with_resolver(config: TapConfig, rules: &RuleSet, resolver: Arc<dyn Resolver>) -> Self {
        let firewall = Arc::new(
            Firewall::new(rules, Arc::clone(&resolver)).with_resolve_timeout(config.resolve_timeout()),
        );
        let mux = Arc::new(Mux::new(Arc::clone(&firewall)));
        let interceptor = Arc::new(DnsInterceptor::new(Arc::clone(&firewall), resolver));
        let proxy = ConnectionProxy::new(config.mtu);

        Self {
            config,
            firewall,
            mux,
            interceptor,
            proxy,
        }
    }

    pub fn config(&self) -> &TapConfig {
        &self.config
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    pub fn mux(&self) -> &Arc<Mux> {
        &self.mux
    }

    /// The upstream DNS server queries are forwarded to.
    pub fn upstream(&self) -> SocketAddr {
        self.firewall.resolver().upstream()
    }

    /// Registers the standard routes: every TCP flow is proxied, UDP port 53
    /// goes to the DNS interceptor and every other UDP flow is proxied.
    /// Lookups never count against the connection limit.
    pub fn install_default_routes(&self) {
        let proxy = self.proxy.clone();
        self.mux.handle_tcp("*", move |destination, stream| {
            let proxy = proxy.clone();
            async move { proxy.proxy_tcp(destination, stream).await }
        });

        let interceptor = Arc::clone(&self.interceptor);
        let mtu = self.config.mtu;
        self.mux
            .handle_udp_uncounted(":53", move |flow| Arc::clone(&interceptor).serve(flow, mtu));

        let proxy = self.proxy.clone();
        self.mux.handle_udp("*", move |flow| {
            let proxy = proxy.clone();
            async move { proxy.proxy_udp(flow).await }
        });
    }

    /// Binds the configured host-socket frontends and runs them in the
    /// background.
    pub async fn start_frontends(&self) -> Result<Vec<JoinHandle<io::Result<()>>>> {
        let mut tasks = Vec::new();

        if let Some(addr) = self.config.frontend.tcp_listen {
            let listener = RedirectListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP frontend on {}", addr))?;
            tasks.push(tokio::spawn(listener.run(Arc::clone(&self.mux))));
        }

        if let Some(addr) = self.config.frontend.dns_listen {
            let listener = DnsListener::bind(addr, self.upstream(), self.config.mtu)
                .await
                .with_context(|| format!("failed to bind DNS frontend on {}", addr))?;
            tasks.push(tokio::spawn(listener.run(Arc::clone(&self.mux))));
        }

        Ok(tasks)
    }
}

/// Tells the parent process the tap is ready by sending it `SIGUSR1`.
pub fn signal_ready() -> Result<()> {
    let parent = getppid();
    kill(parent, Signal::SIGUSR1)
        .with_context(|| format!("failed to signal readiness to parent {}", parent))?;
    info!("signalled readiness to parent {}", parent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;

    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::dns::testing::StaticResolver;
    use crate::flow::testing::{ChannelFlow, PipeRequest};

    fn a_query(id: u16, name: &str) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id).set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        message.to_vec().unwrap()
    }

    /// Tests the full path: a DNS lookup through the mux admits the resolved
    /// address, a flow to it is proxied, and a flow to an address nothing
    /// resolved to is dropped without an answer.
    #[tokio::test]
    async fn end_to_end_allowlist() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let resolver = Arc::new(StaticResolver::new());
        resolver.set_v4("example.com", &[Ipv4Addr::LOCALHOST]);
        let rules = RuleSet::parse("2\nexample.com\n").unwrap();
        let tap = Tap::with_resolver(
            TapConfig::default(),
            &rules,
            Arc::clone(&resolver) as Arc<dyn Resolver>,
        );
        tap.install_default_routes();
        assert_eq!(tap.firewall().mode(), PolicyMode::Allowlist);

        let client: SocketAddr = "10.1.1.100:40000".parse().unwrap();
        let (dns_flow, mut dns_peer) = ChannelFlow::new(client, tap.upstream());
        tap.mux().notify_udp(dns_flow);
        dns_peer.tx.send(a_query(1, "example.com.")).unwrap();
        let reply = Message::from_vec(&dns_peer.rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.answers().len(), 1);

        let allowed = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), echo_port);
        let (request, mut sandbox) = PipeRequest::new(client, allowed);
        tap.mux().notify_tcp(request);
        let mut stream = sandbox.accepted().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        let unknown: SocketAddr = "127.0.0.9:443".parse().unwrap();
        let (request, mut sandbox) = PipeRequest::new(client, unknown);
        tap.mux().notify_tcp(request);
        assert!(sandbox.accepted().await.is_none());
        assert!(!sandbox.was_rejected());
    }

    /// Tests that a disallowed lookup through the mux yields no addresses
    /// and leaves the denied domain on record.
    #[tokio::test]
    async fn end_to_end_denied_lookup() {
        let resolver = Arc::new(StaticResolver::new());
        resolver.set_v4("tracker.test", &[Ipv4Addr::new(198, 51, 100, 66)]);
        let rules = RuleSet::parse("-1\nexample.com\n").unwrap();
        let tap = Tap::with_resolver(
            TapConfig::default(),
            &rules,
            Arc::clone(&resolver) as Arc<dyn Resolver>,
        );
        tap.install_default_routes();

        let (dns_flow, mut dns_peer) =
            ChannelFlow::new("10.1.1.100:40001".parse().unwrap(), tap.upstream());
        tap.mux().notify_udp(dns_flow);
        dns_peer.tx.send(a_query(2, "tracker.test.")).unwrap();
        let reply = Message::from_vec(&dns_peer.rx.recv().await.unwrap()).unwrap();

        assert!(reply.answers().is_empty());
        assert_eq!(tap.firewall().denied_domains(), vec!["tracker.test.".to_string()]);
        assert!(
            !tap.firewall()
                .allowed_ips()
                .contains(&Ipv4Addr::new(198, 51, 100, 66))
        );
    }

    /// Tests that in counting mode a lookup does not use up the connection
    /// budget: with a limit of one, the flow after a lookup is admitted.
    #[tokio::test]
    async fn lookup_does_not_spend_connection_budget() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let resolver = Arc::new(StaticResolver::new());
        resolver.set_v4("example.com", &[Ipv4Addr::LOCALHOST]);
        let rules = RuleSet::parse("1\n").unwrap();
        let tap = Tap::with_resolver(
            TapConfig::default(),
            &rules,
            Arc::clone(&resolver) as Arc<dyn Resolver>,
        );
        tap.install_default_routes();
        assert_eq!(tap.firewall().mode(), PolicyMode::Counting { max_connections: 1 });

        let client: SocketAddr = "10.1.1.100:40002".parse().unwrap();
        let (dns_flow, mut dns_peer) = ChannelFlow::new(client, tap.upstream());
        tap.mux().notify_udp(dns_flow);
        dns_peer.tx.send(a_query(3, "example.com.")).unwrap();
        let reply = Message::from_vec(&dns_peer.rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(tap.firewall().connections(), 0);

        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), echo_port);
        let (request, mut sandbox) = PipeRequest::new(client, target);
        tap.mux().notify_tcp(request);
        let mut stream = sandbox.accepted().await.unwrap();
        stream.write_all(b"ok").await.unwrap();
        let mut echoed = [0u8; 2];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ok");
        assert_eq!(tap.firewall().connections(), 1);
    }

    #[test]
    fn explicit_upstream_skips_discovery() {
        let config = TapConfig {
            upstream_dns: Some("192.0.2.1:53".parse().unwrap()),
            resolv_conf: "/nonexistent/resolv.conf".into(),
            ..TapConfig::default()
        };
        let tap = Tap::new(config, &RuleSet::unrestricted());
        assert_eq!(tap.upstream(), "192.0.2.1:53".parse().unwrap());
        assert!(tap.firewall().allowed_ips().contains(&Ipv4Addr::new(192, 0, 2, 1)));
    }

    /// Tests that configured frontends are bound and started.
    #[tokio::test]
    async fn starts_configured_frontends() {
        let config = TapConfig {
            upstream_dns: Some("192.0.2.1:53".parse().unwrap()),
            frontend: FrontendConfig {
                tcp_listen: Some("127.0.0.1:0".parse().unwrap()),
                dns_listen: Some("127.0.0.1:0".parse().unwrap()),
            },
            ..TapConfig::default()
        };
        let tap = Tap::new(config, &RuleSet::unrestricted());
        let tasks = tap.start_frontends().await.unwrap();
        assert_eq!(tasks.len(), 2);
        for task in tasks {
            task.abort();
        }
    }
}
