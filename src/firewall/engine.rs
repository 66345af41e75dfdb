use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::rules::{Rule, RuleSet, fqdn};
use crate::dns::Resolver;

/// Address that stands for the host's own loopback interface inside the
/// sandbox. Flows to it are proxied to `127.0.0.1`.
pub const LOOPBACK_REDIRECT: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

/// Name that always resolves to [`LOOPBACK_REDIRECT`].
pub const LOOPBACK_REDIRECT_NAME: &str = "host.sandbox.internal.";

/// Default bound on each slow-path re-resolution.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Admission mode, derived from whether any rules were configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// No rules: admit up to `max_connections` flows (negative = unlimited).
    Counting { max_connections: i64 },
    /// Admit only destinations in the allowed set.
    Allowlist,
}

/// Mutable policy state. Everything here is guarded by one mutex.
#[derive(Debug, Default)]
struct FirewallState {
    /// Tracked domain -> addresses it most recently resolved to.
    bindings: HashMap<String, HashSet<Ipv4Addr>>,
    /// Literal rules plus the upstream resolver and loopback redirect.
    static_ips: HashSet<Ipv4Addr>,
    /// Domain-derived addresses, counted per binding that holds them.
    bound_ips: HashMap<Ipv4Addr, usize>,
    /// Names the sandbox asked for that are not on the allowlist.
    denied_domains: Vec<String>,
    /// Flows admitted in counting mode.
    connections: u64,
}

impl FirewallState {
    fn is_allowed(&self, ip: Ipv4Addr) -> bool {
        self.static_ips.contains(&ip) || self.bound_ips.contains_key(&ip)
    }

    fn release(&mut self, ip: Ipv4Addr) {
        if let Some(count) = self.bound_ips.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                self.bound_ips.remove(&ip);
            }
        }
    }

    fn retain(&mut self, ip: Ipv4Addr) {
        *self.bound_ips.entry(ip).or_insert(0) += 1;
    }
}

/// Egress policy engine.
///
/// Gates both DNS answers ([`Firewall::allow_domain_query`]) and flow
/// admission ([`Firewall::allow`]). Resolution results flow back in through
/// [`Firewall::bind`], which atomically replaces a domain's address set.
pub struct Firewall {
    mode: PolicyMode,
    state: Mutex<FirewallState>,
    resolver: Arc<dyn Resolver>,
    resolve_timeout: Duration,
}

impl std::fmt::Debug for Firewall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firewall")
            .field("mode", &self.mode)
            .field("state", &"<Mutex>")
            .field("resolve_timeout", &self.resolve_timeout)
            .finish()
    }
}

impl Firewall {
    /// Builds the engine from loaded rules.
    ///
    /// The resolver's upstream (if IPv4) and [`LOOPBACK_REDIRECT`] are
    /// always allowed.
    pub fn new(rules: &RuleSet, resolver: Arc<dyn Resolver>) -> Self {
        let mode = if rules.is_empty() {
            PolicyMode::Counting {
                max_connections: rules.max_connections,
            }
        } else {
            PolicyMode::Allowlist
        };

        let mut state = FirewallState::default();
        for rule in &rules.rules {
            match rule {
                Rule::Ip(ip) => {
                    state.static_ips.insert(*ip);
                }
                Rule::Domain(name) => {
                    state.bindings.insert(name.clone(), HashSet::new());
                }
            }
        }

        if let Some(upstream) = ipv4_of(resolver.upstream().ip()) {
            state.static_ips.insert(upstream);
        }
        state.static_ips.insert(LOOPBACK_REDIRECT);

        info!(
            "firewall initialized: mode={:?}, {} literal addresses, {} domains",
            mode,
            state.static_ips.len(),
            state.bindings.len()
        );

        Self {
            mode,
            state: Mutex::new(state),
            resolver,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    /// Overrides the per-domain bound used by the slow path.
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    fn lock(&self) -> MutexGuard<'_, FirewallState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decides whether a flow to `destination` may be established.
    ///
    /// In allowlist mode an unknown address triggers re-resolution of every
    /// tracked domain (each bounded by the resolve timeout) before the
    /// final check, so rotated addresses are picked up without an explicit
    /// invalidation.
    pub async fn allow(&self, destination: IpAddr) -> bool {
        if let PolicyMode::Counting { max_connections } = self.mode {
            return self.admit_counted(max_connections);
        }
        self.allow_listed(destination).await
    }

    /// Like [`Firewall::allow`], but never consumes a counting-mode
    /// admission. Used for DNS flows, which the connection cap does not
    /// bound.
    pub async fn allow_uncounted(&self, destination: IpAddr) -> bool {
        match self.mode {
            PolicyMode::Counting { .. } => true,
            PolicyMode::Allowlist => self.allow_listed(destination).await,
        }
    }

    async fn allow_listed(&self, destination: IpAddr) -> bool {
        let Some(ip) = ipv4_of(destination) else {
            debug!("denying non-IPv4 destination {}", destination);
            return false;
        };

        if self.lock().is_allowed(ip) {
            debug!("{} allowed (fast path)", ip);
            return true;
        }

        self.refresh_bindings().await;

        let allowed = self.lock().is_allowed(ip);
        if allowed {
            debug!("{} allowed after re-resolving tracked domains", ip);
        } else {
            debug!("{} denied", ip);
        }
        allowed
    }

    fn admit_counted(&self, max_connections: i64) -> bool {
        if max_connections < 0 {
            return true;
        }
        let mut state = self.lock();
        if state.connections < max_connections as u64 {
            state.connections += 1;
            debug!(
                "connection {} of {} admitted",
                state.connections, max_connections
            );
            true
        } else {
            debug!("connection limit of {} reached", max_connections);
            false
        }
    }

    /// Re-resolves every tracked domain and rebinds the ones that answered.
    /// No lock is held while resolving.
    async fn refresh_bindings(&self) {
        let domains: Vec<String> = self.lock().bindings.keys().cloned().collect();
        if domains.is_empty() {
            return;
        }

        debug!("re-resolving {} tracked domains", domains.len());

        for domain in domains {
            match tokio::time::timeout(self.resolve_timeout, self.resolver.lookup_ipv4(&domain))
                .await
            {
                Ok(Ok(ips)) => {
                    let ips: Vec<IpAddr> = ips.into_iter().map(IpAddr::V4).collect();
                    self.bind(&domain, &ips);
                }
                Ok(Err(e)) => debug!("re-resolving {} failed: {}", domain, e),
                Err(_) => warn!(
                    "re-resolving {} timed out after {:?}",
                    domain, self.resolve_timeout
                ),
            }
        }
    }

    /// Whether the sandbox may learn addresses for `name` at all.
    pub fn allow_domain_query(&self, name: &str) -> bool {
        match self.mode {
            PolicyMode::Counting { .. } => true,
            PolicyMode::Allowlist => self.lock().bindings.contains_key(&fqdn(name)),
        }
    }

    /// Records a successful resolution of `domain`.
    ///
    /// For a tracked domain the previous address set is replaced, not
    /// merged: stale addresses stop being allowed in the same critical
    /// section that admits the new ones. Untracked domains are recorded as
    /// denied and leave the allowed set untouched.
    pub fn bind(&self, domain: &str, addresses: &[IpAddr]) {
        let domain = fqdn(domain);
        let new_ips: HashSet<Ipv4Addr> = addresses.iter().filter_map(|ip| ipv4_of(*ip)).collect();

        let mut state = self.lock();
        let Some(old_ips) = state.bindings.remove(&domain) else {
            debug!("{} is not on the allowlist, recording as denied", domain);
            state.denied_domains.push(domain);
            return;
        };

        for ip in &old_ips {
            state.release(*ip);
        }
        for ip in &new_ips {
            state.retain(*ip);
        }
        debug!("bound {} to {:?} (was {:?})", domain, new_ips, old_ips);
        state.bindings.insert(domain, new_ips);
    }

    /// Domains the sandbox tried to resolve that are not on the allowlist.
    pub fn denied_domains(&self) -> Vec<String> {
        self.lock().denied_domains.clone()
    }

    /// Snapshot of every currently allowed address.
    pub fn allowed_ips(&self) -> HashSet<Ipv4Addr> {
        let state = self.lock();
        state
            .static_ips
            .iter()
            .chain(state.bound_ips.keys())
            .copied()
            .collect()
    }

    /// Addresses currently bound to `domain`, if it is tracked.
    pub fn binding(&self, domain: &str) -> Option<HashSet<Ipv4Addr>> {
        self.lock().bindings.get(&fqdn(domain)).cloned()
    }

    /// Flows admitted so far in counting mode.
    pub fn connections(&self) -> u64 {
        self.lock().connections
    }
}

fn ipv4_of(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
