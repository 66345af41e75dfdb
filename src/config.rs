use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),
    #[error("gateway {gateway} is outside subnet {subnet}")]
    GatewayOutsideSubnet { gateway: Ipv4Addr, subnet: String },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Default path of the line-oriented firewall rules file.
pub const DEFAULT_RULES_PATH: &str = "/tmp/firewall.rules";

/// Default system resolver configuration.
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Host-socket adapters that feed intercepted flows into the multiplexer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrontendConfig {
    /// Listener receiving netfilter-redirected TCP connections.
    #[serde(default)]
    pub tcp_listen: Option<SocketAddr>,
    /// UDP socket receiving redirected DNS queries.
    #[serde(default)]
    pub dns_listen: Option<SocketAddr>,
}

/// Immutable setup configuration, built once before the tap starts.
///
/// The device/address fields are consumed by the namespace setup layer;
/// the tap itself only uses the resolver settings, the rules path, the MTU
/// and the frontend addresses. The DNS frontend reports the upstream DNS
/// server as its flows' destination, not the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TapConfig {
    /// TUN device name.
    #[serde(default = "default_tun")]
    pub tun: String,

    /// Address and prefix assigned to the TUN device.
    #[serde(default = "default_subnet")]
    pub subnet: String,

    /// Gateway address inside the namespace.
    #[serde(default = "default_gateway")]
    pub gateway: Ipv4Addr,

    /// Numeric uid the sandboxed process runs as.
    #[serde(default)]
    pub uid: Option<u32>,

    /// Numeric gid the sandboxed process runs as.
    #[serde(default)]
    pub gid: Option<u32>,

    #[serde(default = "default_http_ports")]
    pub http_ports: Vec<u16>,

    #[serde(default = "default_https_ports")]
    pub https_ports: Vec<u16>,

    /// Path of the firewall rules file.
    #[serde(default = "default_rules")]
    pub rules: PathBuf,

    /// Resolver configuration used to discover the upstream DNS server.
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,

    /// Explicit upstream DNS server; skips resolv.conf discovery.
    #[serde(default)]
    pub upstream_dns: Option<SocketAddr>,

    /// Upstream used when discovery fails.
    #[serde(default = "default_fallback_dns")]
    pub fallback_dns: SocketAddr,

    /// Bound on each individual DNS resolution, in milliseconds.
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,

    /// Receive buffer size for intercepted datagrams.
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    #[serde(default)]
    pub frontend: FrontendConfig,
}

fn default_tun() -> String {
    "mini-tun0".to_string()
}

fn default_subnet() -> String {
    "10.1.1.100/24".to_string()
}

fn default_gateway() -> Ipv4Addr {
    Ipv4Addr::new(10, 1, 1, 1)
}

fn default_http_ports() -> Vec<u16> {
    vec![80]
}

fn default_https_ports() -> Vec<u16> {
    vec![443]
}

fn default_rules() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_PATH)
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from(DEFAULT_RESOLV_CONF)
}

fn default_fallback_dns() -> SocketAddr {
    SocketAddr::from(([8, 8, 8, 8], 53))
}

fn default_resolve_timeout_ms() -> u64 {
    5000
}

fn default_mtu() -> usize {
    1500
}

impl TapConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the parsed TUN subnet.
    pub fn subnet_network(&self) -> Result<Ipv4Network, ConfigError> {
        self.subnet
            .parse::<Ipv4Network>()
            .map_err(|_| ConfigError::InvalidSubnet(self.subnet.clone()))
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Picks the rules file: `explicit` if it names an existing file, else
    /// the configured path if that exists, else none.
    pub fn rules_source(&self, explicit: Option<&Path>) -> Option<PathBuf> {
        explicit
            .filter(|path| path.is_file())
            .or_else(|| Some(self.rules.as_path()).filter(|path| path.is_file()))
            .map(Path::to_path_buf)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tun.is_empty() || self.tun.chars().any(|c| c.is_whitespace()) {
            return Err(ConfigError::Invalid(format!(
                "tun device name {:?}",
                self.tun
            )));
        }

        let network = self.subnet_network()?;
        if !network.contains(self.gateway) {
            return Err(ConfigError::GatewayOutsideSubnet {
                gateway: self.gateway,
                subnet: self.subnet.clone(),
            });
        }

        if self.resolve_timeout_ms == 0 {
            return Err(ConfigError::Invalid("resolve_timeout_ms must be > 0".into()));
        }

        // Plain DNS over UDP must fit 512-byte messages.
        if self.mtu < 512 {
            return Err(ConfigError::Invalid(format!("mtu {} is below 512", self.mtu)));
        }

        Ok(())
    }
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            tun: default_tun(),
            subnet: default_subnet(),
            gateway: default_gateway(),
            uid: None,
            gid: None,
            http_ports: default_http_ports(),
            https_ports: default_https_ports(),
            rules: default_rules(),
            resolv_conf: default_resolv_conf(),
            upstream_dns: None,
            fallback_dns: default_fallback_dns(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            mtu: default_mtu(),
            frontend: FrontendConfig::default(),
        }
    }
}
