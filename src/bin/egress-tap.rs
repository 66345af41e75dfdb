use anyhow::{Context, Result};
use clap::Parser;
use egress_tap::{RuleSet, Tap, TapConfig};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// DNS-gated egress firewall for a sandboxed network namespace.
///
/// Answers the sandbox's DNS queries, admits connections only to literal
/// addresses and to what allowed domains resolve to, and proxies admitted
/// flows to their destinations.
#[derive(Parser, Debug)]
#[command(name = "egress-tap")]
#[command(version, about)]
struct Args {
    /// Firewall rules file. Falls back to the configured rules path when
    /// missing; with no rules file at all, connections are not filtered.
    rules: Option<PathBuf>,

    /// Path to the tap configuration file (YAML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Send SIGUSR1 to the parent process once the tap is ready.
    #[arg(long)]
    notify_parent: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &args.config {
        Some(path) => TapConfig::load(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => TapConfig::default(),
    };

    let rules = match config.rules_source(args.rules.as_deref()) {
        Some(path) => {
            info!("loading firewall rules from {}", path.display());
            RuleSet::load_or_unrestricted(&path)
        }
        None => {
            warn!("no firewall rules file found, connections are not filtered");
            RuleSet::unrestricted()
        }
    };

    let tap = Tap::new(config, &rules);
    tap.install_default_routes();
    let _frontends = tap.start_frontends().await?;

    if args.notify_parent {
        egress_tap::signal_ready()?;
    }
    info!("egress tap ready (policy: {:?})", tap.firewall().mode());

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to wait for SIGINT")?,
        _ = terminate.recv() => {}
    }

    let denied = tap.firewall().denied_domains();
    if denied.is_empty() {
        info!("shutting down, no domains were denied");
    } else {
        info!("shutting down, denied domains: {}", denied.join(", "));
    }

    Ok(())
}
