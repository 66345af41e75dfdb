//! Egress policy: the rules source and the engine that enforces it.

mod engine;
mod rules;

pub use engine::{
    DEFAULT_RESOLVE_TIMEOUT, Firewall, LOOPBACK_REDIRECT, LOOPBACK_REDIRECT_NAME, PolicyMode,
};
pub use rules::{Rule, RuleSet, RulesError, fqdn};
