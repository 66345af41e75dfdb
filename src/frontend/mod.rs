//! Host-socket adapters that feed intercepted flows into the [`Mux`].
//!
//! [`Mux`]: crate::mux::Mux

mod tcp;
mod udp;

pub use tcp::{RedirectListener, UNANSWERED_HOLD};
pub use udp::{DnsListener, FLOW_IDLE_TIMEOUT};
