// RustyGossip - Decentralized cluster membership via SWIM
// Core library module

pub mod config;
pub mod error;
pub mod gossip;
pub mod membership;
pub mod metrics;
pub mod rtt;
pub mod scheduler;
pub mod transport;
pub mod wire;

pub use config::MembershipConfig;
pub use error::{GossipError, Result};
pub use membership::{Member, MembershipEngine};
pub use metrics::MembershipMetrics;
pub use rtt::{RttConfig, RttTracker};
pub use scheduler::Scheduler;

/// Crate version, reported by the demo binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
