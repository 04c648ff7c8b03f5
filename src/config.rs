// Membership service configuration
//
// One struct covering the protocol, dissemination and scheduling knobs,
// plus the membership-change callbacks. Validation happens once at engine
// construction.

use crate::error::{GossipError, Result};
use crate::membership::Member;
use crate::rtt::RttConfig;
use crate::wire::codec;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked under the engine lock on membership changes. It must
/// return quickly and must not reenter the engine.
pub type MemberCallback = Arc<dyn Fn(&Member) + Send + Sync>;

#[derive(Clone)]
pub struct MembershipConfig {
    /// Identity broadcast to peers. This is the address other nodes will
    /// probe, so it must be reachable from outside.
    pub advertised_address: SocketAddr,

    /// Local listen address for both transports.
    pub bind_address: SocketAddr,

    /// Initial alive-table seed. Deduplicated; the advertised address is
    /// skipped.
    pub bootstrap_members: Vec<SocketAddr>,

    /// Duration of one full probe cycle.
    pub protocol_period: Duration,

    /// Piggyback truncation threshold. Every cluster member must use the
    /// same value.
    pub max_datagram_length_send: usize,

    /// Multiplier on the per-rumor dissemination count.
    pub safety_factor: f64,

    /// Members probed directly each period.
    pub direct_ping_member_count: usize,

    /// Helpers recruited per unanswered direct probe.
    pub indirect_ping_member_count: usize,

    /// Recipients of the departure broadcast on graceful shutdown.
    pub shutdown_member_count: usize,

    /// Scheduler sleep granularity; bounds shutdown latency.
    pub max_sleep_duration: Duration,

    /// Interval between full member-list refreshes.
    pub list_request_interval: Duration,

    /// RTT tracker settings; the default seeds the direct-ping timeout.
    pub rtt: RttConfig,

    /// Invoked when a member enters the alive/suspect table.
    pub member_added: Option<MemberCallback>,

    /// Invoked when a member leaves the alive/suspect table for the faulty
    /// table.
    pub member_removed: Option<MemberCallback>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            advertised_address: "127.0.0.1:7946".parse().expect("static address"),
            bind_address: "127.0.0.1:7946".parse().expect("static address"),
            bootstrap_members: Vec::new(),
            protocol_period: Duration::from_secs(1),
            max_datagram_length_send: 512,
            safety_factor: 3.0,
            direct_ping_member_count: 1,
            indirect_ping_member_count: 3,
            shutdown_member_count: 8,
            max_sleep_duration: Duration::from_millis(50),
            list_request_interval: Duration::from_secs(30),
            rtt: RttConfig::default(),
            member_added: None,
            member_removed: None,
        }
    }
}

impl fmt::Debug for MembershipConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipConfig")
            .field("advertised_address", &self.advertised_address)
            .field("bind_address", &self.bind_address)
            .field("bootstrap_members", &self.bootstrap_members)
            .field("protocol_period", &self.protocol_period)
            .field("max_datagram_length_send", &self.max_datagram_length_send)
            .field("safety_factor", &self.safety_factor)
            .field("direct_ping_member_count", &self.direct_ping_member_count)
            .field(
                "indirect_ping_member_count",
                &self.indirect_ping_member_count,
            )
            .field("shutdown_member_count", &self.shutdown_member_count)
            .field("max_sleep_duration", &self.max_sleep_duration)
            .field("list_request_interval", &self.list_request_interval)
            .field("rtt", &self.rtt)
            .field("member_added", &self.member_added.is_some())
            .field("member_removed", &self.member_removed.is_some())
            .finish()
    }
}

impl MembershipConfig {
    /// Check everything that would make the engine misbehave. The RTT
    /// bounds are not errors: they are normalized by the tracker per its
    /// documented clamping rules.
    pub fn validate(&self) -> Result<()> {
        if self.advertised_address.port() == 0 {
            return Err(GossipError::Configuration(
                "advertised address needs a concrete port".into(),
            ));
        }
        if self.protocol_period.is_zero() {
            return Err(GossipError::Configuration(
                "protocol period must be positive".into(),
            ));
        }
        if self.max_sleep_duration.is_zero() {
            return Err(GossipError::Configuration(
                "max sleep duration must be positive".into(),
            ));
        }
        if self.list_request_interval.is_zero() {
            return Err(GossipError::Configuration(
                "list request interval must be positive".into(),
            ));
        }
        if self.direct_ping_member_count == 0 {
            return Err(GossipError::Configuration(
                "direct ping member count must be at least 1".into(),
            ));
        }
        if self.indirect_ping_member_count == 0 {
            return Err(GossipError::Configuration(
                "indirect ping member count must be at least 1".into(),
            ));
        }
        if self.safety_factor <= 0.0 || !self.safety_factor.is_finite() {
            return Err(GossipError::Configuration(
                "safety factor must be a positive finite number".into(),
            ));
        }
        // Room for one probe record plus at least one piggybacked rumor.
        let min_datagram = 2 * codec::MAX_PROBE_RECORD_LEN;
        if self.max_datagram_length_send < min_datagram {
            return Err(GossipError::Configuration(format!(
                "max datagram length {} is below the minimum of {}",
                self.max_datagram_length_send, min_datagram
            )));
        }
        if self.rtt.sample_count == 0 {
            return Err(GossipError::Configuration(
                "rtt sample count must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rtt.percentile) {
            return Err(GossipError::Configuration(
                "rtt percentile must be within [0, 1]".into(),
            ));
        }
        if !(self.rtt.smoothing_factor > 0.0 && self.rtt.smoothing_factor <= 1.0) {
            return Err(GossipError::Configuration(
                "rtt smoothing factor must be within (0, 1]".into(),
            ));
        }
        Ok(())
    }
}
