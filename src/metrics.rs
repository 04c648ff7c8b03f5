// Metrics collection
//
// Hand-rolled counters and gauges behind cheap locks, grouped into one
// injected collector. No process-wide registry: the owner creates the
// collector, hands an Arc to the engine, and exposes or scrapes it however
// it likes.

use parking_lot::RwLock;
use std::sync::Arc;

/// Monotonically increasing value.
#[derive(Debug, Clone)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: Arc<RwLock<f64>>,
}

impl Counter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn inc(&self) {
        *self.value.write() += 1.0;
    }

    pub fn inc_by(&self, value: f64) {
        if value >= 0.0 {
            *self.value.write() += value;
        }
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }
}

/// Value that can go up and down.
#[derive(Debug, Clone)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: Arc<RwLock<f64>>,
}

impl Gauge {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: Arc::new(RwLock::new(0.0)),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.write() = value;
    }

    pub fn get(&self) -> f64 {
        *self.value.read()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }
}

/// All metrics the membership service exposes.
#[derive(Debug, Clone)]
pub struct MembershipMetrics {
    pub datagrams_sent: Counter,
    pub datagrams_received: Counter,
    pub decode_failures: Counter,
    pub direct_pings_sent: Counter,
    pub indirect_pings_sent: Counter,
    pub acks_received: Counter,
    pub refutations: Counter,
    pub members_alive: Gauge,
    pub members_faulty: Gauge,
}

impl MembershipMetrics {
    pub fn new() -> Self {
        Self {
            datagrams_sent: Counter::new(
                "membership_datagrams_sent_total",
                "Datagrams handed to the unreliable transport",
            ),
            datagrams_received: Counter::new(
                "membership_datagrams_received_total",
                "Whole datagrams received from the transports",
            ),
            decode_failures: Counter::new(
                "membership_decode_failures_total",
                "Datagrams dropped because of a malformed record",
            ),
            direct_pings_sent: Counter::new(
                "membership_direct_pings_sent_total",
                "Direct probes sent, including proxy probes",
            ),
            indirect_pings_sent: Counter::new(
                "membership_indirect_pings_sent_total",
                "Indirect probe requests routed through helpers",
            ),
            acks_received: Counter::new(
                "membership_acks_received_total",
                "Direct and indirect acks received",
            ),
            refutations: Counter::new(
                "membership_refutations_total",
                "Rumors about this node answered with a newer incarnation",
            ),
            members_alive: Gauge::new(
                "membership_members_alive",
                "Members currently in the alive/suspect table",
            ),
            members_faulty: Gauge::new(
                "membership_members_faulty",
                "Members currently in the faulty table",
            ),
        }
    }
}

impl Default for MembershipMetrics {
    fn default() -> Self {
        Self::new()
    }
}
