// Cluster membership
//
// This module holds the SWIM membership state and the engine that drives it:
// - Member: one tracked peer with its state and incarnation
// - MembershipView: ordered member tables and the probe-fairness sweep
// - MembershipEngine: the protocol state machine (probes, rumors, pending
//   ping bookkeeping, list synchronization)

use crate::wire::{Incarnation, MemberState, NodeAddress, WireMember};
use serde::{Deserialize, Serialize};

pub mod engine;
pub mod view;

pub use engine::MembershipEngine;
pub use view::MembershipView;

/// One tracked cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Network identity; the tables are ordered by this.
    pub address: NodeAddress,

    /// Current state as seen by the local failure detector.
    pub state: MemberState,

    /// Newest incarnation observed for this member.
    pub incarnation: Incarnation,

    /// End-of-period count since the transition to Suspect. Local-only,
    /// never serialized.
    #[serde(skip)]
    pub suspicion_periods: u32,
}

impl Member {
    pub fn new(address: NodeAddress, state: MemberState, incarnation: Incarnation) -> Self {
        Self {
            address,
            state,
            incarnation,
            suspicion_periods: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == MemberState::Alive
    }

    pub fn is_suspect(&self) -> bool {
        self.state == MemberState::Suspect
    }

    pub fn to_wire(&self) -> WireMember {
        WireMember {
            address: self.address,
            state: self.state,
            incarnation: self.incarnation,
        }
    }
}
