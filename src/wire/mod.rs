// Wire-level protocol types
//
// This module defines the data model shared by the codec and the membership
// engine: normalized node addresses, wrap-aware incarnation numbers, member
// states and the closed set of protocol messages.
//
// The message set is a tagged union with exhaustive dispatch; the gossip
// queue and the engine store these values directly.

use crate::error::{GossipError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

pub mod codec;

/// Network identity of a cluster member.
///
/// The IP is always normalized to its 16-byte IPv6 form (IPv4 addresses are
/// stored as IPv4-mapped IPv6). Equality is bitwise over (ip, port), and the
/// ordering is lexicographic over the IP octets then the port, which keeps
/// the member tables binary-searchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    ip: Ipv6Addr,
    port: u16,
}

impl NodeAddress {
    /// Encoded size on the wire: 16 IP bytes + 2 port bytes.
    pub const WIRE_LEN: usize = 18;

    /// Create a normalized address. Port 0 is rejected.
    pub fn new(ip: IpAddr, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(GossipError::Encode("address port must be non-zero".into()));
        }
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Ok(Self { ip, port })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self> {
        Self::new(addr.ip(), addr.port())
    }

    pub fn ip(&self) -> Ipv6Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Socket form for the transports; IPv4-mapped addresses come back out
    /// as plain IPv4 so the OS picks the right socket family.
    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(self.ip), self.port),
        }
    }
}

impl Ord for NodeAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ip
            .octets()
            .cmp(&other.ip.octets())
            .then(self.port.cmp(&other.port))
    }
}

impl PartialOrd for NodeAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Per-node generation number used to order rumors about that node.
///
/// Comparison is wrap-aware over the u16 half-space so long-running clusters
/// can roll the counter over indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Incarnation(pub u16);

impl Incarnation {
    /// Strict wrap-aware less-than: `self` precedes `rhs` iff
    /// `0 < (rhs - self) mod 2^16 < 2^15`.
    pub fn precedes(self, rhs: Incarnation) -> bool {
        let diff = rhs.0.wrapping_sub(self.0);
        diff != 0 && diff < 0x8000
    }

    pub fn next(self) -> Incarnation {
        Incarnation(self.0.wrapping_add(1))
    }

    /// The incarnation a node adopts to refute a rumor about itself:
    /// one past both its own value and the rumor's value.
    pub fn refute(self, rumor: Incarnation) -> Incarnation {
        let own = self.next();
        let challenged = rumor.next();
        if own.precedes(challenged) {
            challenged
        } else {
            own
        }
    }
}

impl fmt::Display for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Member state as seen by the local failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    /// Member is alive and responding to probes.
    Alive,

    /// Member missed a probe and is suspected of failure.
    Suspect,

    /// Member is considered failed.
    Faulty,
}

impl MemberState {
    pub fn as_u8(self) -> u8 {
        match self {
            MemberState::Alive => 0,
            MemberState::Suspect => 1,
            MemberState::Faulty => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MemberState::Alive),
            1 => Ok(MemberState::Suspect),
            2 => Ok(MemberState::Faulty),
            other => Err(GossipError::Decode(format!(
                "invalid member state byte: {}",
                other
            ))),
        }
    }

    /// Dissemination priority at equal incarnation: Alive < Suspect < Faulty.
    pub fn priority(self) -> u8 {
        self.as_u8()
    }
}

/// Message type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    DirectPing = 1,
    DirectAck = 2,
    IndirectPing = 3,
    IndirectAck = 4,
    Suspect = 5,
    Alive = 6,
    Faulty = 7,
    ListRequest = 8,
    ListResponse = 9,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::DirectPing),
            2 => Ok(MessageType::DirectAck),
            3 => Ok(MessageType::IndirectPing),
            4 => Ok(MessageType::IndirectAck),
            5 => Ok(MessageType::Suspect),
            6 => Ok(MessageType::Alive),
            7 => Ok(MessageType::Faulty),
            8 => Ok(MessageType::ListRequest),
            9 => Ok(MessageType::ListResponse),
            other => Err(GossipError::Decode(format!(
                "unknown message type tag: {}",
                other
            ))),
        }
    }
}

/// A member record as carried inside a ListResponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMember {
    pub address: NodeAddress,
    pub state: MemberState,
    pub incarnation: Incarnation,
}

impl WireMember {
    /// Encoded size: address (18) + state (1) + incarnation (2).
    pub const WIRE_LEN: usize = NodeAddress::WIRE_LEN + 3;
}

/// Protocol messages.
///
/// A datagram is a plain concatenation of encoded messages with no length
/// prefix; the first message is the primary and the rest is piggybacked
/// gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Probe sent straight to the target.
    DirectPing { src: NodeAddress, seq: u16 },

    /// Answer to a direct ping, echoing its sequence number.
    DirectAck { src: NodeAddress, seq: u16 },

    /// Ask `dst` to be probed on our behalf by the recipient.
    IndirectPing {
        src: NodeAddress,
        dst: NodeAddress,
        seq: u16,
    },

    /// Relayed acknowledgement completing an indirect probe.
    IndirectAck { src: NodeAddress, seq: u16 },

    /// Rumor: `src` suspects `dst` at the given incarnation.
    Suspect {
        src: NodeAddress,
        dst: NodeAddress,
        incarnation: Incarnation,
    },

    /// Rumor: `dst` is alive at the given incarnation.
    Alive {
        dst: NodeAddress,
        incarnation: Incarnation,
    },

    /// Rumor: `src` declares `dst` faulty at the given incarnation.
    Faulty {
        src: NodeAddress,
        dst: NodeAddress,
        incarnation: Incarnation,
    },

    /// Ask the recipient for its full member list.
    ListRequest { src: NodeAddress },

    /// Full member list, sent over the reliable transport.
    ListResponse {
        src: NodeAddress,
        members: Vec<WireMember>,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::DirectPing { .. } => MessageType::DirectPing,
            Message::DirectAck { .. } => MessageType::DirectAck,
            Message::IndirectPing { .. } => MessageType::IndirectPing,
            Message::IndirectAck { .. } => MessageType::IndirectAck,
            Message::Suspect { .. } => MessageType::Suspect,
            Message::Alive { .. } => MessageType::Alive,
            Message::Faulty { .. } => MessageType::Faulty,
            Message::ListRequest { .. } => MessageType::ListRequest,
            Message::ListResponse { .. } => MessageType::ListResponse,
        }
    }

    /// The member a rumor is about. Only rumors enter the gossip queue, so
    /// this doubles as the queue's deduplication key.
    pub fn gossip_subject(&self) -> Option<NodeAddress> {
        match self {
            Message::Suspect { dst, .. }
            | Message::Alive { dst, .. }
            | Message::Faulty { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    /// State and incarnation carried by a rumor, for precedence decisions.
    pub fn gossip_state(&self) -> Option<(MemberState, Incarnation)> {
        match self {
            Message::Suspect { incarnation, .. } => Some((MemberState::Suspect, *incarnation)),
            Message::Alive { incarnation, .. } => Some((MemberState::Alive, *incarnation)),
            Message::Faulty { incarnation, .. } => Some((MemberState::Faulty, *incarnation)),
            _ => None,
        }
    }
}
