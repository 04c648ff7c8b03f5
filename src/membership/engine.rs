// SWIM membership engine
//
// The protocol state machine. Processes inbound messages, updates the member
// tables using incarnation-number precedence, schedules probes and answers
// them, and feeds the gossip queue that piggybacks on every outgoing
// datagram.
//
// Reference: "SWIM: Scalable Weakly-consistent Infection-style Process Group
// Membership Protocol" (Das et al., 2002), with the Suspicion and
// Infection-Style Dissemination extensions.
//
// Concurrency: all engine state lives behind one coarse mutex taken by every
// public method. Nothing under the lock blocks; transport sends are
// non-blocking best-effort, and membership callbacks run under the lock and
// must not reenter the engine.

use crate::config::MembershipConfig;
use crate::error::{GossipError, Result};
use crate::gossip::GossipQueue;
use crate::membership::view::MembershipView;
use crate::membership::Member;
use crate::metrics::MembershipMetrics;
use crate::rtt::RttTracker;
use crate::transport::{DatagramHandler, Transport};
use crate::wire::codec;
use crate::wire::{Incarnation, MemberState, Message, NodeAddress};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// The indirect-ping request a proxy probe answers for, kept so the ack can
/// be forwarded to the original requester.
#[derive(Debug, Clone, Copy)]
struct IndirectOrigin {
    source: NodeAddress,
    sequence: u16,
}

/// A direct probe waiting for its ack.
#[derive(Debug, Clone, Copy)]
struct PendingDirectPing {
    sent_at: Instant,
    destination: NodeAddress,
    sequence: u16,

    /// Set when this probe runs on behalf of another node's IndirectPing.
    proxy_for: Option<IndirectOrigin>,
}

/// An indirect probe routed through a helper, waiting for the relayed ack.
#[derive(Debug, Clone, Copy)]
struct PendingIndirectPing {
    sent_at: Instant,
    destination: NodeAddress,
    sequence: u16,
}

struct EngineState {
    incarnation: Incarnation,
    view: MembershipView,
    gossip: GossipQueue,
    sequence: u16,

    /// Probes initiated this protocol period.
    pending_direct: Vec<PendingDirectPing>,

    /// Probes that must survive into the next period: proxy probes answering
    /// an IndirectPing, rotated in at end of period.
    pending_direct_next: Vec<PendingDirectPing>,

    pending_indirect: Vec<PendingIndirectPing>,

    datagram_buf: BytesMut,
    shuffle_scratch: Vec<usize>,
    helper_scratch: Vec<NodeAddress>,
}

/// The membership engine. One instance per node, shared between the
/// scheduler and the inbound transport dispatchers.
pub struct MembershipEngine {
    self_address: NodeAddress,
    config: MembershipConfig,
    unreliable: Arc<dyn Transport>,
    reliable: Arc<dyn Transport>,
    rtt: Arc<RttTracker>,
    metrics: Arc<MembershipMetrics>,
    state: Mutex<EngineState>,
}

impl MembershipEngine {
    /// Build an engine seeded with the deduplicated bootstrap members and a
    /// first Alive rumor about itself, so neighbors adopt the joining node.
    pub fn new(
        config: MembershipConfig,
        unreliable: Arc<dyn Transport>,
        reliable: Arc<dyn Transport>,
        rtt: Arc<RttTracker>,
        metrics: Arc<MembershipMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let self_address = NodeAddress::from_socket_addr(config.advertised_address)
            .map_err(|e| GossipError::Configuration(e.to_string()))?;

        let mut view = MembershipView::new();
        let mut seen = HashSet::new();
        for bootstrap in &config.bootstrap_members {
            let address = NodeAddress::from_socket_addr(*bootstrap)
                .map_err(|e| GossipError::Configuration(e.to_string()))?;
            if address == self_address || !seen.insert(address) {
                continue;
            }
            let member = Member::new(address, MemberState::Alive, Incarnation(0));
            view.insert_member(member);
            if let Some(callback) = &config.member_added {
                callback(&member);
            }
        }

        // At least one transmission per rumor until the first end-of-period
        // recount, even for a cluster that starts out empty.
        let retention = retention_threshold(config.safety_factor, view.member_count()).max(1);
        let mut gossip = GossipQueue::new(retention);
        gossip.add(Message::Alive {
            dst: self_address,
            incarnation: Incarnation(0),
        });

        metrics.members_alive.set(view.member_count() as f64);

        Ok(Self {
            self_address,
            config,
            unreliable,
            reliable,
            rtt,
            metrics,
            state: Mutex::new(EngineState {
                incarnation: Incarnation(0),
                view,
                gossip,
                sequence: 0,
                pending_direct: Vec::new(),
                pending_direct_next: Vec::new(),
                pending_indirect: Vec::new(),
                datagram_buf: BytesMut::new(),
                shuffle_scratch: Vec::new(),
                helper_scratch: Vec::new(),
            }),
        })
    }

    pub fn self_address(&self) -> NodeAddress {
        self.self_address
    }

    pub fn incarnation(&self) -> Incarnation {
        self.state.lock().incarnation
    }

    /// Snapshot of the alive/suspect table.
    pub fn alive_members(&self) -> Vec<Member> {
        self.state.lock().view.members().to_vec()
    }

    /// Snapshot of the faulty table.
    pub fn faulty_members(&self) -> Vec<Member> {
        self.state.lock().view.faulty_members().to_vec()
    }

    /// Run a visitor over every member of both tables under the engine lock.
    /// The visitor must not reenter the engine.
    pub fn visit_members<F>(&self, mut visit: F)
    where
        F: FnMut(&Member),
    {
        let state = self.state.lock();
        for member in state.view.members() {
            visit(member);
        }
        for member in state.view.faulty_members() {
            visit(member);
        }
    }

    /// Rumors currently queued for piggybacking, in queue order.
    pub fn queued_gossip(&self) -> Vec<Message> {
        self.state
            .lock()
            .gossip
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Direct-probe phase: pick up to `direct_ping_member_count` distinct
    /// targets from the randomized sweep and send each a DirectPing with
    /// piggybacked gossip.
    pub fn direct_ping(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let want = self
            .config
            .direct_ping_member_count
            .min(state.view.member_count());
        let mut targets: Vec<NodeAddress> = Vec::with_capacity(want);
        let mut attempts = 0;
        while targets.len() < want && attempts < want + state.view.member_count() {
            attempts += 1;
            match state.view.next_probe_target(&mut rand::rng()) {
                Some(target) if !targets.contains(&target) => targets.push(target),
                Some(_) => {}
                None => break,
            }
        }

        let mut errors = Vec::new();
        for target in targets {
            let sequence = next_sequence(state);
            state.pending_direct.push(PendingDirectPing {
                sent_at: Instant::now(),
                destination: target,
                sequence,
                proxy_for: None,
            });
            let ping = Message::DirectPing {
                src: self.self_address,
                seq: sequence,
            };
            self.metrics.direct_pings_sent.inc();
            if let Err(e) = self.send_with_gossip(state, &target, &ping) {
                errors.push(e);
            }
        }

        GossipError::join(errors).map_or(Ok(()), Err)
    }

    /// Indirect-probe phase: for every still-unanswered direct probe we
    /// initiated ourselves, route the same sequence number through up to
    /// `indirect_ping_member_count` random helpers.
    pub fn indirect_ping(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let unresolved: Vec<(NodeAddress, u16)> = state
            .pending_direct
            .iter()
            .filter(|p| p.proxy_for.is_none())
            .map(|p| (p.destination, p.sequence))
            .collect();

        let mut errors = Vec::new();
        for (destination, sequence) in unresolved {
            state.view.pick_random_members(
                self.config.indirect_ping_member_count,
                Some(&destination),
                &mut state.shuffle_scratch,
                &mut rand::rng(),
                &mut state.helper_scratch,
            );
            let helpers = state.helper_scratch.clone();

            for helper in helpers {
                state.pending_indirect.push(PendingIndirectPing {
                    sent_at: Instant::now(),
                    destination,
                    sequence,
                });
                let ping = Message::IndirectPing {
                    src: self.self_address,
                    dst: destination,
                    seq: sequence,
                };
                self.metrics.indirect_pings_sent.inc();
                if let Err(e) = self.send_with_gossip(state, &helper, &ping) {
                    errors.push(e);
                }
            }
        }

        GossipError::join(errors).map_or(Ok(()), Err)
    }

    /// End-of-period bookkeeping: refresh the gossip retention bound, age
    /// suspects toward Faulty, mark unanswered probes Suspect, and rotate
    /// the pending lists. Members suspected in this period start aging next
    /// period.
    pub fn end_of_protocol_period(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let threshold = retention_threshold(self.config.safety_factor, state.view.member_count());
        state.gossip.set_max_transmission_count(threshold);

        // Age every suspect; promote the ones past the threshold.
        let expired: Vec<NodeAddress> = state
            .view
            .members()
            .iter()
            .filter(|m| m.is_suspect() && m.suspicion_periods + 1 > threshold)
            .map(|m| m.address)
            .collect();
        let suspects: Vec<NodeAddress> = state
            .view
            .members()
            .iter()
            .filter(|m| m.is_suspect())
            .map(|m| m.address)
            .collect();
        for address in &suspects {
            state.view.update(address, |m| m.suspicion_periods += 1);
        }
        for address in &expired {
            if let Some(mut member) = state.view.remove_member(address) {
                tracing::info!(member = %member.address, incarnation = %member.incarnation,
                    "suspicion expired, member faulty");
                member.state = MemberState::Faulty;
                member.suspicion_periods = 0;
                let faulty = Message::Faulty {
                    src: self.self_address,
                    dst: member.address,
                    incarnation: member.incarnation,
                };
                state.gossip.add(faulty);
                state.view.insert_faulty(member);
                if let Some(callback) = &self.config.member_removed {
                    callback(&member);
                }
            }
        }

        // Unanswered probes turn their targets Suspect. This includes proxy
        // probes rotated in from the previous period: their grace period is
        // over.
        let unanswered: Vec<NodeAddress> = state
            .pending_direct
            .iter()
            .map(|p| p.destination)
            .collect();
        for address in unanswered {
            let Some(member) = state.view.find(&address) else {
                continue;
            };
            if !member.is_alive() {
                continue;
            }
            let incarnation = member.incarnation;
            state.view.update(&address, |m| {
                m.state = MemberState::Suspect;
                m.suspicion_periods = 0;
            });
            tracing::debug!(member = %address, incarnation = %incarnation,
                "no ack this period, member suspected");
            state.gossip.add(Message::Suspect {
                src: self.self_address,
                dst: address,
                incarnation,
            });
        }

        state.pending_direct = std::mem::take(&mut state.pending_direct_next);
        state.pending_indirect.clear();

        self.metrics
            .members_alive
            .set(state.view.member_count() as f64);
        self.metrics
            .members_faulty
            .set(state.view.faulty_count() as f64);

        Ok(())
    }

    /// Ask one random live member for its full member list over the
    /// reliable transport.
    pub fn request_list(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.view.pick_random_members(
            1,
            None,
            &mut state.shuffle_scratch,
            &mut rand::rng(),
            &mut state.helper_scratch,
        );
        let Some(target) = state.helper_scratch.first().copied() else {
            return Ok(());
        };

        let request = Message::ListRequest {
            src: self.self_address,
        };
        state.datagram_buf.clear();
        codec::append(&mut state.datagram_buf, &request)?;
        self.reliable
            .send(&target, &state.datagram_buf)
            .map_err(|e| GossipError::Transport(e.to_string()))
    }

    /// Broadcast a Faulty rumor about ourselves to up to
    /// `shutdown_member_count` random members. This is the caller's last
    /// chance to learn the node is leaving, so the error is propagated.
    pub fn shutdown_broadcast(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.view.pick_random_members(
            self.config.shutdown_member_count,
            None,
            &mut state.shuffle_scratch,
            &mut rand::rng(),
            &mut state.helper_scratch,
        );
        let targets = state.helper_scratch.clone();

        let farewell = Message::Faulty {
            src: self.self_address,
            dst: self.self_address,
            incarnation: state.incarnation,
        };

        let mut errors = Vec::new();
        for target in targets {
            if let Err(e) = self.send_with_gossip(state, &target, &farewell) {
                errors.push(e);
            }
        }
        GossipError::join(errors).map_or(Ok(()), Err)
    }

    /// Process one whole inbound datagram: parse and handle records in
    /// order, abandoning the remainder at the first malformed prefix.
    pub fn dispatch_datagram(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.metrics.datagrams_received.inc();

        let mut errors = Vec::new();
        let mut pos = 0;
        while pos < payload.len() {
            match codec::parse(&payload[pos..]) {
                Ok((message, used)) => {
                    pos += used;
                    if let Err(e) = self.handle_message(state, message) {
                        errors.push(e);
                    }
                }
                Err(e) => {
                    self.metrics.decode_failures.inc();
                    tracing::warn!(offset = pos, error = %e,
                        "malformed record, dropping rest of datagram");
                    errors.push(e);
                    break;
                }
            }
        }

        GossipError::join(errors).map_or(Ok(()), Err)
    }

    fn handle_message(&self, state: &mut EngineState, message: Message) -> Result<()> {
        match message {
            Message::DirectPing { src, seq } => {
                let ack = Message::DirectAck {
                    src: self.self_address,
                    seq,
                };
                self.send_with_gossip(state, &src, &ack)
            }
            Message::DirectAck { src, seq } => self.handle_direct_ack(state, src, seq),
            Message::IndirectPing { src, dst, seq } => {
                self.handle_indirect_ping(state, src, dst, seq)
            }
            Message::IndirectAck { src, seq } => self.handle_indirect_ack(state, src, seq),
            Message::Suspect {
                dst, incarnation, ..
            } => self.apply_rumor(state, MemberState::Suspect, dst, incarnation),
            Message::Alive { dst, incarnation } => {
                self.apply_rumor(state, MemberState::Alive, dst, incarnation)
            }
            Message::Faulty {
                dst, incarnation, ..
            } => self.apply_rumor(state, MemberState::Faulty, dst, incarnation),
            Message::ListRequest { src } => self.handle_list_request(state, src),
            Message::ListResponse { members, .. } => {
                let mut errors = Vec::new();
                for member in members {
                    if let Err(e) =
                        self.apply_rumor(state, member.state, member.address, member.incarnation)
                    {
                        errors.push(e);
                    }
                }
                GossipError::join(errors).map_or(Ok(()), Err)
            }
        }
    }

    fn handle_direct_ack(&self, state: &mut EngineState, src: NodeAddress, seq: u16) -> Result<()> {
        self.metrics.acks_received.inc();
        let now = Instant::now();

        let mut resolved = drain_matching(&mut state.pending_direct, &src, seq);
        resolved.extend(drain_matching(&mut state.pending_direct_next, &src, seq));

        let mut errors = Vec::new();
        for pending in resolved {
            self.rtt.add(now.saturating_duration_since(pending.sent_at));
            if let Some(origin) = pending.proxy_for {
                // The forwarded ack speaks for the probed target: the
                // requester matches its pending entries on (target, seq).
                let ack = Message::IndirectAck {
                    src,
                    seq: origin.sequence,
                };
                if let Err(e) = self.send_with_gossip(state, &origin.source, &ack) {
                    errors.push(e);
                }
            }
        }

        // The ack also settles any indirect probes still in flight for the
        // same (sequence, destination).
        state
            .pending_indirect
            .retain(|p| !(p.sequence == seq && p.destination == src));

        GossipError::join(errors).map_or(Ok(()), Err)
    }

    fn handle_indirect_ack(
        &self,
        state: &mut EngineState,
        src: NodeAddress,
        seq: u16,
    ) -> Result<()> {
        self.metrics.acks_received.inc();
        let now = Instant::now();

        // The relayed ack proves the destination alive; the direct probe is
        // settled without an RTT sample of its own.
        drain_matching(&mut state.pending_direct, &src, seq);
        drain_matching(&mut state.pending_direct_next, &src, seq);

        let mut settled = Vec::new();
        state.pending_indirect.retain(|p| {
            if p.sequence == seq && p.destination == src {
                settled.push(p.sent_at);
                false
            } else {
                true
            }
        });
        for sent_at in settled {
            // The indirect path covers two round trips.
            let half = now.saturating_duration_since(sent_at) / 2;
            self.rtt.add(half);
            self.rtt.add(half);
        }

        Ok(())
    }

    /// Probe the target on the requester's behalf with a fresh sequence
    /// number. The pending entry goes to the next-period list so it
    /// outlives the current period, carrying the original request for the
    /// eventual ack forwarding.
    fn handle_indirect_ping(
        &self,
        state: &mut EngineState,
        src: NodeAddress,
        dst: NodeAddress,
        seq: u16,
    ) -> Result<()> {
        let sequence = next_sequence(state);
        state.pending_direct_next.push(PendingDirectPing {
            sent_at: Instant::now(),
            destination: dst,
            sequence,
            proxy_for: Some(IndirectOrigin {
                source: src,
                sequence: seq,
            }),
        });
        let ping = Message::DirectPing {
            src: self.self_address,
            seq: sequence,
        };
        self.metrics.direct_pings_sent.inc();
        self.send_with_gossip(state, &dst, &ping)
    }

    fn handle_list_request(&self, state: &mut EngineState, src: NodeAddress) -> Result<()> {
        let mut members: Vec<_> = state.view.members().iter().map(Member::to_wire).collect();
        members.extend(state.view.faulty_members().iter().map(Member::to_wire));

        let response = Message::ListResponse {
            src: self.self_address,
            members,
        };
        state.datagram_buf.clear();
        codec::append(&mut state.datagram_buf, &response)?;
        self.reliable
            .send(&src, &state.datagram_buf)
            .map_err(|e| GossipError::Transport(e.to_string()))
    }

    /// The incarnation-precedence state machine. Every rumor lands here,
    /// whether it arrived as gossip, as a ListResponse entry, or was
    /// produced locally.
    fn apply_rumor(
        &self,
        state: &mut EngineState,
        rumor_state: MemberState,
        subject: NodeAddress,
        incarnation: Incarnation,
    ) -> Result<()> {
        if subject == self.self_address {
            self.refute_rumor_about_self(state, rumor_state, incarnation);
            return Ok(());
        }
        if state.view.find_faulty(&subject).is_some() {
            self.apply_rumor_about_faulty(state, rumor_state, subject, incarnation);
            return Ok(());
        }
        if state.view.find(&subject).is_some() {
            self.apply_rumor_about_known(state, rumor_state, subject, incarnation);
            return Ok(());
        }
        self.adopt_unknown_member(state, rumor_state, subject, incarnation);
        Ok(())
    }

    /// Any rumor naming us - even an Alive - is a challenge: answer with an
    /// incarnation past both our own and the rumor's, and gossip it.
    fn refute_rumor_about_self(
        &self,
        state: &mut EngineState,
        rumor_state: MemberState,
        incarnation: Incarnation,
    ) {
        if incarnation.precedes(state.incarnation) {
            return;
        }
        state.incarnation = state.incarnation.refute(incarnation);
        self.metrics.refutations.inc();
        tracing::debug!(state = ?rumor_state, rumor_incarnation = %incarnation,
            new_incarnation = %state.incarnation, "refuting rumor about self");
        state.gossip.add(Message::Alive {
            dst: self.self_address,
            incarnation: state.incarnation,
        });
    }

    fn apply_rumor_about_faulty(
        &self,
        state: &mut EngineState,
        rumor_state: MemberState,
        subject: NodeAddress,
        incarnation: Incarnation,
    ) {
        let stored = match state.view.find_faulty(&subject) {
            Some(member) => member.incarnation,
            None => return,
        };

        match rumor_state {
            // A strictly newer Alive or Suspect revives the member.
            MemberState::Alive | MemberState::Suspect => {
                if !stored.precedes(incarnation) {
                    return;
                }
                state.view.remove_faulty(&subject);
                let member = Member::new(subject, rumor_state, incarnation);
                state.view.insert_member(member);
                tracing::info!(member = %subject, incarnation = %incarnation,
                    state = ?rumor_state, "faulty member revived");
                self.regossip(state, rumor_state, subject, incarnation);
                if let Some(callback) = &self.config.member_added {
                    callback(&member);
                }
            }
            MemberState::Faulty => {
                if incarnation.precedes(stored) {
                    return;
                }
                let advanced = stored.precedes(incarnation);
                state.view.update_faulty(&subject, |m| m.incarnation = incarnation);
                if advanced {
                    self.regossip(state, MemberState::Faulty, subject, incarnation);
                }
            }
        }
    }

    fn apply_rumor_about_known(
        &self,
        state: &mut EngineState,
        rumor_state: MemberState,
        subject: NodeAddress,
        incarnation: Incarnation,
    ) {
        let (stored, current_state) = match state.view.find(&subject) {
            Some(member) => (member.incarnation, member.state),
            None => return,
        };
        if incarnation.precedes(stored) {
            return;
        }

        match rumor_state {
            MemberState::Alive => {
                if incarnation == stored && current_state == MemberState::Alive {
                    return;
                }
                state.view.update(&subject, |m| {
                    m.state = MemberState::Alive;
                    m.incarnation = incarnation;
                    m.suspicion_periods = 0;
                });
                self.regossip(state, MemberState::Alive, subject, incarnation);
            }
            MemberState::Suspect => {
                // An equal-incarnation Suspect overrides Alive, never
                // another Suspect.
                if incarnation == stored && current_state == MemberState::Suspect {
                    return;
                }
                state.view.update(&subject, |m| {
                    m.state = MemberState::Suspect;
                    m.incarnation = incarnation;
                    m.suspicion_periods = 0;
                });
                tracing::debug!(member = %subject, incarnation = %incarnation,
                    "member suspected by rumor");
                self.regossip(state, MemberState::Suspect, subject, incarnation);
            }
            MemberState::Faulty => {
                if let Some(mut member) = state.view.remove_member(&subject) {
                    tracing::info!(member = %subject, incarnation = %incarnation,
                        "member declared faulty by rumor");
                    member.state = MemberState::Faulty;
                    member.incarnation = incarnation;
                    member.suspicion_periods = 0;
                    state.view.insert_faulty(member);
                    self.regossip(state, MemberState::Faulty, subject, incarnation);
                    if let Some(callback) = &self.config.member_removed {
                        callback(&member);
                    }
                }
            }
        }
    }

    fn adopt_unknown_member(
        &self,
        state: &mut EngineState,
        rumor_state: MemberState,
        subject: NodeAddress,
        incarnation: Incarnation,
    ) {
        let member = Member::new(subject, rumor_state, incarnation);
        match rumor_state {
            MemberState::Faulty => {
                state.view.insert_faulty(member);
            }
            MemberState::Alive | MemberState::Suspect => {
                state.view.insert_member(member);
                tracing::info!(member = %subject, incarnation = %incarnation,
                    state = ?rumor_state, "new member learned");
                if let Some(callback) = &self.config.member_added {
                    callback(&member);
                }
            }
        }
        self.regossip(state, rumor_state, subject, incarnation);
    }

    /// Re-queue a rumor we accepted, with ourselves as the disseminating
    /// source.
    fn regossip(
        &self,
        state: &mut EngineState,
        rumor_state: MemberState,
        subject: NodeAddress,
        incarnation: Incarnation,
    ) {
        let message = match rumor_state {
            MemberState::Alive => Message::Alive {
                dst: subject,
                incarnation,
            },
            MemberState::Suspect => Message::Suspect {
                src: self.self_address,
                dst: subject,
                incarnation,
            },
            MemberState::Faulty => Message::Faulty {
                src: self.self_address,
                dst: subject,
                incarnation,
            },
        };
        state.gossip.add(message);
    }

    /// Encode the primary message followed by as much gossip as fits under
    /// the datagram limit, prioritized for the recipient, and hand the
    /// datagram to the unreliable transport.
    fn send_with_gossip(
        &self,
        state: &mut EngineState,
        destination: &NodeAddress,
        primary: &Message,
    ) -> Result<()> {
        let limit = self.config.max_datagram_length_send;
        let mut buf = std::mem::take(&mut state.datagram_buf);
        buf.clear();

        let result = (|| {
            codec::append(&mut buf, primary)?;

            state.gossip.prioritize(destination);
            let mut piggybacked = 0;
            for entry in state.gossip.iter() {
                if buf.len() + codec::encoded_len(&entry.message) > limit {
                    break;
                }
                codec::append(&mut buf, &entry.message)?;
                piggybacked += 1;
            }
            state.gossip.mark_transmitted(piggybacked);

            self.metrics.datagrams_sent.inc();
            self.unreliable.send(destination, &buf)
        })();

        state.datagram_buf = buf;
        result
    }
}

impl DatagramHandler for MembershipEngine {
    fn dispatch_datagram(&self, payload: &[u8]) -> Result<()> {
        MembershipEngine::dispatch_datagram(self, payload)
    }
}

/// Dissemination bound: `ceil(safety * log10(n + 1))` transmissions per
/// rumor for an n-member cluster.
fn retention_threshold(safety_factor: f64, member_count: usize) -> u32 {
    (safety_factor * ((member_count + 1) as f64).log10()).ceil() as u32
}

fn next_sequence(state: &mut EngineState) -> u16 {
    state.sequence = state.sequence.wrapping_add(1);
    state.sequence
}

/// Remove and return every pending direct ping matching (sequence,
/// destination).
fn drain_matching(
    pendings: &mut Vec<PendingDirectPing>,
    destination: &NodeAddress,
    sequence: u16,
) -> Vec<PendingDirectPing> {
    let mut matched = Vec::new();
    let mut i = 0;
    while i < pendings.len() {
        if pendings[i].sequence == sequence && pendings[i].destination == *destination {
            matched.push(pendings.remove(i));
        } else {
            i += 1;
        }
    }
    matched
}
