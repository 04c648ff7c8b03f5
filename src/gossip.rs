// Gossip piggyback queue
//
// Rumors waiting to ride along on outgoing datagrams. The queue keeps at
// most one entry per subject member, decided by incarnation precedence, and
// retires entries once they have been transmitted often enough to have
// reached the cluster with high probability.

use crate::wire::{MemberState, Message, NodeAddress};

/// One queued rumor and how many datagrams have carried it so far.
#[derive(Debug, Clone)]
pub struct GossipEntry {
    pub message: Message,
    pub transmit_count: u32,
}

/// Prioritized, de-duplicated piggyback buffer.
///
/// `prioritize` orders entries for one specific recipient: rumors claiming
/// the recipient is Suspect or Faulty go first (the recipient is the one
/// node that can refute them), the recipient's own Alive goes last, and the
/// middle is least-transmitted first.
#[derive(Debug, Clone)]
pub struct GossipQueue {
    entries: Vec<GossipEntry>,
    max_transmit_count: u32,
}

impl GossipQueue {
    pub fn new(max_transmit_count: u32) -> Self {
        Self {
            entries: Vec::new(),
            max_transmit_count,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a rumor. A rumor about an already-queued subject replaces the
    /// existing entry only when it is strictly newer: higher incarnation, or
    /// at equal incarnation a strictly higher state (Alive < Suspect <
    /// Faulty). Replacement restarts the transmission count.
    pub fn add(&mut self, message: Message) {
        let Some(subject) = message.gossip_subject() else {
            self.entries.push(GossipEntry {
                message,
                transmit_count: 0,
            });
            return;
        };

        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.message.gossip_subject() == Some(subject))
        {
            if supersedes(&message, &self.entries[pos].message) {
                self.entries[pos] = GossipEntry {
                    message,
                    transmit_count: 0,
                };
            }
            return;
        }

        self.entries.push(GossipEntry {
            message,
            transmit_count: 0,
        });
    }

    /// Count one transmission against the first `k` entries in the current
    /// prioritized order.
    pub fn mark_transmitted(&mut self, k: usize) {
        for entry in self.entries.iter_mut().take(k) {
            entry.transmit_count += 1;
        }
    }

    /// Set the retention threshold; entries at or above it are purged on the
    /// next `prioritize`.
    pub fn set_max_transmission_count(&mut self, count: u32) {
        self.max_transmit_count = count;
    }

    pub fn max_transmission_count(&self) -> u32 {
        self.max_transmit_count
    }

    /// Reorder the queue for a send toward `target`: purge over-transmitted
    /// entries, float a Suspect/Faulty rumor about the target to the head,
    /// sink the target's own Alive to the tail, and stable-sort the rest by
    /// ascending transmission count.
    pub fn prioritize(&mut self, target: &NodeAddress) {
        self.entries
            .retain(|e| e.transmit_count < self.max_transmit_count);

        // De-duplication guarantees at most one entry per subject.
        let about_target = self
            .entries
            .iter()
            .position(|e| e.message.gossip_subject() == Some(*target))
            .map(|pos| self.entries.remove(pos));

        self.entries
            .sort_by_key(|e| e.transmit_count);

        if let Some(entry) = about_target {
            match entry.message.gossip_state() {
                Some((MemberState::Suspect, _)) | Some((MemberState::Faulty, _)) => {
                    self.entries.insert(0, entry);
                }
                _ => self.entries.push(entry),
            }
        }
    }

    /// Entries in the current prioritized order.
    pub fn iter(&self) -> impl Iterator<Item = &GossipEntry> {
        self.entries.iter()
    }
}

/// Strict rumor precedence: incarnation first, state priority at equal
/// incarnation. Anything not strictly newer loses.
fn supersedes(new: &Message, old: &Message) -> bool {
    let (Some((new_state, new_inc)), Some((old_state, old_inc))) =
        (new.gossip_state(), old.gossip_state())
    else {
        return false;
    };

    if old_inc.precedes(new_inc) {
        return true;
    }
    if new_inc.precedes(old_inc) {
        return false;
    }
    old_state.priority() < new_state.priority()
}
