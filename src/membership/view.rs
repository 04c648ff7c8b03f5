// Membership view
//
// Ordered member tables and the randomized probe sweep. The alive/suspect
// table and the faulty table are kept sorted by address and disjoint; the
// engine is the only writer. `random_indexes` is a permutation of the
// alive/suspect table's indexes, consumed one sweep at a time so every
// member is probed once before any member is probed again.

use crate::membership::Member;
use crate::wire::{MemberState, NodeAddress};
use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Default)]
pub struct MembershipView {
    /// Alive and Suspect members, strictly ascending by address.
    members: Vec<Member>,

    /// Faulty members, strictly ascending by address. Never garbage
    /// collected here; eviction policy belongs to the caller.
    faulty: Vec<Member>,

    /// Permutation of `0..members.len()`.
    random_indexes: Vec<usize>,

    /// Sweep position into `random_indexes`, in `[0, members.len()]`.
    next_random_index: usize,
}

impl MembershipView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn faulty_count(&self) -> usize {
        self.faulty.len()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn faulty_members(&self) -> &[Member] {
        &self.faulty
    }

    pub fn find(&self, address: &NodeAddress) -> Option<&Member> {
        self.members
            .binary_search_by(|m| m.address.cmp(address))
            .ok()
            .map(|pos| &self.members[pos])
    }

    pub fn find_faulty(&self, address: &NodeAddress) -> Option<&Member> {
        self.faulty
            .binary_search_by(|m| m.address.cmp(address))
            .ok()
            .map(|pos| &self.faulty[pos])
    }

    /// Mutate a member in place. State and incarnation changes are fine;
    /// the address must not be touched.
    pub fn update<F>(&mut self, address: &NodeAddress, apply: F) -> bool
    where
        F: FnOnce(&mut Member),
    {
        match self.members.binary_search_by(|m| m.address.cmp(address)) {
            Ok(pos) => {
                apply(&mut self.members[pos]);
                true
            }
            Err(_) => false,
        }
    }

    /// Insert into the alive/suspect table, keeping `random_indexes` a
    /// permutation. The new member joins the unswept tail of the current
    /// sweep. Returns false if the address is already present.
    pub fn insert_member(&mut self, member: Member) -> bool {
        debug_assert!(member.state != MemberState::Faulty);
        match self
            .members
            .binary_search_by(|m| m.address.cmp(&member.address))
        {
            Ok(_) => false,
            Err(pos) => {
                self.members.insert(pos, member);
                for index in self.random_indexes.iter_mut() {
                    if *index >= pos {
                        *index += 1;
                    }
                }
                self.random_indexes.push(pos);
                true
            }
        }
    }

    /// Remove from the alive/suspect table, keeping `random_indexes` a
    /// permutation and the sweep position consistent.
    pub fn remove_member(&mut self, address: &NodeAddress) -> Option<Member> {
        let pos = self
            .members
            .binary_search_by(|m| m.address.cmp(address))
            .ok()?;
        let member = self.members.remove(pos);

        if let Some(slot) = self.random_indexes.iter().position(|&i| i == pos) {
            self.random_indexes.remove(slot);
            if slot < self.next_random_index {
                self.next_random_index -= 1;
            }
        }
        for index in self.random_indexes.iter_mut() {
            if *index > pos {
                *index -= 1;
            }
        }

        Some(member)
    }

    /// Insert into the faulty table. Returns false if already present.
    pub fn insert_faulty(&mut self, member: Member) -> bool {
        debug_assert!(member.state == MemberState::Faulty);
        match self
            .faulty
            .binary_search_by(|m| m.address.cmp(&member.address))
        {
            Ok(_) => false,
            Err(pos) => {
                self.faulty.insert(pos, member);
                true
            }
        }
    }

    pub fn remove_faulty(&mut self, address: &NodeAddress) -> Option<Member> {
        let pos = self
            .faulty
            .binary_search_by(|m| m.address.cmp(address))
            .ok()?;
        Some(self.faulty.remove(pos))
    }

    pub fn update_faulty<F>(&mut self, address: &NodeAddress, apply: F) -> bool
    where
        F: FnOnce(&mut Member),
    {
        match self.faulty.binary_search_by(|m| m.address.cmp(address)) {
            Ok(pos) => {
                apply(&mut self.faulty[pos]);
                true
            }
            Err(_) => false,
        }
    }

    /// Next probe target from the randomized sweep. Reshuffles only when
    /// the sweep is exhausted, so within one sweep no member repeats.
    pub fn next_probe_target<R: Rng>(&mut self, rng: &mut R) -> Option<NodeAddress> {
        if self.members.is_empty() {
            return None;
        }
        if self.next_random_index >= self.random_indexes.len() {
            self.random_indexes.shuffle(rng);
            self.next_random_index = 0;
        }
        let index = self.random_indexes[self.next_random_index];
        self.next_random_index += 1;
        Some(self.members[index].address)
    }

    /// Draw up to `count` distinct random member addresses, excluding
    /// `exclude`, via a partial Fisher-Yates over an index scratch buffer.
    pub fn pick_random_members<R: Rng>(
        &self,
        count: usize,
        exclude: Option<&NodeAddress>,
        scratch: &mut Vec<usize>,
        rng: &mut R,
        out: &mut Vec<NodeAddress>,
    ) {
        out.clear();
        scratch.clear();
        scratch.extend(0..self.members.len());

        let mut remaining = scratch.len();
        while out.len() < count && remaining > 0 {
            let pick = rng.random_range(0..remaining);
            let index = scratch[pick];
            scratch.swap(pick, remaining - 1);
            remaining -= 1;

            let address = self.members[index].address;
            if Some(&address) != exclude {
                out.push(address);
            }
        }
    }
}
