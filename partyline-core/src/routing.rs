//! Routing table: 256 slots, slot `i` holds the closest known peer to `self_id XOR 2^i`.
//!
//! Slots reference peers by ID; each peer's record and last-seen time are stored once
//! and shared by every slot it occupies.

use std::collections::{HashMap, HashSet};

use crate::identity::NodeId;
use crate::keys::KeyDirectory;
use crate::protocol::PeerRecord;

/// Number of slots: one per bit of the ID space.
pub const TABLE_SIZE: usize = 256;

/// XOR distance between two IDs. Ordered as an unsigned big-endian integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; 32]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Byte-wise XOR of two IDs.
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    Distance(out)
}

/// Ideal slot targets for `id`: `id XOR 2^i` for i in 0..256.
pub fn ideal_targets(id: &NodeId) -> Vec<NodeId> {
    (0..TABLE_SIZE).map(|i| id.flip_bit(i)).collect()
}

#[derive(Debug, Clone)]
struct PeerEntry {
    record: PeerRecord,
    last_seen: u64,
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    ideal: Vec<NodeId>,
    slots: Vec<Option<NodeId>>,
    peers: HashMap<NodeId, PeerEntry>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            ideal: ideal_targets(&self_id),
            slots: vec![None; TABLE_SIZE],
            peers: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn ideal_targets(&self) -> &[NodeId] {
        &self.ideal
    }

    /// Occupant of slot `i`.
    pub fn slot(&self, i: usize) -> Option<&PeerRecord> {
        let id = self.slots.get(i)?.as_ref()?;
        self.peers.get(id).map(|e| &e.record)
    }

    /// Occupant ID per slot.
    pub fn snapshot(&self) -> Vec<Option<NodeId>> {
        self.slots.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn occupied_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn peer(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(id).map(|e| &e.record)
    }

    pub fn last_seen(&self, id: &NodeId) -> Option<u64> {
        self.peers.get(id).map(|e| e.last_seen)
    }

    /// Distinct peers in slot order. Every flood goes through this so a peer
    /// occupying many slots is sent to once.
    pub fn unique_peers(&self) -> Vec<&PeerRecord> {
        let mut sent = HashSet::new();
        self.slots
            .iter()
            .flatten()
            .filter(|id| sent.insert(**id))
            .filter_map(|id| self.peers.get(id).map(|e| &e.record))
            .collect()
    }

    /// Closest occupant to `target`, skipping `exclude`.
    pub fn find_closest(&self, target: &NodeId, exclude: &[NodeId]) -> Option<&PeerRecord> {
        let mut best: Option<(Distance, &NodeId)> = None;
        for id in self.slots.iter().flatten() {
            if exclude.contains(id) {
                continue;
            }
            let d = distance(id, target);
            if best.map_or(true, |(bd, _)| d < bd) {
                best = Some((d, id));
            }
        }
        best.and_then(|(_, id)| self.peer(id))
    }

    /// Ideal targets whose slot `peer` would take: empty slots, or slots whose
    /// occupant is strictly farther from the target.
    pub fn would_improve(&self, peer: &PeerRecord) -> Vec<NodeId> {
        if peer.id == self.self_id {
            return Vec::new();
        }
        self.improvable_slots(&peer.id)
            .into_iter()
            .map(|i| self.ideal[i])
            .collect()
    }

    /// Whether `id` would take the slot whose ideal target is `target`. False for
    /// targets that are not one of this table's ideal targets.
    pub fn improves(&self, id: &NodeId, target: &NodeId) -> bool {
        if *id == self.self_id {
            return false;
        }
        let Some(i) = self.ideal.iter().position(|t| t == target) else {
            return false;
        };
        match &self.slots[i] {
            None => true,
            Some(current) => distance(id, target) < distance(current, target),
        }
    }

    fn improvable_slots(&self, id: &NodeId) -> Vec<usize> {
        (0..TABLE_SIZE)
            .filter(|&i| match &self.slots[i] {
                None => true,
                Some(current) => distance(id, &self.ideal[i]) < distance(current, &self.ideal[i]),
            })
            .collect()
    }

    /// Insert `peer` into every slot it improves and record its key. Returns the
    /// improved ideal targets. Refreshes the stored record and last-seen time of a
    /// peer already in the table.
    pub fn apply(&mut self, peer: PeerRecord, keys: &mut KeyDirectory, now: u64) -> Vec<NodeId> {
        if peer.id == self.self_id {
            tracing::debug!("refusing to insert self into routing table");
            return Vec::new();
        }
        let slots = self.improvable_slots(&peer.id);
        let known = self.peers.contains_key(&peer.id);
        if slots.is_empty() && !known {
            return Vec::new();
        }
        if keys.insert(peer.id, peer.key).is_err() {
            tracing::debug!(peer = %peer.id.short(), "refusing peer with mismatched key");
            return Vec::new();
        }
        for &i in &slots {
            self.slots[i] = Some(peer.id);
        }
        self.peers.insert(
            peer.id,
            PeerEntry {
                record: peer,
                last_seen: now,
            },
        );
        self.prune();
        slots.into_iter().map(|i| self.ideal[i]).collect()
    }

    /// Fill every slot with `peer` (post-bootstrap seeding).
    pub fn seed(&mut self, peer: PeerRecord, now: u64) {
        if peer.id == self.self_id {
            return;
        }
        for slot in self.slots.iter_mut() {
            *slot = Some(peer.id);
        }
        self.peers.clear();
        self.peers.insert(
            peer.id,
            PeerEntry {
                record: peer,
                last_seen: now,
            },
        );
    }

    /// Remove `peer_id` from every slot it holds, refilling each from the rest of
    /// the table where possible. Returns the ideal targets of every vacated slot;
    /// local refills are best guesses and still want an external query.
    pub fn remove_and_repair(&mut self, peer_id: &NodeId) -> Vec<NodeId> {
        let held: Vec<usize> = (0..TABLE_SIZE)
            .filter(|&i| self.slots[i].as_ref() == Some(peer_id))
            .collect();
        let mut targets = Vec::with_capacity(held.len());
        let mut emptied = 0usize;
        for i in held {
            let target = self.ideal[i];
            let replacement = self.find_closest(&target, &[*peer_id]).map(|p| p.id);
            if replacement.is_none() {
                emptied += 1;
            }
            self.slots[i] = replacement;
            targets.push(target);
        }
        self.peers.remove(peer_id);
        if !targets.is_empty() {
            tracing::debug!(
                peer = %peer_id.short(),
                vacated = targets.len(),
                emptied,
                "removed peer from routing table"
            );
        }
        targets
    }

    /// Stamp `last_seen` for a peer. Returns false if the peer is not in the table.
    pub fn touch(&mut self, id: &NodeId, now: u64) -> bool {
        match self.peers.get_mut(id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Empty the slots of peers not seen for more than `max_age`. No refill.
    /// Returns the evicted peer IDs.
    pub fn evict_stale(&mut self, now: u64, max_age: u64) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_seen) > max_age)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            for slot in self.slots.iter_mut() {
                if slot.as_ref() == Some(id) {
                    *slot = None;
                }
            }
            self.peers.remove(id);
        }
        stale
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.peers.clear();
    }

    /// Drop stored records no slot references any more.
    fn prune(&mut self) {
        let live: HashSet<NodeId> = self.slots.iter().flatten().copied().collect();
        self.peers.retain(|id, _| live.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn record(ident: &Identity, port: u16) -> PeerRecord {
        PeerRecord {
            id: ident.id(),
            ip: "127.0.0.1".parse().unwrap(),
            port,
            key: *ident.public_key(),
        }
    }

    #[test]
    fn distance_symmetric_and_zero_on_self() {
        let a = Identity::generate().id();
        let b = Identity::generate().id();
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert_eq!(distance(&a, &a), Distance::ZERO);
        assert!(distance(&a, &b) > Distance::ZERO);
    }

    #[test]
    fn distance_is_numeric_not_bit_count() {
        let zero = NodeId::from_bytes([0u8; 32]);
        let mut high = [0u8; 32];
        high[0] = 0x80;
        let mut many_low = [0u8; 32];
        many_low[0] = 0x7f;
        many_low[31] = 0xff;
        // One set bit up high is farther than many set bits lower down.
        assert!(
            distance(&zero, &NodeId::from_bytes(high))
                > distance(&zero, &NodeId::from_bytes(many_low))
        );
    }

    #[test]
    fn ideal_targets_flip_one_bit() {
        let id = Identity::generate().id();
        let ideal = ideal_targets(&id);
        assert_eq!(ideal.len(), TABLE_SIZE);
        for (i, target) in ideal.iter().enumerate() {
            let d = distance(&id, target);
            let ones: u32 = d.as_bytes().iter().map(|b| b.count_ones()).sum();
            assert_eq!(ones, 1);
            assert_eq!(*target, id.flip_bit(i));
        }
    }

    #[test]
    fn empty_table_improved_everywhere() {
        let me = Identity::generate();
        let peer = Identity::generate();
        let table = RoutingTable::new(me.id());
        assert_eq!(table.would_improve(&record(&peer, 1)).len(), TABLE_SIZE);
        assert!(table.is_empty());
        assert!(table.find_closest(&peer.id(), &[]).is_none());
    }

    #[test]
    fn apply_fills_and_is_idempotent() {
        let me = Identity::generate();
        let peer = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        let predicted = table.would_improve(&record(&peer, 1));
        let improved = table.apply(record(&peer, 1), &mut keys, 5);
        assert_eq!(improved, predicted);
        assert_eq!(table.occupied_slots(), TABLE_SIZE);
        assert!(keys.contains(&peer.id()));
        assert!(table.apply(record(&peer, 1), &mut keys, 6).is_empty());
        assert_eq!(table.last_seen(&peer.id()), Some(6));
    }

    #[test]
    fn apply_never_exceeds_prediction() {
        let me = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        for port in 0..40u16 {
            let peer = record(&Identity::generate(), port);
            let predicted = table.would_improve(&peer);
            let improved = table.apply(peer, &mut keys, 0);
            assert!(improved.len() <= predicted.len());
            assert!(improved.iter().all(|t| predicted.contains(t)));
        }
        // Every slot holds the closest peer ever applied to its target.
        for (i, target) in table.ideal_targets().to_vec().iter().enumerate() {
            let occupant = table.slot(i).unwrap().id;
            let best = table.find_closest(target, &[]).unwrap().id;
            assert_eq!(occupant, best);
        }
    }

    #[test]
    fn improves_tracks_slot_occupant() {
        let me = Identity::generate();
        let a = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        let target = table.ideal_targets()[17];
        assert!(table.improves(&a.id(), &target));
        table.apply(record(&a, 1), &mut keys, 0);
        assert!(!table.improves(&a.id(), &target));
        assert!(!table.improves(&me.id(), &target));
        assert!(!table.improves(&a.id(), &me.id()));
    }

    #[test]
    fn never_inserts_self() {
        let me = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        assert!(table.would_improve(&record(&me, 1)).is_empty());
        assert!(table.apply(record(&me, 1), &mut keys, 0).is_empty());
        table.seed(record(&me, 1), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn apply_rejects_inconsistent_record() {
        let me = Identity::generate();
        let a = Identity::generate();
        let b = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        let mut bad = record(&a, 1);
        bad.key = *b.public_key();
        assert!(table.apply(bad, &mut keys, 0).is_empty());
        assert!(table.is_empty());
        assert!(keys.is_empty());
    }

    #[test]
    fn find_closest_respects_exclusions() {
        let me = Identity::generate();
        let a = Identity::generate();
        let b = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        table.apply(record(&a, 1), &mut keys, 0);
        table.apply(record(&b, 2), &mut keys, 0);
        assert_eq!(table.find_closest(&a.id(), &[]).unwrap().id, a.id());
        assert_eq!(table.find_closest(&a.id(), &[a.id()]).unwrap().id, b.id());
        assert!(table.find_closest(&a.id(), &[a.id(), b.id()]).is_none());
    }

    #[test]
    fn seed_fills_every_slot() {
        let me = Identity::generate();
        let bs = Identity::generate();
        let mut table = RoutingTable::new(me.id());
        table.seed(record(&bs, 9), 0);
        assert_eq!(table.occupied_slots(), TABLE_SIZE);
        assert_eq!(table.unique_peers().len(), 1);
    }

    #[test]
    fn remove_and_repair_refills_from_remaining() {
        let me = Identity::generate();
        let a = Identity::generate();
        let b = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        table.apply(record(&a, 1), &mut keys, 0);
        table.apply(record(&b, 2), &mut keys, 0);
        let held_by_a = table
            .snapshot()
            .iter()
            .filter(|s| **s == Some(a.id()))
            .count();
        let targets = table.remove_and_repair(&a.id());
        assert_eq!(targets.len(), held_by_a);
        assert!(!table.contains(&a.id()));
        assert_eq!(table.occupied_slots(), TABLE_SIZE);
        assert!(table.snapshot().iter().all(|s| *s == Some(b.id())));

        let targets = table.remove_and_repair(&b.id());
        assert_eq!(targets.len(), TABLE_SIZE);
        assert!(table.is_empty());
        assert!(table.remove_and_repair(&b.id()).is_empty());
    }

    #[test]
    fn evict_stale_empties_without_refill() {
        let me = Identity::generate();
        let a = Identity::generate();
        let b = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        table.apply(record(&a, 1), &mut keys, 0);
        table.apply(record(&b, 2), &mut keys, 0);
        assert!(table.touch(&b.id(), 40_000));
        let evicted = table.evict_stale(40_000, 30_000);
        assert_eq!(evicted, vec![a.id()]);
        assert!(!table.contains(&a.id()));
        assert!(table.occupied_slots() < TABLE_SIZE);
        assert!(table.snapshot().iter().flatten().all(|id| *id == b.id()));
    }

    #[test]
    fn unique_peers_dedups() {
        let me = Identity::generate();
        let mut keys = KeyDirectory::new();
        let mut table = RoutingTable::new(me.id());
        for port in 0..10u16 {
            table.apply(record(&Identity::generate(), port), &mut keys, 0);
        }
        let unique = table.unique_peers();
        let ids: HashSet<NodeId> = unique.iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), unique.len());
        let occupants: HashSet<NodeId> = table.snapshot().into_iter().flatten().collect();
        assert_eq!(ids, occupants);
    }
}
