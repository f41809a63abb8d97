//! Chat log (bounded, oldest evicted) and per-sender duplicate suppression.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::identity::{self, NodeId, PublicKey, Signature};

/// Default number of chat entries retained.
pub const DEFAULT_CHAT_CAPACITY: usize = 512;

/// Signed payload kept for an entry accepted before its sender's key was known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingProof {
    pub payload_json: String,
    pub signature: Signature,
}

/// One displayed chat line, public or private.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub sender: NodeId,
    /// Recipient for private messages; `None` for public chat.
    pub target: Option<NodeId>,
    pub ts: u64,
    pub content: String,
    pub verified: bool,
    pub secure: bool,
    pub received_at: u64,
    pub(crate) proof: Option<PendingProof>,
}

impl ChatEntry {
    /// Verified public chat line.
    pub fn public(sender: NodeId, ts: u64, content: String, received_at: u64) -> Self {
        Self {
            sender,
            target: None,
            ts,
            content,
            verified: true,
            secure: false,
            received_at,
            proof: None,
        }
    }

    /// Public chat line from a sender whose key is not known yet.
    pub(crate) fn unverified(
        sender: NodeId,
        ts: u64,
        content: String,
        received_at: u64,
        proof: PendingProof,
    ) -> Self {
        Self {
            verified: false,
            proof: Some(proof),
            ..Self::public(sender, ts, content, received_at)
        }
    }

    /// Decrypted private message line.
    pub fn private(
        sender: NodeId,
        target: NodeId,
        ts: u64,
        content: String,
        received_at: u64,
    ) -> Self {
        Self {
            target: Some(target),
            secure: true,
            ..Self::public(sender, ts, content, received_at)
        }
    }
}

/// Fixed-capacity circular chat log.
#[derive(Debug)]
pub struct ChatLog {
    entries: VecDeque<ChatEntry>,
    capacity: usize,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&mut self, entry: ChatEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&ChatEntry> {
        self.entries.back()
    }

    /// Re-check unverified entries from `sender` now that its key is known.
    /// Entries that verify are marked verified; entries that fail are dropped.
    /// Returns the number verified and the timestamps of the dropped entries.
    pub fn reverify(&mut self, sender: &NodeId, key: &PublicKey) -> (usize, Vec<u64>) {
        let mut verified = 0;
        let mut dropped = Vec::new();
        self.entries.retain_mut(|entry| {
            if entry.sender != *sender || entry.verified {
                return true;
            }
            let Some(proof) = entry.proof.take() else {
                return true;
            };
            if identity::verify(key, &proof.signature, proof.payload_json.as_bytes()) {
                entry.verified = true;
                verified += 1;
                true
            } else {
                dropped.push(entry.ts);
                false
            }
        });
        (verified, dropped)
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new(DEFAULT_CHAT_CAPACITY)
    }
}

/// Per-sender set of seen chat timestamps.
#[derive(Debug, Default)]
pub struct SeenSet {
    seen: HashMap<NodeId, BTreeSet<u64>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `(sender, ts)`. Returns false if it was already present.
    pub fn insert(&mut self, sender: NodeId, ts: u64) -> bool {
        self.seen.entry(sender).or_default().insert(ts)
    }

    pub fn contains(&self, sender: &NodeId, ts: u64) -> bool {
        self.seen.get(sender).is_some_and(|s| s.contains(&ts))
    }

    /// Forget `(sender, ts)` so a later line with that stamp is accepted.
    pub fn remove(&mut self, sender: &NodeId, ts: u64) {
        if let Some(stamps) = self.seen.get_mut(sender) {
            stamps.remove(&ts);
            if stamps.is_empty() {
                self.seen.remove(sender);
            }
        }
    }
}
