//! Iterative closest-peer discovery: query_closest / response_closest.
//!
//! Every outgoing query registers its peer in the CandidateSet; a response is only
//! integrated if it answers one of those queries. Each walk carries a step budget
//! that shrinks by one per hop.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::core::OverlayCore;
use crate::identity::NodeId;
use crate::protocol::{Payload, PeerRecord};
use crate::routing::distance;
use crate::wire::Envelope;

#[derive(Debug)]
struct Candidate {
    /// Remaining step budget of each outstanding query to this peer.
    budgets: Vec<u8>,
    issued_at: u64,
}

/// Peers with an outstanding `query_closest`.
#[derive(Debug, Default)]
pub struct CandidateSet {
    entries: HashMap<NodeId, Candidate>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outstanding query to `id` carrying `budget`.
    pub fn register(&mut self, id: NodeId, budget: u8, now: u64) {
        let entry = self.entries.entry(id).or_insert(Candidate {
            budgets: Vec::new(),
            issued_at: now,
        });
        entry.budgets.push(budget);
        entry.issued_at = now;
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.contains_key(id)
    }

    /// Outstanding queries to `id`.
    pub fn outstanding(&self, id: &NodeId) -> usize {
        self.entries.get(id).map_or(0, |c| c.budgets.len())
    }

    /// Consume one outstanding query to `id`, returning its budget. The smallest
    /// budget is consumed first so a reply never extends a walk.
    pub fn resolve(&mut self, id: &NodeId) -> Option<u8> {
        let entry = self.entries.get_mut(id)?;
        let (idx, _) = entry.budgets.iter().enumerate().min_by_key(|(_, b)| **b)?;
        let budget = entry.budgets.swap_remove(idx);
        if entry.budgets.is_empty() {
            self.entries.remove(id);
        }
        Some(budget)
    }

    pub fn forget(&mut self, id: &NodeId) {
        self.entries.remove(id);
    }

    /// Drop peers whose latest query is older than `ttl`. Returns how many were dropped.
    pub fn expire(&mut self, now: u64, ttl: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, c| now.saturating_sub(c.issued_at) <= ttl);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl OverlayCore {
    /// Ask `peer` for the closest peer it knows to `target`.
    pub(crate) fn query_closest(&mut self, peer: PeerRecord, target: NodeId, budget: u8, now: u64) {
        if peer.id == self.id() {
            return;
        }
        if !peer.is_consistent() {
            debug!(peer = %peer.id.short(), "not querying peer whose key does not match its id");
            return;
        }
        if self.keys.insert(peer.id, peer.key).is_err() {
            warn!(peer = %peer.id.short(), "not querying peer with conflicting key");
            return;
        }
        self.candidates.register(peer.id, budget, now);
        let query = Payload::QueryClosest {
            id: self.id(),
            ip: self.ip,
            port: self.port,
            target,
        };
        self.send(peer.addr(), &query);
    }

    pub(crate) fn on_query_closest(&mut self, env: &Envelope) {
        let Payload::QueryClosest { id, ip, port, target } = &env.payload else {
            return;
        };
        if *id == self.id() {
            return;
        }
        // Requesters are not always known yet (a fresh joiner queries before anyone
        // has its announce). When they are, the signature must hold.
        if let Some(key) = self.keys.get(id) {
            if !env.verify_with(key) {
                warn!(peer = %id.short(), "query_closest signature invalid");
                return;
            }
        }
        let me = self.self_record();
        let own = distance(&me.id, target);
        let (closest, is_self) = match self.table.find_closest(target, &[*id]) {
            Some(candidate) if distance(&candidate.id, target) < own => (candidate.clone(), false),
            _ => (me.clone(), true),
        };
        let reply = Payload::ResponseClosest {
            closest,
            from: me,
            is_self,
        };
        self.send(std::net::SocketAddr::new(*ip, *port), &reply);
    }

    pub(crate) fn on_response_closest(&mut self, env: &Envelope, now: u64) {
        let Payload::ResponseClosest {
            closest,
            from,
            is_self,
        } = &env.payload
        else {
            return;
        };
        if from.id == self.id() {
            return;
        }
        let Some(stored) = self.keys.get(&from.id).copied() else {
            debug!(peer = %from.id.short(), "response_closest from unknown peer");
            return;
        };
        if !self.candidates.contains(&from.id) {
            debug!(peer = %from.id.short(), "unsolicited response_closest");
            return;
        }
        if stored != from.key || !env.verify_with(&stored) {
            warn!(peer = %from.id.short(), "response_closest failed authentication");
            return;
        }
        let budget = self.candidates.resolve(&from.id).unwrap_or(0);
        let improved = self.table.apply(from.clone(), &mut self.keys, now);
        if !improved.is_empty() {
            debug!(peer = %from.id.short(), slots = improved.len(), "responder integrated");
        }
        self.mark_table_built();

        if *is_self || closest.id == self.id() || closest.id == from.id {
            return;
        }
        let next = budget.saturating_sub(1);
        if next == 0 {
            debug!(peer = %closest.id.short(), "lookup budget exhausted");
            return;
        }
        if !closest.is_consistent() {
            debug!(peer = %closest.id.short(), "suggested peer key does not match its id");
            return;
        }
        let targets = self.table.would_improve(closest);
        let stagger = self.config.query_stagger_ms;
        self.schedule_queries(closest, targets, stagger, next, true, now);
    }
}
