//! Connectivity checks and stale-peer eviction.

use tracing::{debug, info, warn};

use crate::core::OverlayCore;
use crate::protocol::Payload;
use crate::wire::Envelope;

impl OverlayCore {
    /// Probe every distinct peer, then evict those not confirmed recently.
    /// Evicted slots stay empty until announce or leave flows refill them.
    pub(crate) fn liveness_round(&mut self, now: u64) {
        let me = self.self_record();
        let peers: Vec<_> = self
            .table
            .unique_peers()
            .into_iter()
            .map(|p| (p.id, p.addr()))
            .collect();
        for (id, addr) in peers {
            self.send(
                addr,
                &Payload::ConnectivityCheck {
                    from: me.clone(),
                    target: id,
                },
            );
        }
        let evicted = self.table.evict_stale(now, self.config.stale_after_ms);
        if evicted.is_empty() {
            return;
        }
        for id in &evicted {
            info!(peer = %id.short(), "evicted stale peer");
            self.status(format!("{} timed out", id.short()));
        }
        if self.table.is_empty() && self.verified {
            self.isolate();
        }
    }

    pub(crate) fn on_connectivity_check(&mut self, env: &Envelope) {
        let Payload::ConnectivityCheck { from, target } = &env.payload else {
            return;
        };
        if *target != self.id() || from.id == self.id() {
            return;
        }
        if !from.is_consistent() {
            debug!(peer = %from.id.short(), "connectivity_check key does not match id");
            return;
        }
        if self.keys.get(&from.id).is_some_and(|k| *k != from.key) {
            warn!(peer = %from.id.short(), "connectivity_check key conflicts with stored key");
            return;
        }
        if !env.verify_with(&from.key) {
            warn!(peer = %from.id.short(), "connectivity_check signature invalid");
            return;
        }
        self.send(from.addr(), &Payload::ConnectivityConfirm { id: self.id() });
    }

    pub(crate) fn on_connectivity_confirm(&mut self, env: &Envelope, now: u64) {
        let Payload::ConnectivityConfirm { id } = &env.payload else {
            return;
        };
        let Some(key) = self.keys.get(id) else {
            debug!(peer = %id.short(), "confirm from unknown peer");
            return;
        };
        if !env.verify_with(key) {
            warn!(peer = %id.short(), "connectivity_confirm signature invalid");
            return;
        }
        self.table.touch(id, now);
    }
}
