//! Join/verify bootstrap, announce flood, leave and repair.

use std::net::SocketAddr;

use tracing::{debug, error, info, warn};

use crate::bootstrap::BootstrapToken;
use crate::core::{FatalError, JoinState, OutboundAction, OverlayCore, SendError};
use crate::identity::NodeId;
use crate::protocol::{Payload, PeerRecord};
use crate::wire::Envelope;

impl OverlayCore {
    /// Send `join` to the bootstrap peer named by `token`.
    pub fn join(&mut self, token: BootstrapToken) -> Result<Vec<OutboundAction>, SendError> {
        self.ensure_active()?;
        if !matches!(
            self.state,
            JoinState::Unjoined | JoinState::AwaitingVerify | JoinState::Isolated
        ) {
            return Err(SendError::AlreadyJoined);
        }
        if token.id == self.id() {
            return Err(SendError::SelfTarget);
        }
        let join = Payload::Join {
            id: self.id(),
            ip: self.ip,
            port: self.port,
            key: *self.identity.public_key(),
            bootstrap_id: token.id,
        };
        self.send(token.addr(), &join);
        self.bootstrap = Some(token);
        self.set_state(JoinState::AwaitingVerify);
        self.status(format!("joining through {} at {}", token.id.short(), token.addr()));
        Ok(self.drain())
    }

    pub(crate) fn on_join(&mut self, env: &Envelope) {
        let Payload::Join {
            id,
            ip,
            port,
            key,
            bootstrap_id,
        } = &env.payload
        else {
            return;
        };
        if *bootstrap_id != self.id() {
            debug!(peer = %id.short(), "join addressed to another node");
            return;
        }
        if NodeId::from_public_key(key) != *id {
            debug!(peer = %id.short(), "join key does not match id");
            return;
        }
        if !env.verify_with(key) {
            warn!(peer = %id.short(), "join signature invalid");
            return;
        }
        let reply = Payload::Verify {
            ip: self.ip,
            port: self.port,
            key: *self.identity.public_key(),
            verify: NodeId::from_public_key(key),
        };
        self.send(SocketAddr::new(*ip, *port), &reply);
        if !self.verified {
            self.verified = true;
            if self.state == JoinState::Unjoined {
                self.set_state(JoinState::Verified);
            }
        }
        self.status(format!("{} joined through us", id.short()));
    }

    pub(crate) fn on_verify(&mut self, env: &Envelope, now: u64) -> Result<(), FatalError> {
        let Payload::Verify {
            ip,
            port,
            key,
            verify,
        } = &env.payload
        else {
            return Ok(());
        };
        let token = match (self.state, self.bootstrap) {
            (JoinState::AwaitingVerify, Some(token)) => token,
            _ => {
                debug!("verify without a pending join");
                return Ok(());
            }
        };
        let got = NodeId::from_public_key(key);
        if got != token.id {
            error!(expected = %token.id.short(), got = %got.short(), "bootstrap peer id mismatch");
            return Err(FatalError::BootstrapIdMismatch {
                expected: token.id,
                got,
            });
        }
        if *verify != self.id() {
            error!(got = %verify.short(), "bootstrap peer echoed wrong id");
            return Err(FatalError::VerifyEchoMismatch { got: *verify });
        }
        if !env.verify_with(key) {
            error!(peer = %got.short(), "bootstrap verify signature invalid");
            return Err(FatalError::BootstrapSignature);
        }

        self.verified = true;
        self.set_state(JoinState::Verified);
        let peer = PeerRecord {
            id: got,
            ip: *ip,
            port: *port,
            key: *key,
        };
        // `got` is the hash of `key`, so this cannot conflict.
        let _ = self.keys.insert(got, *key);
        self.table.seed(peer.clone(), now);
        self.set_state(JoinState::TableBuilding);
        self.status(format!("verified bootstrap peer {}", got.short()));

        self.announce();
        let targets = self.table.ideal_targets().to_vec();
        let (stagger, budget) = (self.config.bootstrap_stagger_ms, self.config.lookup_budget);
        self.schedule_queries(&peer, targets, stagger, budget, false, now);
        self.mark_table_built();
        Ok(())
    }

    /// Flood own record to every distinct peer in the table.
    pub(crate) fn announce(&mut self) {
        let me = self.self_record();
        self.flood(&Payload::Announce {
            id: me.id,
            ip: me.ip,
            port: me.port,
            key: me.key,
        });
    }

    pub(crate) fn on_announce(&mut self, env: &Envelope, raw: &[u8], now: u64) {
        let Payload::Announce { id, ip, port, key } = &env.payload else {
            return;
        };
        if *id == self.id() || self.keys.contains(id) {
            return;
        }
        if NodeId::from_public_key(key) != *id {
            debug!(peer = %id.short(), "announce key does not match id");
            return;
        }
        if !env.verify_with(key) {
            warn!(peer = %id.short(), "announce signature invalid");
            return;
        }
        if self.keys.insert(*id, *key).is_err() {
            return;
        }
        let peer = PeerRecord {
            id: *id,
            ip: *ip,
            port: *port,
            key: *key,
        };
        let targets = self.table.would_improve(&peer);
        debug!(peer = %id.short(), improves = targets.len(), "new peer announced");
        let (stagger, budget) = (self.config.query_stagger_ms, self.config.lookup_budget);
        self.schedule_queries(&peer, targets, stagger, budget, true, now);
        self.flood_raw(raw);
    }

    /// Tell every distinct peer we are going, with a replacement suggestion for
    /// each. The node stops participating immediately.
    pub fn leave(&mut self) -> Result<Vec<OutboundAction>, SendError> {
        self.ensure_active()?;
        self.set_state(JoinState::Departed);
        let dropped = self.scheduler.cancel_all();
        self.candidates.clear();
        let me = self.id();
        let peers: Vec<PeerRecord> = self.table.unique_peers().into_iter().cloned().collect();
        for peer in &peers {
            // The recipient's vacated slots are the ones whose targets sit near us.
            let closest = self.table.find_closest(&me, &[me, peer.id]).cloned();
            self.send(peer.addr(), &Payload::Leave { id: me, closest });
        }
        info!(peers = peers.len(), dropped, "left the network");
        self.status("left the network");
        Ok(self.drain())
    }

    pub(crate) fn on_leave(&mut self, env: &Envelope, raw: &[u8], now: u64) {
        let Payload::Leave { id, closest } = &env.payload else {
            return;
        };
        if *id == self.id() {
            return;
        }
        let Some(key) = self.keys.get(id).copied() else {
            debug!(peer = %id.short(), "leave from unknown peer");
            return;
        };
        if !env.verify_with(&key) {
            warn!(peer = %id.short(), "leave signature invalid");
            return;
        }
        self.keys.remove(id);
        self.candidates.forget(id);
        let was_present = self.table.contains(id);
        let targets = self.table.remove_and_repair(id);
        self.status(format!("{} left", id.short()));
        if self.table.is_empty() {
            if was_present && self.verified {
                self.isolate();
            }
            return;
        }
        if let Some(suggested) = closest {
            if suggested.id != self.id() && suggested.id != *id && !targets.is_empty() {
                let (stagger, budget) = (self.config.query_stagger_ms, self.config.lookup_budget);
                self.schedule_queries(suggested, targets, stagger, budget, false, now);
            }
        }
        self.flood_raw(raw);
    }

    /// Table emptied after verification: stop all pending work and wait for a new
    /// bootstrap.
    pub(crate) fn isolate(&mut self) {
        let dropped = self.scheduler.cancel_all();
        self.candidates.clear();
        self.verified = false;
        self.table_built = false;
        self.bootstrap = None;
        self.set_state(JoinState::Isolated);
        warn!(dropped, "routing table empty");
        self.status("all peers gone, bootstrap again");
    }

    /// First time the table holds a verified view.
    pub(crate) fn mark_table_built(&mut self) {
        if self.table_built || !self.verified || self.table.is_empty() {
            return;
        }
        self.table_built = true;
        self.set_state(JoinState::Ready);
        self.status("happy chatting");
    }
}
