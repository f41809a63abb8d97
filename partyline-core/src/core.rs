//! Host-driven API: OverlayCore receives datagrams, commands and clock ticks from the
//! host and returns actions (datagrams to send, status lines, chat lines).
//!
//! All handlers run to completion on the caller's thread; the host owns the single
//! `OverlayCore` and serializes access to it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapToken;
use crate::chat::{ChatEntry, ChatLog, SeenSet};
use crate::config::OverlayConfig;
use crate::identity::{CryptoError, Identity, NodeId, PublicKey};
use crate::keys::KeyDirectory;
use crate::lookup::CandidateSet;
use crate::protocol::{Payload, PeerRecord};
use crate::routing::RoutingTable;
use crate::scheduler::{Deferred, Scheduler};
use crate::wire::{self, Envelope, EnvelopeError};

/// Membership state of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Unjoined,
    AwaitingVerify,
    Verified,
    TableBuilding,
    Ready,
    /// Routing table emptied after verification. Needs a new bootstrap.
    Isolated,
    /// Left the network. Terminal; every inbound datagram is ignored.
    Departed,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    SendDatagram { to: SocketAddr, bytes: Vec<u8> },
    Status(String),
    Chat(ChatEntry),
}

/// Main coordinator. Host passes events; core returns actions.
///
/// Every `now` argument is milliseconds since the Unix epoch on the host clock; it
/// stamps chat lines and drives timers.
pub struct OverlayCore {
    pub(crate) identity: Identity,
    pub(crate) ip: IpAddr,
    pub(crate) port: u16,
    pub(crate) config: OverlayConfig,
    pub(crate) state: JoinState,
    /// Set once a join/verify exchange has completed on either side.
    pub(crate) verified: bool,
    pub(crate) table_built: bool,
    pub(crate) bootstrap: Option<BootstrapToken>,
    pub(crate) table: RoutingTable,
    pub(crate) keys: KeyDirectory,
    pub(crate) candidates: CandidateSet,
    pub(crate) secrets: HashMap<NodeId, [u8; 32]>,
    /// Outstanding key queries and when each was issued.
    pub(crate) pending_keys: HashMap<NodeId, u64>,
    pub(crate) chat: ChatLog,
    pub(crate) seen: SeenSet,
    pub(crate) last_chat_ts: u64,
    pub(crate) scheduler: Scheduler,
    pub(crate) last_liveness: Option<u64>,
    outbox: Vec<OutboundAction>,
}

impl OverlayCore {
    /// `advertise` is the address peers should use to reach this node.
    pub fn new(identity: Identity, advertise: SocketAddr) -> Self {
        Self::with_config(identity, advertise, OverlayConfig::default())
    }

    pub fn with_config(identity: Identity, advertise: SocketAddr, config: OverlayConfig) -> Self {
        let id = identity.id();
        Self {
            identity,
            ip: advertise.ip(),
            port: advertise.port(),
            chat: ChatLog::new(config.chat_capacity),
            config,
            state: JoinState::Unjoined,
            verified: false,
            table_built: false,
            bootstrap: None,
            table: RoutingTable::new(id),
            keys: KeyDirectory::new(),
            candidates: CandidateSet::new(),
            secrets: HashMap::new(),
            pending_keys: HashMap::new(),
            seen: SeenSet::new(),
            last_chat_ts: 0,
            scheduler: Scheduler::new(),
            last_liveness: None,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.identity.id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn advertised_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Token other nodes use to bootstrap off this one. IPv4 only.
    pub fn bootstrap_token(&self) -> Option<BootstrapToken> {
        match self.ip {
            IpAddr::V4(ip) => Some(BootstrapToken {
                ip,
                port: self.port,
                id: self.id(),
            }),
            IpAddr::V6(_) => None,
        }
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn keys(&self) -> &KeyDirectory {
        &self.keys
    }

    /// Occupant of each slot, in slot order.
    pub fn routing_snapshot(&self) -> Vec<Option<NodeId>> {
        self.table.snapshot()
    }

    /// Known signing keys, sorted by id.
    pub fn known_keys(&self) -> Vec<(NodeId, PublicKey)> {
        let mut keys: Vec<_> = self.keys.iter().map(|(id, key)| (*id, *key)).collect();
        keys.sort_by_key(|(id, _)| *id);
        keys
    }

    pub fn chat_log(&self) -> &ChatLog {
        &self.chat
    }

    pub fn candidates(&self) -> &CandidateSet {
        &self.candidates
    }

    pub fn secret_for(&self, peer: &NodeId) -> Option<&[u8; 32]> {
        self.secrets.get(peer)
    }

    pub fn secure_peers(&self) -> Vec<NodeId> {
        self.secrets.keys().copied().collect()
    }

    /// Pending deferred work.
    pub fn pending_tasks(&self) -> usize {
        self.scheduler.len()
    }

    /// When `tick` next has deferred work to run.
    pub fn next_deadline(&self) -> Option<u64> {
        self.scheduler.next_deadline()
    }

    /// Integrate a peer known out of band. Returns the improved ideal targets.
    pub fn add_peer(&mut self, peer: PeerRecord, now: u64) -> Vec<NodeId> {
        self.table.apply(peer, &mut self.keys, now)
    }

    /// Process one inbound datagram. Malformed or unauthenticated input is logged and
    /// dropped; only a failed bootstrap verification is returned as an error, and the
    /// host must terminate on it.
    pub fn on_datagram(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
        now: u64,
    ) -> Result<Vec<OutboundAction>, FatalError> {
        if self.state == JoinState::Departed {
            return Ok(Vec::new());
        }
        let env = match Envelope::open(bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(%from, error = %e, "discarding datagram");
                return Ok(Vec::new());
            }
        };
        let outcome = self.dispatch(&env, bytes, now);
        let actions = self.drain();
        outcome.map(|()| actions)
    }

    fn dispatch(&mut self, env: &Envelope, raw: &[u8], now: u64) -> Result<(), FatalError> {
        if let Some(target) = env.payload.routed_target() {
            if target != self.id() {
                self.forward(target, raw);
                return Ok(());
            }
        }
        match &env.payload {
            Payload::Join { .. } => self.on_join(env),
            Payload::Verify { .. } => return self.on_verify(env, now),
            Payload::Announce { .. } => self.on_announce(env, raw, now),
            Payload::Leave { .. } => self.on_leave(env, raw, now),
            Payload::QueryClosest { .. } => self.on_query_closest(env),
            Payload::ResponseClosest { .. } => self.on_response_closest(env, now),
            Payload::ConnectivityCheck { .. } => self.on_connectivity_check(env),
            Payload::ConnectivityConfirm { .. } => self.on_connectivity_confirm(env, now),
            Payload::QueryKey { .. } => self.on_query_key(env),
            Payload::ResponseKey { .. } => self.on_response_key(env),
            Payload::Chat { .. } => self.on_chat(env, raw, now),
            Payload::SetupSecure { .. } => self.on_setup_secure(env),
            Payload::FinalizeSecure { .. } => self.on_finalize_secure(env),
            Payload::PrivateMessage { .. } => self.on_private_message(env, now),
            Payload::PrivateMessageReceipt { .. } => self.on_private_message_receipt(env, now),
            Payload::Unknown => {}
        }
        Ok(())
    }

    /// Periodic tick: fire due continuations, run the liveness round when its
    /// interval has elapsed, forget unanswered lookup candidates.
    pub fn tick(&mut self, now: u64) -> Vec<OutboundAction> {
        if self.state == JoinState::Departed {
            return Vec::new();
        }
        for task in self.scheduler.pop_due(now) {
            self.run_deferred(task, now);
        }
        let liveness_due = match self.last_liveness {
            None => {
                self.last_liveness = Some(now);
                false
            }
            Some(last) => now.saturating_sub(last) >= self.config.liveness_interval_ms,
        };
        if liveness_due {
            self.last_liveness = Some(now);
            self.liveness_round(now);
        }
        let ttl = self.config.candidate_ttl_ms;
        let expired = self.candidates.expire(now, ttl);
        if expired > 0 {
            debug!(expired, "forgot unanswered lookup candidates");
        }
        let before = self.pending_keys.len();
        self.pending_keys.retain(|_, issued| now.saturating_sub(*issued) < ttl);
        if self.pending_keys.len() < before {
            debug!(expired = before - self.pending_keys.len(), "forgot unanswered key queries");
        }
        self.drain()
    }

    fn run_deferred(&mut self, task: Deferred, now: u64) {
        match task {
            Deferred::QueryClosest {
                peer,
                target,
                budget,
                require_improvement,
            } => {
                // Other flows may have filled the slot since this was scheduled.
                if require_improvement && !self.table.improves(&peer.id, &target) {
                    return;
                }
                self.query_closest(peer, target, budget, now);
            }
        }
    }

    /// Queue staggered lookups toward `peer`, one per target.
    pub(crate) fn schedule_queries(
        &mut self,
        peer: &PeerRecord,
        targets: Vec<NodeId>,
        stagger_ms: u64,
        budget: u8,
        require_improvement: bool,
        now: u64,
    ) {
        for (i, target) in targets.into_iter().enumerate() {
            self.scheduler.schedule(
                now + stagger_ms * (i as u64 + 1),
                Deferred::QueryClosest {
                    peer: peer.clone(),
                    target,
                    budget,
                    require_improvement,
                },
            );
        }
    }

    pub(crate) fn self_record(&self) -> PeerRecord {
        PeerRecord {
            id: self.id(),
            ip: self.ip,
            port: self.port,
            key: *self.identity.public_key(),
        }
    }

    /// Sign and queue `payload` for `to`.
    pub(crate) fn send(&mut self, to: SocketAddr, payload: &Payload) {
        match wire::seal(&self.identity, payload) {
            Ok(bytes) => self.outbox.push(OutboundAction::SendDatagram { to, bytes }),
            Err(e) => warn!(kind = payload.kind(), error = %e, "failed to seal payload"),
        }
    }

    pub(crate) fn send_raw(&mut self, to: SocketAddr, bytes: &[u8]) {
        self.outbox.push(OutboundAction::SendDatagram {
            to,
            bytes: bytes.to_vec(),
        });
    }

    /// Sign `payload` once and send it to every distinct peer in the table.
    pub(crate) fn flood(&mut self, payload: &Payload) {
        match wire::seal(&self.identity, payload) {
            Ok(bytes) => self.flood_raw(&bytes),
            Err(e) => warn!(kind = payload.kind(), error = %e, "failed to seal payload"),
        }
    }

    /// Re-send received bytes unchanged to every distinct peer in the table.
    pub(crate) fn flood_raw(&mut self, bytes: &[u8]) {
        let addrs: Vec<SocketAddr> = self.table.unique_peers().iter().map(|p| p.addr()).collect();
        for to in addrs {
            self.send_raw(to, bytes);
        }
    }

    pub(crate) fn status(&mut self, line: impl Into<String>) {
        self.outbox.push(OutboundAction::Status(line.into()));
    }

    pub(crate) fn record_chat(&mut self, entry: ChatEntry) {
        self.chat.push(entry.clone());
        self.outbox.push(OutboundAction::Chat(entry));
    }

    pub(crate) fn set_state(&mut self, next: JoinState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "membership state");
            self.state = next;
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<(), SendError> {
        if self.state == JoinState::Departed {
            return Err(SendError::Departed);
        }
        Ok(())
    }

    pub(crate) fn drain(&mut self) -> Vec<OutboundAction> {
        std::mem::take(&mut self.outbox)
    }
}

/// Bootstrap verification failure. The initial view cannot be trusted; the host
/// must terminate.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("bootstrap peer key hashes to {got}, expected {expected}")]
    BootstrapIdMismatch { expected: NodeId, got: NodeId },
    #[error("bootstrap peer echoed {got} instead of our id")]
    VerifyEchoMismatch { got: NodeId },
    #[error("bootstrap verify signature invalid")]
    BootstrapSignature,
}

/// Error starting a locally initiated operation.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("node has left the network")]
    Departed,
    #[error("node has not joined a network yet")]
    NotJoined,
    #[error("node is already joined")]
    AlreadyJoined,
    #[error("cannot target own id")]
    SelfTarget,
    #[error("no route toward {0}")]
    NoRoute(NodeId),
    #[error("no secure channel with {0}")]
    NoSecureChannel(NodeId),
    #[error("empty message")]
    EmptyMessage,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
