//! Pairwise secure channels, private messages, key discovery and hop-by-hop
//! routing of targeted payloads.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::chat::ChatEntry;
use crate::core::{OutboundAction, OverlayCore, SendError};
use crate::identity::{self, DhPublicKey, NodeId, PublicKey};
use crate::protocol::Payload;
use crate::routing::distance;
use crate::wire::Envelope;

impl OverlayCore {
    /// Send a locally originated targeted payload to the closest known peer.
    pub(crate) fn route(&mut self, target: NodeId, payload: &Payload) -> Result<(), SendError> {
        let next = self
            .table
            .find_closest(&target, &[self.id()])
            .map(|p| p.addr())
            .ok_or(SendError::NoRoute(target))?;
        self.send(next, payload);
        Ok(())
    }

    /// Relay a targeted datagram addressed to someone else. Only forwards to a
    /// peer strictly closer to the target than this node; otherwise drops.
    pub(crate) fn forward(&mut self, target: NodeId, raw: &[u8]) {
        let own = distance(&self.id(), &target);
        let next = self
            .table
            .find_closest(&target, &[self.id()])
            .filter(|p| distance(&p.id, &target) < own)
            .map(|p| (p.id, p.addr()));
        match next {
            Some((via, addr)) => {
                debug!(target = %target.short(), via = %via.short(), "forwarding");
                self.send_raw(addr, raw);
            }
            None => debug!(target = %target.short(), "no closer peer, dropping routed payload"),
        }
    }

    /// Start a DH handshake with `peer`.
    pub fn setup_secure(&mut self, peer: NodeId) -> Result<Vec<OutboundAction>, SendError> {
        self.ensure_active()?;
        if peer == self.id() {
            return Err(SendError::SelfTarget);
        }
        let setup = Payload::SetupSecure {
            target: peer,
            dh_key: *self.identity.dh_public_key(),
            key: *self.identity.public_key(),
        };
        self.route(peer, &setup)?;
        self.status(format!("opening secure channel to {}", peer.short()));
        Ok(self.drain())
    }

    pub(crate) fn on_setup_secure(&mut self, env: &Envelope) {
        let Payload::SetupSecure { dh_key, key, .. } = &env.payload else {
            return;
        };
        let Some(peer) = self.accept_handshake(env, dh_key, key) else {
            return;
        };
        let finalize = Payload::FinalizeSecure {
            target: peer,
            dh_key: *self.identity.dh_public_key(),
            key: *self.identity.public_key(),
        };
        if let Err(e) = self.route(peer, &finalize) {
            debug!(peer = %peer.short(), error = %e, "cannot answer setup_secure");
        }
    }

    pub(crate) fn on_finalize_secure(&mut self, env: &Envelope) {
        let Payload::FinalizeSecure { dh_key, key, .. } = &env.payload else {
            return;
        };
        self.accept_handshake(env, dh_key, key);
    }

    /// Authenticate a handshake half and store the derived channel key.
    fn accept_handshake(
        &mut self,
        env: &Envelope,
        dh_key: &DhPublicKey,
        key: &PublicKey,
    ) -> Option<NodeId> {
        let peer = NodeId::from_public_key(key);
        if peer == self.id() {
            return None;
        }
        if !env.verify_with(key) {
            warn!(peer = %peer.short(), kind = env.payload.kind(), "handshake signature invalid");
            return None;
        }
        if self.keys.insert(peer, *key).is_err() {
            return None;
        }
        let shared = self.identity.shared_secret(dh_key);
        self.secrets.insert(peer, identity::derive_channel_key(&shared));
        info!(peer = %peer.short(), "secure channel established");
        self.status(format!("secure channel with {} established", peer.short()));
        Some(peer)
    }

    /// Encrypt `text` for `peer` and route it. Requires an established channel.
    pub fn send_private_message(
        &mut self,
        peer: NodeId,
        text: &str,
        now: u64,
    ) -> Result<Vec<OutboundAction>, SendError> {
        self.ensure_active()?;
        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let secret = *self
            .secrets
            .get(&peer)
            .ok_or(SendError::NoSecureChannel(peer))?;
        let enc = identity::encrypt_message(&secret, text)?;
        let ts = self.next_chat_ts(now);
        let message = Payload::PrivateMessage {
            target: peer,
            id: self.id(),
            ts,
            enc,
        };
        self.route(peer, &message)?;
        Ok(self.drain())
    }

    pub(crate) fn on_private_message(&mut self, env: &Envelope, now: u64) {
        let Payload::PrivateMessage { id, ts, enc, .. } = &env.payload else {
            return;
        };
        let Some(text) = self.open_private(env, id, enc) else {
            return;
        };
        let me = self.id();
        self.record_chat(ChatEntry::private(*id, me, *ts, text, now));
        let receipt = Payload::PrivateMessageReceipt {
            target: *id,
            id: me,
            ts: *ts,
            enc: enc.clone(),
        };
        if let Err(e) = self.route(*id, &receipt) {
            debug!(peer = %id.short(), error = %e, "cannot return receipt");
        }
    }

    /// The receipt echoes our own ciphertext; record it as sent by us.
    pub(crate) fn on_private_message_receipt(&mut self, env: &Envelope, now: u64) {
        let Payload::PrivateMessageReceipt { id, ts, enc, .. } = &env.payload else {
            return;
        };
        let Some(text) = self.open_private(env, id, enc) else {
            return;
        };
        let me = self.id();
        self.record_chat(ChatEntry::private(me, *id, *ts, text, now));
    }

    /// Authenticate `sender` and decrypt `enc` under the channel shared with it.
    fn open_private(&self, env: &Envelope, sender: &NodeId, enc: &str) -> Option<String> {
        let Some(key) = self.keys.get(sender) else {
            debug!(peer = %sender.short(), kind = env.payload.kind(), "sender key unknown");
            return None;
        };
        if !env.verify_with(key) {
            warn!(peer = %sender.short(), kind = env.payload.kind(), "signature invalid");
            return None;
        }
        let Some(secret) = self.secrets.get(sender) else {
            debug!(peer = %sender.short(), "no secure channel");
            return None;
        };
        match identity::decrypt_message(secret, enc) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(peer = %sender.short(), error = %e, "private message rejected");
                None
            }
        }
    }

    /// Ask the owner of `id` for its signing key. A query still within the
    /// candidate TTL is not repeated; an older one is reissued.
    pub(crate) fn request_key(&mut self, id: NodeId, now: u64) {
        if id == self.id() {
            return;
        }
        if let Some(issued) = self.pending_keys.get(&id) {
            if now.saturating_sub(*issued) < self.config.candidate_ttl_ms {
                return;
            }
        }
        self.pending_keys.insert(id, now);
        let query = Payload::QueryKey {
            id: self.id(),
            ip: self.ip,
            port: self.port,
            target: id,
        };
        if let Err(e) = self.route(id, &query) {
            debug!(peer = %id.short(), error = %e, "cannot query key");
            self.pending_keys.remove(&id);
        }
    }

    /// Reached the key owner: answer the requester directly.
    pub(crate) fn on_query_key(&mut self, env: &Envelope) {
        let Payload::QueryKey { id, ip, port, .. } = &env.payload else {
            return;
        };
        if *id == self.id() {
            return;
        }
        let reply = Payload::ResponseKey {
            key: *self.identity.public_key(),
        };
        self.send(SocketAddr::new(*ip, *port), &reply);
    }

    pub(crate) fn on_response_key(&mut self, env: &Envelope) {
        let Payload::ResponseKey { key } = &env.payload else {
            return;
        };
        let id = NodeId::from_public_key(key);
        if !self.pending_keys.contains_key(&id) {
            debug!(peer = %id.short(), "unsolicited response_key");
            return;
        }
        if !env.verify_with(key) {
            warn!(peer = %id.short(), "response_key signature invalid");
            return;
        }
        self.pending_keys.remove(&id);
        if self.keys.insert(id, *key).is_err() {
            return;
        }
        let (verified, dropped) = self.chat.reverify(&id, key);
        // Forged lines must not shadow the real ones with the same stamp.
        for ts in &dropped {
            self.seen.remove(&id, *ts);
        }
        info!(peer = %id.short(), verified, dropped = dropped.len(), "learned key");
        if verified > 0 {
            self.status(format!("verified {verified} earlier messages from {}", id.short()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::protocol::PeerRecord;
    use crate::wire;

    fn node(port: u16) -> OverlayCore {
        OverlayCore::new(
            Identity::generate(),
            SocketAddr::from(([127, 0, 0, 1], port)),
        )
    }

    fn record(ident: &Identity, port: u16) -> PeerRecord {
        PeerRecord {
            id: ident.id(),
            ip: "127.0.0.1".parse().unwrap(),
            port,
            key: *ident.public_key(),
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn sent_to(actions: &[OutboundAction]) -> Vec<SocketAddr> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::SendDatagram { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn private_message_needs_channel() {
        let mut n = node(4000);
        let peer = Identity::generate().id();
        assert!(matches!(
            n.send_private_message(peer, "hi", 0),
            Err(SendError::NoSecureChannel(p)) if p == peer
        ));
        assert!(matches!(
            n.send_private_message(peer, "  ", 0),
            Err(SendError::EmptyMessage)
        ));
    }

    #[test]
    fn setup_without_peers_has_no_route() {
        let mut n = node(4000);
        let peer = Identity::generate().id();
        assert!(matches!(n.setup_secure(peer), Err(SendError::NoRoute(_))));
        assert!(matches!(n.setup_secure(n.id()), Err(SendError::SelfTarget)));
    }

    #[test]
    fn relay_forwards_only_with_progress() {
        let mut relay = node(4000);
        let sender = Identity::generate();
        let near = Identity::generate();
        relay.add_peer(record(&near, 4001), 0);

        // Destination is `near` itself: strictly closer than the relay.
        let bytes = wire::seal(
            &sender,
            &Payload::SetupSecure {
                target: near.id(),
                dh_key: *sender.dh_public_key(),
                key: *sender.public_key(),
            },
        )
        .unwrap();
        let actions = relay.on_datagram(&bytes, addr(4009), 0).unwrap();
        match actions.as_slice() {
            [OutboundAction::SendDatagram { to, bytes: out }] => {
                assert_eq!(*to, addr(4001));
                assert_eq!(*out, bytes);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Destination is the relay's own neighbourhood: nothing is closer.
        let target = relay.id().flip_bit(0);
        let bytes = wire::seal(
            &sender,
            &Payload::PrivateMessage {
                target,
                id: sender.id(),
                ts: 1,
                enc: "00".into(),
            },
        )
        .unwrap();
        assert!(distance(&near.id(), &target) >= distance(&relay.id(), &target));
        assert!(sent_to(&relay.on_datagram(&bytes, addr(4009), 0).unwrap()).is_empty());
    }

    #[test]
    fn handshake_and_message_between_direct_peers() {
        let mut a = node(4000);
        let mut b = node(4001);
        let rec_a = PeerRecord {
            id: a.id(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 4000,
            key: *a.identity().public_key(),
        };
        let rec_b = PeerRecord {
            id: b.id(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 4001,
            key: *b.identity().public_key(),
        };
        a.add_peer(rec_b, 0);
        b.add_peer(rec_a, 0);

        let setup = a.setup_secure(b.id()).unwrap();
        let [OutboundAction::SendDatagram { bytes, .. }, ..] = setup.as_slice() else {
            panic!("no setup datagram");
        };
        let finalize = b.on_datagram(bytes, addr(4000), 1).unwrap();
        let bytes = finalize
            .iter()
            .find_map(|x| match x {
                OutboundAction::SendDatagram { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        a.on_datagram(&bytes, addr(4001), 2).unwrap();
        assert_eq!(a.secret_for(&b.id()), b.secret_for(&a.id()));
        assert!(a.secret_for(&b.id()).is_some());

        let out = a.send_private_message(b.id(), "psst", 3).unwrap();
        let [OutboundAction::SendDatagram { bytes, .. }] = out.as_slice() else {
            panic!("expected one datagram");
        };
        let delivered = b.on_datagram(bytes, addr(4000), 4).unwrap();
        let entry = b.chat_log().last().unwrap();
        assert_eq!(entry.content, "psst");
        assert_eq!(entry.sender, a.id());
        assert!(entry.secure && entry.verified);

        let receipt = delivered
            .iter()
            .find_map(|x| match x {
                OutboundAction::SendDatagram { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        a.on_datagram(&receipt, addr(4001), 5).unwrap();
        let echoed = a.chat_log().last().unwrap();
        assert_eq!(echoed.content, "psst");
        assert_eq!(echoed.sender, a.id());
        assert_eq!(echoed.target, Some(b.id()));
    }

    #[test]
    fn response_key_only_when_asked() {
        let mut n = node(4000);
        let owner = Identity::generate();
        let bytes = wire::seal(
            &owner,
            &Payload::ResponseKey {
                key: *owner.public_key(),
            },
        )
        .unwrap();
        n.on_datagram(&bytes, addr(4001), 0).unwrap();
        assert!(!n.keys().contains(&owner.id()));

        n.pending_keys.insert(owner.id(), 0);
        n.on_datagram(&bytes, addr(4001), 0).unwrap();
        assert!(n.keys().contains(&owner.id()));
        assert!(n.pending_keys.is_empty());
    }
}
