//! Public chat: flood with (sender, ts) duplicate suppression.

use tracing::{debug, warn};

use crate::chat::{ChatEntry, PendingProof};
use crate::core::{OutboundAction, OverlayCore, SendError};
use crate::protocol::Payload;
use crate::wire::{self, Envelope};

impl OverlayCore {
    /// Sign and flood a public chat line. Delivered locally through the same path
    /// as inbound chat, so the echo from peers is suppressed as a duplicate.
    pub fn send_chat(&mut self, text: &str, now: u64) -> Result<Vec<OutboundAction>, SendError> {
        self.ensure_active()?;
        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if !(self.verified && self.table_built) {
            return Err(SendError::NotJoined);
        }
        let chat = Payload::Chat {
            id: self.id(),
            ts: self.next_chat_ts(now),
            content: text.to_owned(),
        };
        let bytes = wire::seal(&self.identity, &chat)?;
        let env = Envelope::open(&bytes)?;
        self.on_chat(&env, &bytes, now);
        Ok(self.drain())
    }

    /// Timestamps are unique per sender, so two lines sent within the same
    /// millisecond are not mistaken for duplicates.
    pub(crate) fn next_chat_ts(&mut self, now: u64) -> u64 {
        let ts = now.max(self.last_chat_ts + 1);
        self.last_chat_ts = ts;
        ts
    }

    pub(crate) fn on_chat(&mut self, env: &Envelope, raw: &[u8], now: u64) {
        let Payload::Chat { id, ts, content } = &env.payload else {
            return;
        };
        if content.is_empty() || self.seen.contains(id, *ts) {
            return;
        }
        let entry = if *id == self.id() {
            if !env.verify_with(self.identity.public_key()) {
                warn!("chat claiming our id failed verification");
                return;
            }
            ChatEntry::public(*id, *ts, content.clone(), now)
        } else if let Some(key) = self.keys.get(id) {
            if !env.verify_with(key) {
                warn!(peer = %id.short(), "chat signature invalid");
                return;
            }
            ChatEntry::public(*id, *ts, content.clone(), now)
        } else {
            debug!(peer = %id.short(), "chat from unknown sender, accepting unverified");
            self.request_key(*id, now);
            ChatEntry::unverified(
                *id,
                *ts,
                content.clone(),
                now,
                PendingProof {
                    payload_json: env.payload_json().to_owned(),
                    signature: *env.signature(),
                },
            )
        };
        self.seen.insert(*id, *ts);
        self.record_chat(entry);
        self.flood_raw(raw);
    }
}
