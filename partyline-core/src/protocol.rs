//! Party line wire protocol: payload types carried inside signed envelopes.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::identity::{DhPublicKey, NodeId, PublicKey};

/// Peer contact as carried on the wire: identity, address and signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
    pub key: PublicKey,
}

impl PeerRecord {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// True when `id == hash(key)`.
    pub fn is_consistent(&self) -> bool {
        NodeId::from_public_key(&self.key) == self.id
    }
}

/// All payload types. JSON object with a snake_case `type` discriminator;
/// serde's missing-field errors enforce each type's required fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Bootstrap request. `bootstrap_id` is the ID the joiner expects to reach.
    Join {
        id: NodeId,
        ip: IpAddr,
        port: u16,
        key: PublicKey,
        bootstrap_id: NodeId,
    },
    /// Bootstrap reply. `verify` echoes hash of the joiner's key.
    Verify {
        ip: IpAddr,
        port: u16,
        key: PublicKey,
        verify: NodeId,
    },
    Announce {
        id: NodeId,
        ip: IpAddr,
        port: u16,
        key: PublicKey,
    },
    /// Departure notice with the leaver's best replacement suggestion for the recipient.
    Leave {
        id: NodeId,
        #[serde(default)]
        closest: Option<PeerRecord>,
    },
    QueryClosest {
        id: NodeId,
        ip: IpAddr,
        port: u16,
        target: NodeId,
    },
    ResponseClosest {
        closest: PeerRecord,
        from: PeerRecord,
        #[serde(rename = "self")]
        is_self: bool,
    },
    ConnectivityCheck {
        from: PeerRecord,
        target: NodeId,
    },
    ConnectivityConfirm {
        id: NodeId,
    },
    QueryKey {
        id: NodeId,
        ip: IpAddr,
        port: u16,
        target: NodeId,
    },
    ResponseKey {
        key: PublicKey,
    },
    Chat {
        id: NodeId,
        ts: u64,
        content: String,
    },
    SetupSecure {
        target: NodeId,
        dh_key: DhPublicKey,
        key: PublicKey,
    },
    FinalizeSecure {
        target: NodeId,
        dh_key: DhPublicKey,
        key: PublicKey,
    },
    PrivateMessage {
        target: NodeId,
        id: NodeId,
        ts: u64,
        enc: String,
    },
    PrivateMessageReceipt {
        target: NodeId,
        id: NodeId,
        ts: u64,
        enc: String,
    },
    /// Any `type` this node does not understand. Ignored.
    #[serde(other)]
    Unknown,
}

impl Payload {
    /// Wire name of this payload type.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Join { .. } => "join",
            Payload::Verify { .. } => "verify",
            Payload::Announce { .. } => "announce",
            Payload::Leave { .. } => "leave",
            Payload::QueryClosest { .. } => "query_closest",
            Payload::ResponseClosest { .. } => "response_closest",
            Payload::ConnectivityCheck { .. } => "connectivity_check",
            Payload::ConnectivityConfirm { .. } => "connectivity_confirm",
            Payload::QueryKey { .. } => "query_key",
            Payload::ResponseKey { .. } => "response_key",
            Payload::Chat { .. } => "chat",
            Payload::SetupSecure { .. } => "setup_secure",
            Payload::FinalizeSecure { .. } => "finalize_secure",
            Payload::PrivateMessage { .. } => "private_message",
            Payload::PrivateMessageReceipt { .. } => "private_message_receipt",
            Payload::Unknown => "unknown",
        }
    }

    /// Destination of a hop-by-hop routed payload.
    pub fn routed_target(&self) -> Option<NodeId> {
        match self {
            Payload::SetupSecure { target, .. }
            | Payload::FinalizeSecure { target, .. }
            | Payload::PrivateMessage { target, .. }
            | Payload::PrivateMessageReceipt { target, .. }
            | Payload::QueryKey { target, .. } => Some(*target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn record(ident: &Identity) -> PeerRecord {
        PeerRecord {
            id: ident.id(),
            ip: "10.0.0.1".parse().unwrap(),
            port: 3499,
            key: *ident.public_key(),
        }
    }

    #[test]
    fn payload_uses_type_tag() {
        let ident = Identity::generate();
        let json = serde_json::to_string(&Payload::ConnectivityConfirm { id: ident.id() }).unwrap();
        assert!(json.contains("\"type\":\"connectivity_confirm\""));
        assert!(json.contains(&ident.id().to_hex()));
    }

    #[test]
    fn response_closest_self_field_name() {
        let ident = Identity::generate();
        let payload = Payload::ResponseClosest {
            closest: record(&ident),
            from: record(&ident),
            is_self: true,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"self\":true"));
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn missing_required_field_rejected() {
        let ident = Identity::generate();
        let json = format!(r#"{{"type":"chat","id":"{}","content":"hi"}}"#, ident.id());
        assert!(serde_json::from_str::<Payload>(&json).is_err());
    }

    #[test]
    fn unknown_type_ignored() {
        let p: Payload = serde_json::from_str(r#"{"type":"party_invite","x":1}"#).unwrap();
        assert_eq!(p, Payload::Unknown);
    }

    #[test]
    fn leave_closest_optional() {
        let ident = Identity::generate();
        let json = format!(r#"{{"type":"leave","id":"{}"}}"#, ident.id());
        let p: Payload = serde_json::from_str(&json).unwrap();
        assert!(matches!(p, Payload::Leave { closest: None, .. }));
    }

    #[test]
    fn routed_targets() {
        let ident = Identity::generate();
        let p = Payload::PrivateMessage {
            target: ident.id(),
            id: ident.id(),
            ts: 1,
            enc: String::new(),
        };
        assert_eq!(p.routed_target(), Some(ident.id()));
        assert_eq!(Payload::ConnectivityConfirm { id: ident.id() }.routed_target(), None);
    }

    #[test]
    fn record_consistency() {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut r = record(&a);
        assert!(r.is_consistent());
        r.key = *b.public_key();
        assert!(!r.is_consistent());
    }
}
