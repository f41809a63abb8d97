//! Framing: signed JSON envelope `{payload, signature}`. The payload travels as a
//! JSON string so the signed bytes are exactly the bytes verified on the far side.

use serde::{Deserialize, Serialize};

use crate::identity::{self, Identity, PublicKey, Signature};
use crate::protocol::Payload;

/// Largest datagram accepted for parsing.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    payload: String,
    signature: String,
}

/// Serialize and sign `payload`, producing datagram bytes.
pub fn seal(identity: &Identity, payload: &Payload) -> Result<Vec<u8>, EnvelopeError> {
    let payload = serde_json::to_string(payload).map_err(EnvelopeError::Encode)?;
    let signature = identity.sign(payload.as_bytes()).to_hex();
    let bytes = serde_json::to_vec(&RawEnvelope { payload, signature })
        .map_err(EnvelopeError::Encode)?;
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(EnvelopeError::TooLarge);
    }
    Ok(bytes)
}

/// An inbound envelope that passed the structural gate. The signature has not
/// been checked yet; handlers pick the key to check it with.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Payload,
    payload_json: String,
    signature: Signature,
}

impl Envelope {
    /// Structural validation: JSON envelope with both fields, hex signature,
    /// payload that parses as a known or unknown typed object.
    pub fn open(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() > MAX_DATAGRAM_LEN {
            return Err(EnvelopeError::TooLarge);
        }
        let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)?;
        let signature: Signature = raw.signature.parse().map_err(EnvelopeError::BadSignature)?;
        let payload: Payload =
            serde_json::from_str(&raw.payload).map_err(EnvelopeError::BadPayload)?;
        Ok(Self {
            payload,
            payload_json: raw.payload,
            signature,
        })
    }

    /// Check the signature over the exact received payload bytes.
    pub fn verify_with(&self, key: &PublicKey) -> bool {
        identity::verify(key, &self.signature, self.payload_json.as_bytes())
    }

    pub fn payload_json(&self) -> &str {
        &self.payload_json
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// Error encoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("encode error: {0}")]
    Encode(serde_json::Error),
    #[error("datagram too large")]
    TooLarge,
    #[error("malformed envelope: {0}")]
    Malformed(serde_json::Error),
    #[error("malformed signature: {0}")]
    BadSignature(hex::FromHexError),
    #[error("malformed payload: {0}")]
    BadPayload(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chat(ident: &Identity) -> Payload {
        Payload::Chat {
            id: ident.id(),
            ts: 1_700_000_000_000,
            content: "hello line".into(),
        }
    }

    #[test]
    fn seal_open_verify() {
        let ident = Identity::generate();
        let bytes = seal(&ident, &sample_chat(&ident)).unwrap();
        let env = Envelope::open(&bytes).unwrap();
        assert_eq!(env.payload, sample_chat(&ident));
        assert!(env.verify_with(ident.public_key()));
        assert!(!env.verify_with(Identity::generate().public_key()));
    }

    #[test]
    fn verify_uses_received_bytes() {
        let ident = Identity::generate();
        let payload = r#"{"type":"chat",  "id":"ID","ts":5,"content":"x"}"#
            .replace("ID", &ident.id().to_hex());
        let signature = ident.sign(payload.as_bytes()).to_hex();
        let bytes = serde_json::to_vec(&RawEnvelope { payload, signature }).unwrap();
        // Re-serializing would drop the extra whitespace; verification must not.
        let env = Envelope::open(&bytes).unwrap();
        assert!(env.verify_with(ident.public_key()));
    }

    #[test]
    fn tampered_payload_fails_verify() {
        let ident = Identity::generate();
        let bytes = seal(&ident, &sample_chat(&ident)).unwrap();
        let tampered = String::from_utf8(bytes).unwrap().replace("hello line", "hello lime");
        let env = Envelope::open(tampered.as_bytes()).unwrap();
        assert!(!env.verify_with(ident.public_key()));
    }

    #[test]
    fn structural_rejections() {
        assert!(matches!(
            Envelope::open(b"not json"),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::open(br#"{"payload":"{}"}"#),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::open(br#"{"payload":"{}","signature":"xyz"}"#),
            Err(EnvelopeError::BadSignature(_))
        ));
        let sig = "00".repeat(64);
        let not_json = format!(r#"{{"payload":"nope","signature":"{sig}"}}"#);
        assert!(matches!(
            Envelope::open(not_json.as_bytes()),
            Err(EnvelopeError::BadPayload(_))
        ));
        let missing = format!(r#"{{"payload":"{{\"type\":\"announce\"}}","signature":"{sig}"}}"#);
        assert!(matches!(
            Envelope::open(missing.as_bytes()),
            Err(EnvelopeError::BadPayload(_))
        ));
    }

    #[test]
    fn oversized_rejected() {
        let big = vec![b' '; MAX_DATAGRAM_LEN + 1];
        assert!(matches!(Envelope::open(&big), Err(EnvelopeError::TooLarge)));
    }
}
