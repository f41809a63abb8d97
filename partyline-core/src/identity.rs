//! Node identity and crypto: signing keypair, node ID, DH agreement, message encryption.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;

/// Implements hex Display/FromStr/serde for a fixed-size byte newtype.
macro_rules! hex_bytes {
    ($name:ident, $len:expr) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut out = [0u8; $len];
                hex::decode_to_slice(s, &mut out)?;
                Ok($name(out))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Node ID: SHA-256 of the node's Ed25519 verifying key. 256 bits, hex on the wire.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId([u8; 32]);

hex_bytes!(NodeId, 32);

impl NodeId {
    /// Derive a node ID from a signing public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        NodeId(digest.into())
    }

    /// This ID with bit `i` flipped, counting from the least significant bit.
    pub fn flip_bit(&self, i: usize) -> NodeId {
        let mut out = self.0;
        out[31 - i / 8] ^= 1 << (i % 8);
        NodeId(out)
    }

    /// Last six hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[29..])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// Ed25519 verifying key as carried on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

hex_bytes!(PublicKey, 32);

/// X25519 public key used for secure channel setup.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DhPublicKey([u8; 32]);

hex_bytes!(DhPublicKey, 32);

/// Detached Ed25519 signature.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Signature([u8; 64]);

hex_bytes!(Signature, 64);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

/// Node identity: signing keypair, long-lived DH keypair and the derived ID.
/// Created once at startup.
pub struct Identity {
    signing: SigningKey,
    public: PublicKey,
    dh_secret: StaticSecret,
    dh_public: DhPublicKey,
    id: NodeId,
}

impl Identity {
    /// Generate fresh signing and DH keys.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let dh_secret = StaticSecret::random_from_rng(OsRng);
        Self::from_parts(signing, dh_secret)
    }

    /// Rebuild an identity from stored secret seeds.
    pub fn from_seeds(signing_seed: [u8; 32], dh_seed: [u8; 32]) -> Self {
        Self::from_parts(
            SigningKey::from_bytes(&signing_seed),
            StaticSecret::from(dh_seed),
        )
    }

    fn from_parts(signing: SigningKey, dh_secret: StaticSecret) -> Self {
        let public = PublicKey(signing.verifying_key().to_bytes());
        let dh_public = DhPublicKey(X25519PublicKey::from(&dh_secret).to_bytes());
        let id = NodeId::from_public_key(&public);
        Self {
            signing,
            public,
            dh_secret,
            dh_public,
            id,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn dh_public_key(&self) -> &DhPublicKey {
        &self.dh_public
    }

    /// Sign exactly `bytes`.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.signing.sign(bytes).to_bytes())
    }

    /// Raw X25519 agreement with a peer's DH public key.
    pub fn shared_secret(&self, peer: &DhPublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(peer.0);
        self.dh_secret.diffie_hellman(&other).to_bytes()
    }
}

/// Verify `signature` over exactly `bytes`. Invalid key encodings verify as false.
pub fn verify(key: &PublicKey, signature: &Signature, bytes: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(&key.0) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
    key.verify(bytes, &signature).is_ok()
}

/// Derive the 32-byte channel key stored per peer from a raw DH secret.
/// Both sides of a channel derive the same value.
pub fn derive_channel_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"partyline-channel-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Encrypt a private message under a channel key. Returns hex(nonce || ciphertext).
/// The nonce is random per message.
pub fn encrypt_message(key: &[u8; 32], plaintext: &str) -> Result<String, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Decrypt the output of [`encrypt_message`].
pub fn decrypt_message(key: &[u8; 32], enc: &str) -> Result<String, CryptoError> {
    let raw = hex::decode(enc).map_err(|_| CryptoError::Decrypt)?;
    if raw.len() < NONCE_LEN {
        return Err(CryptoError::Decrypt);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let plain = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(plain).map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_derivation() {
        let ident = Identity::generate();
        assert_eq!(NodeId::from_public_key(ident.public_key()), ident.id());
    }

    #[test]
    fn node_id_hex_roundtrip() {
        let id = Identity::generate().id();
        let parsed: NodeId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_hex().len(), 64);
        assert!(id.to_hex().ends_with(&id.short()));
    }

    #[test]
    fn flip_bit_targets_expected_byte() {
        let id = NodeId::from_bytes([0u8; 32]);
        assert_eq!(id.flip_bit(0).as_bytes()[31], 1);
        assert_eq!(id.flip_bit(9).as_bytes()[30], 2);
        assert_eq!(id.flip_bit(255).as_bytes()[0], 0x80);
        assert_eq!(id.flip_bit(7).flip_bit(7), id);
    }

    #[test]
    fn sign_verify() {
        let ident = Identity::generate();
        let sig = ident.sign(b"payload");
        assert!(verify(ident.public_key(), &sig, b"payload"));
        assert!(!verify(ident.public_key(), &sig, b"payload "));
        let other = Identity::generate();
        assert!(!verify(other.public_key(), &sig, b"payload"));
    }

    #[test]
    fn seeds_reproduce_identity() {
        let a = Identity::from_seeds([7u8; 32], [9u8; 32]);
        let b = Identity::from_seeds([7u8; 32], [9u8; 32]);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.dh_public_key(), b.dh_public_key());
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        let secret_a = derive_channel_key(&a.shared_secret(b.dh_public_key()));
        let secret_b = derive_channel_key(&b.shared_secret(a.dh_public_key()));
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let enc = encrypt_message(&key, "hello party").unwrap();
        assert_eq!(decrypt_message(&key, &enc).unwrap(), "hello party");
        // Fresh nonce per message.
        assert_ne!(enc, encrypt_message(&key, "hello party").unwrap());
    }

    #[test]
    fn decrypt_rejects_wrong_key_and_garbage() {
        let key = [1u8; 32];
        let enc = encrypt_message(&key, "secret").unwrap();
        assert!(matches!(
            decrypt_message(&[2u8; 32], &enc),
            Err(CryptoError::Decrypt)
        ));
        assert!(decrypt_message(&key, "zz").is_err());
        assert!(decrypt_message(&key, "00ff").is_err());
    }
}
