//! Key directory: node ID -> verified signing key. Every entry satisfies `id == hash(key)`.

use std::collections::HashMap;

use crate::identity::{NodeId, PublicKey};

/// Check that `id` is the hash of `key`.
pub fn key_matches_id(id: &NodeId, key: &PublicKey) -> bool {
    NodeId::from_public_key(key) == *id
}

#[derive(Debug, Default)]
pub struct KeyDirectory {
    keys: HashMap<NodeId, PublicKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    /// Record a key. Rejects keys that do not hash to `id`.
    pub fn insert(&mut self, id: NodeId, key: PublicKey) -> Result<(), KeyMismatch> {
        if !key_matches_id(&id, &key) {
            return Err(KeyMismatch(id));
        }
        self.keys.insert(id, key);
        Ok(())
    }

    pub fn get(&self, id: &NodeId) -> Option<&PublicKey> {
        self.keys.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.keys.contains_key(id)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<PublicKey> {
        self.keys.remove(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PublicKey)> {
        self.keys.iter()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("key does not hash to {0}")]
pub struct KeyMismatch(pub NodeId);
