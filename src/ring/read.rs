use super::store::RingStore;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Read handle over the ring: answers shard-ownership questions for index
/// builders and query routing. Never mutates membership.
pub struct Ring {
    store: Arc<dyn RingStore>,
    local_id: String,
}

impl Ring {
    pub fn new(store: Arc<dyn RingStore>, local_id: String) -> Arc<Self> {
        Arc::new(Self { store, local_id })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Hashes an arbitrary key into the ring's token space.
    pub fn hash(key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }

    /// The instance owning `hash`: the member holding the first token at or
    /// after it, wrapping around the hash space. `None` on an empty ring.
    pub async fn owner_of(&self, hash: u32) -> Option<String> {
        let desc = self.store.get().await;
        let tokens = desc.sorted_tokens();
        if tokens.is_empty() {
            return None;
        }
        let owner = tokens
            .iter()
            .find(|(token, _)| *token >= hash)
            .or_else(|| tokens.first())
            .map(|(_, id)| id.to_string());
        owner
    }

    /// Whether this instance owns `hash`. An empty ring means no ownership
    /// has been established yet, in which case we claim everything rather
    /// than index nothing.
    pub async fn owns(&self, hash: u32) -> bool {
        match self.owner_of(hash).await {
            Some(owner) => owner == self.local_id,
            None => true,
        }
    }
}
