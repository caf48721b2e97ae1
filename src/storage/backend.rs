use super::types::{CollectionStats, Kind, ResourceKey, ResourceObject, WrittenEvent};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;

/// The persistence boundary of the core.
///
/// The real object store lives behind this trait; the core only ever reads,
/// lists, and follows the change feed. Optional capabilities (blob payloads,
/// collection stats) are probed through the `as_*` accessors rather than
/// assumed, so callers degrade gracefully against backends that lack them.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read(&self, key: &ResourceKey) -> Result<Option<ResourceObject>>;

    async fn list(&self, kind: &Kind) -> Result<Vec<ResourceObject>>;

    /// Subscribes to the write-event feed. Every call registers a new
    /// independent receiver; events are delivered to all of them.
    fn watch(&self) -> mpsc::UnboundedReceiver<WrittenEvent>;

    /// Capability probe: large-payload storage.
    fn as_blob_support(&self) -> Option<&dyn BlobSupport> {
        None
    }

    /// Capability probe: native per-kind object counts.
    fn as_stats_provider(&self) -> Option<&dyn StatsProvider> {
        None
    }
}

/// Optional capability: large payloads stored outside the object record,
/// keyed by resource reference.
#[async_trait]
pub trait BlobSupport: Send + Sync {
    async fn get_blob(&self, key: &ResourceKey) -> Result<Option<Vec<u8>>>;
}

/// Optional capability: the backend can report object counts per kind
/// without the core listing every collection.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn collection_stats(&self) -> Result<Vec<CollectionStats>>;
}

/// In-memory storage backend.
///
/// Backs tests and the demo binary. Implements all three capabilities:
/// writes bump a monotonic version counter and feed every registered watcher.
pub struct MemoryBackend {
    objects: DashMap<Kind, DashMap<String, ResourceObject>>,
    blobs: DashMap<ResourceKey, Vec<u8>>,
    version: AtomicI64,
    watchers: Mutex<Vec<mpsc::UnboundedSender<WrittenEvent>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            blobs: DashMap::new(),
            version: AtomicI64::new(0),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Writes an object and notifies watchers. Returns the assigned version.
    pub fn write(
        &self,
        key: ResourceKey,
        value: serde_json::Value,
        manager: Option<String>,
    ) -> i64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let kind = key.kind();

        let previous_version = self
            .objects
            .entry(kind)
            .or_default()
            .insert(
                key.doc_id(),
                ResourceObject {
                    key: key.clone(),
                    resource_version: version,
                    value,
                    manager,
                },
            )
            .map(|old| old.resource_version);

        self.notify(WrittenEvent {
            key,
            resource_version: version,
            previous_version,
        });

        version
    }

    /// Deletes an object. The deletion is announced on the change feed with
    /// the next version so indices can drop the document.
    pub fn delete(&self, key: &ResourceKey) -> Option<i64> {
        let removed = self
            .objects
            .get(&key.kind())
            .and_then(|map| map.remove(&key.doc_id()))
            .map(|(_, old)| old.resource_version);

        if let Some(previous) = removed {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            self.notify(WrittenEvent {
                key: key.clone(),
                resource_version: version,
                previous_version: Some(previous),
            });
        }

        removed
    }

    pub fn put_blob(&self, key: ResourceKey, payload: Vec<u8>) {
        self.blobs.insert(key, payload);
    }

    pub fn current_version(&self) -> i64 {
        self.version.load(Ordering::SeqCst)
    }

    fn notify(&self, event: WrittenEvent) {
        let mut watchers = self.watchers.lock().unwrap();
        // Drop watchers whose receiver has gone away
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, key: &ResourceKey) -> Result<Option<ResourceObject>> {
        Ok(self
            .objects
            .get(&key.kind())
            .and_then(|map| map.get(&key.doc_id()).map(|obj| obj.clone())))
    }

    async fn list(&self, kind: &Kind) -> Result<Vec<ResourceObject>> {
        Ok(self
            .objects
            .get(kind)
            .map(|map| map.iter().map(|entry| entry.value().clone()).collect())
            .unwrap_or_default())
    }

    fn watch(&self) -> mpsc::UnboundedReceiver<WrittenEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push(tx);
        rx
    }

    fn as_blob_support(&self) -> Option<&dyn BlobSupport> {
        Some(self)
    }

    fn as_stats_provider(&self) -> Option<&dyn StatsProvider> {
        Some(self)
    }
}

#[async_trait]
impl BlobSupport for MemoryBackend {
    async fn get_blob(&self, key: &ResourceKey) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|blob| blob.clone()))
    }
}

#[async_trait]
impl StatsProvider for MemoryBackend {
    async fn collection_stats(&self) -> Result<Vec<CollectionStats>> {
        Ok(self
            .objects
            .iter()
            .map(|entry| CollectionStats {
                kind: entry.key().clone(),
                count: entry.value().len(),
            })
            .collect())
    }
}
