//! Document Builders & Search Backend Capability
//!
//! The concrete index engine is an external collaborator: the core only
//! requires `build_index(documents) -> handle` and `query(handle, request)`.
//! Per-kind `DocumentBuilder`s project stored resources into indexable
//! documents; the supplier yields one builder per supported kind.

use super::tokenizer::{tokenize_query, tokenize_text};
use super::types::{
    IndexHandle, ManagedObjectRef, SearchHit, SearchRequest, SearchResponse,
};
use crate::storage::types::{Kind, ResourceKey, ResourceObject};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a stored resource looks like to the index.
#[derive(Debug, Clone)]
pub struct IndexDocument {
    pub key: ResourceKey,
    pub resource_version: i64,
    pub title: String,
    pub body: String,
    pub manager: Option<String>,
}

/// Per resource-kind logic projecting a stored resource into a document.
#[async_trait]
pub trait DocumentBuilder: Send + Sync {
    async fn build_document(&self, obj: &ResourceObject) -> Result<IndexDocument>;
}

/// Supplies the supported kinds and their builders.
pub trait DocumentBuilderSupplier: Send + Sync {
    fn builder_for(&self, kind: &Kind) -> Option<Arc<dyn DocumentBuilder>>;
    fn kinds(&self) -> Vec<Kind>;
}

/// Simple supplier backed by an explicit registration map.
pub struct StaticBuilderSupplier {
    builders: DashMap<Kind, Arc<dyn DocumentBuilder>>,
}

impl StaticBuilderSupplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            builders: DashMap::new(),
        })
    }

    pub fn register(&self, kind: Kind, builder: Arc<dyn DocumentBuilder>) {
        tracing::info!("registered document builder for {}", kind);
        self.builders.insert(kind, builder);
    }
}

impl DocumentBuilderSupplier for StaticBuilderSupplier {
    fn builder_for(&self, kind: &Kind) -> Option<Arc<dyn DocumentBuilder>> {
        self.builders.get(kind).map(|b| b.clone())
    }

    fn kinds(&self) -> Vec<Kind> {
        self.builders.iter().map(|e| e.key().clone()).collect()
    }
}

/// Default builder: takes the title from the object's `title` field (falling
/// back to its name) and indexes every string value in the payload.
pub struct JsonDocumentBuilder;

#[async_trait]
impl DocumentBuilder for JsonDocumentBuilder {
    async fn build_document(&self, obj: &ResourceObject) -> Result<IndexDocument> {
        let title = obj
            .value
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or(&obj.key.name)
            .to_string();

        let mut body = String::new();
        collect_strings(&obj.value, &mut body);

        Ok(IndexDocument {
            key: obj.key.clone(),
            resource_version: obj.resource_version,
            title,
            body,
            manager: obj.manager.clone(),
        })
    }
}

fn collect_strings(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

/// The injected index engine capability.
///
/// Implementations must tolerate concurrent calls; the worker pool issues up
/// to `worker_threads` builds at once.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Builds (or replaces) the index for one kind from a full document set.
    async fn build_index(&self, kind: &Kind, docs: Vec<IndexDocument>) -> Result<IndexHandle>;

    async fn query(&self, handle: IndexHandle, req: &SearchRequest) -> Result<SearchResponse>;

    /// Applies one incremental document upsert.
    async fn update_document(&self, handle: IndexHandle, doc: IndexDocument) -> Result<()>;

    /// Removes one document.
    async fn delete_document(&self, handle: IndexHandle, key: &ResourceKey) -> Result<()>;

    async fn doc_count(&self, handle: IndexHandle) -> Result<usize>;

    /// Lists documents carrying a manager identity, optionally filtered.
    async fn list_managed(
        &self,
        handle: IndexHandle,
        manager: Option<&str>,
    ) -> Result<Vec<ManagedObjectRef>>;
}

struct MemoryShard {
    docs: DashMap<String, IndexDocument>,
}

/// In-memory term index used by tests and the demo binary.
///
/// Scoring is the count of matched query tokens; an empty query matches every
/// document so callers can page through a whole collection.
pub struct MemorySearchBackend {
    shards: DashMap<IndexHandle, MemoryShard>,
    next_handle: AtomicU64,
}

impl MemorySearchBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shards: DashMap::new(),
            next_handle: AtomicU64::new(1),
        })
    }

    fn shard(
        &self,
        handle: IndexHandle,
    ) -> Result<dashmap::mapref::one::Ref<'_, IndexHandle, MemoryShard>> {
        self.shards
            .get(&handle)
            .ok_or_else(|| anyhow::anyhow!("unknown index handle {}", handle))
    }
}

#[async_trait]
impl SearchBackend for MemorySearchBackend {
    async fn build_index(&self, kind: &Kind, docs: Vec<IndexDocument>) -> Result<IndexHandle> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let shard = MemoryShard {
            docs: DashMap::new(),
        };
        for doc in docs {
            shard.docs.insert(doc.key.doc_id(), doc);
        }
        tracing::debug!(
            "built in-memory index for {} ({} docs, handle {})",
            kind,
            shard.docs.len(),
            handle
        );
        self.shards.insert(handle, shard);
        Ok(handle)
    }

    async fn query(&self, handle: IndexHandle, req: &SearchRequest) -> Result<SearchResponse> {
        let shard = self.shard(handle)?;
        let query_tokens = tokenize_query(&req.query);

        let mut scored: Vec<SearchHit> = Vec::new();
        for entry in shard.docs.iter() {
            let doc = entry.value();
            let score = if query_tokens.is_empty() {
                1
            } else {
                let doc_tokens = tokenize_text(&format!("{} {}", doc.title, doc.body));
                let mut matched = 0;
                for token in query_tokens.iter() {
                    if doc_tokens.contains(token) {
                        matched += 1;
                    }
                }
                matched
            };

            if score > 0 {
                scored.push(SearchHit {
                    key: doc.key.clone(),
                    title: doc.title.clone(),
                    score,
                    resource_version: doc.resource_version,
                });
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.key.doc_id().cmp(&b.key.doc_id()))
        });

        let total_count = scored.len();
        let offset = req.offset.unwrap_or(0);
        let limit = req.limit.unwrap_or(total_count);
        let hits = scored.into_iter().skip(offset).take(limit).collect();

        Ok(SearchResponse { total_count, hits })
    }

    async fn update_document(&self, handle: IndexHandle, doc: IndexDocument) -> Result<()> {
        let shard = self.shard(handle)?;
        shard.docs.insert(doc.key.doc_id(), doc);
        Ok(())
    }

    async fn delete_document(&self, handle: IndexHandle, key: &ResourceKey) -> Result<()> {
        let shard = self.shard(handle)?;
        shard.docs.remove(&key.doc_id());
        Ok(())
    }

    async fn doc_count(&self, handle: IndexHandle) -> Result<usize> {
        Ok(self.shard(handle)?.docs.len())
    }

    async fn list_managed(
        &self,
        handle: IndexHandle,
        manager: Option<&str>,
    ) -> Result<Vec<ManagedObjectRef>> {
        let shard = self.shard(handle)?;
        let mut refs: Vec<ManagedObjectRef> = shard
            .docs
            .iter()
            .filter_map(|entry| {
                let doc = entry.value();
                let owner = doc.manager.as_deref()?;
                if let Some(wanted) = manager
                    && wanted != owner
                {
                    return None;
                }
                Some(ManagedObjectRef {
                    key: doc.key.clone(),
                    manager: owner.to_string(),
                    resource_version: doc.resource_version,
                })
            })
            .collect();
        refs.sort_by(|a, b| a.key.doc_id().cmp(&b.key.doc_id()));
        Ok(refs)
    }
}

/// Counts managed objects per manager identity across a set of refs.
pub fn count_by_manager(refs: &[ManagedObjectRef]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for r in refs {
        *counts.entry(r.manager.clone()).or_insert(0) += 1;
    }
    counts
}
