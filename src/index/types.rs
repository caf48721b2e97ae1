use crate::broadcast::Broadcaster;
use crate::ring::read::Ring;
use crate::storage::types::{CollectionStats, Kind, ResourceKey, WrittenEvent};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::builder::{DocumentBuilderSupplier, SearchBackend};

/// Configuration bundle for the index subsystem. Immutable after construction.
#[derive(Clone)]
pub struct SearchOptions {
    /// The raw index backend (term index, column store, ...).
    pub backend: Arc<dyn SearchBackend>,

    /// The supported resource kinds and their document builders.
    pub resources: Arc<dyn DocumentBuilderSupplier>,

    /// How many concurrent workers build indexes.
    pub worker_threads: usize,

    /// Skip building an index at startup for collections below this count;
    /// the first query triggers a lazy build instead.
    pub init_min_count: usize,

    /// Build an empty index at startup for collections above this count so
    /// that later queries don't re-attempt a full build.
    pub init_max_count: usize,

    /// Interval for periodic full rebuilds (zero disables them).
    pub rebuild_interval: Duration,

    /// Channel to observe index transitions (for testing).
    pub index_events: Option<mpsc::UnboundedSender<IndexEvent>>,

    /// Sharding ring handle; `None` means this instance owns every kind.
    pub ring: Option<Arc<Ring>>,
}

impl SearchOptions {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        resources: Arc<dyn DocumentBuilderSupplier>,
    ) -> Self {
        Self {
            backend,
            resources,
            worker_threads: 4,
            init_min_count: 0,
            init_max_count: usize::MAX,
            rebuild_interval: Duration::ZERO,
            index_events: None,
            ring: None,
        }
    }
}

/// A notification of an index transition, emitted on the test-observation
/// channel so tests synchronize deterministically instead of sleeping.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEvent {
    pub kind: Kind,
    pub action: IndexAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexAction {
    /// A full build has begun for this kind.
    BuildStarted,
    /// Startup skipped this kind (below the min-count threshold).
    BuildSkipped,
    /// Startup installed an empty index (above the max-count threshold).
    BuildEmpty,
    BuildCompleted { doc_count: usize },
    BuildFailed { error: String },
    /// An incremental update was applied from the change feed.
    Updated { resource_version: i64 },
    /// The periodic rebuild timer fired for this kind.
    RebuildStarted,
}

/// Handle to one built index, issued by the search backend.
pub type IndexHandle = u64;

// --- RPC request/response DTOs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub kind: Kind,
    /// Free-text query; an empty query matches every document.
    #[serde(default)]
    pub query: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: ResourceKey,
    pub title: String,
    pub score: usize,
    pub resource_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total_count: usize,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatsRequest {
    /// Restrict to one kind; `None` reports everything tracked.
    pub kind: Option<Kind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatsResponse {
    pub stats: Vec<CollectionStats>,
}

/// Reference to an object managed by an external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    pub key: ResourceKey,
    pub manager: String,
    pub resource_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListManagedObjectsRequest {
    /// Restrict to one manager identity; `None` lists all managed objects.
    pub manager: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListManagedObjectsResponse {
    pub total_count: usize,
    pub objects: Vec<ManagedObjectRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountManagedObjectsRequest {
    pub manager: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerCount {
    pub manager: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountManagedObjectsResponse {
    pub counts: Vec<ManagerCount>,
}

/// Shared alias for the broadcaster the facade owns and the index consumes.
pub type WriteEvents = Broadcaster<WrittenEvent>;
