//! Index Build Policy & Worker Pool
//!
//! Decides at startup, per resource kind, whether to build a full index,
//! defer to a lazy build on first query, or install an empty placeholder,
//! and executes the chosen builds with bounded parallelism. Afterwards it
//! keeps indices current from the write-event broadcaster and optionally
//! rebuilds everything on a cadence.
//!
//! ## Failure Semantics
//! One kind's build failure never aborts the others: the kind is recorded as
//! failed, queries against it report "not ready", and a later rebuild can
//! recover it.

use super::builder::{DocumentBuilderSupplier, SearchBackend, count_by_manager};
use super::types::{
    CountManagedObjectsRequest, CountManagedObjectsResponse, IndexAction, IndexEvent,
    IndexHandle, ListManagedObjectsRequest, ListManagedObjectsResponse, ManagerCount,
    ResourceStatsRequest, ResourceStatsResponse, SearchOptions, SearchRequest, SearchResponse,
    WriteEvents,
};
use crate::broadcast::EventDelivery;
use crate::ring::read::Ring;
use crate::storage::backend::StorageBackend;
use crate::storage::types::{CollectionStats, Kind, WrittenEvent};

use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Index readiness for one kind.
#[derive(Debug, Clone)]
enum IndexState {
    /// Tracked, but nothing built yet; the first query builds it.
    Pending,
    /// A current index exists. `empty` marks the intentionally empty
    /// placeholder installed for oversized collections, which must not be
    /// re-attempted on query.
    Ready { handle: IndexHandle, empty: bool },
    /// The last build failed; queries report the recorded error.
    Failed(String),
}

/// Coordinates index construction and maintenance for every tracked kind.
pub struct IndexManager {
    storage: Arc<dyn StorageBackend>,
    search: Arc<dyn SearchBackend>,
    resources: Arc<dyn DocumentBuilderSupplier>,
    init_min_count: usize,
    init_max_count: usize,
    rebuild_interval: Duration,
    index_events: Option<mpsc::UnboundedSender<IndexEvent>>,
    ring: Option<Arc<Ring>>,

    states: DashMap<Kind, IndexState>,
    build_locks: DashMap<Kind, Arc<Mutex<()>>>,
    build_sem: Arc<Semaphore>,
}

impl IndexManager {
    pub fn new(opts: SearchOptions, storage: Arc<dyn StorageBackend>) -> Result<Arc<Self>> {
        if opts.worker_threads < 1 {
            return Err(anyhow::anyhow!(
                "search worker threads must be >= 1, got {}",
                opts.worker_threads
            ));
        }

        Ok(Arc::new(Self {
            storage,
            search: opts.backend,
            resources: opts.resources,
            init_min_count: opts.init_min_count,
            init_max_count: opts.init_max_count,
            rebuild_interval: opts.rebuild_interval,
            index_events: opts.index_events,
            ring: opts.ring,
            states: DashMap::new(),
            build_locks: DashMap::new(),
            build_sem: Arc::new(Semaphore::new(opts.worker_threads)),
        }))
    }

    /// Applies the startup build policy and starts the maintenance tasks.
    ///
    /// Per-kind build failures are recorded, not returned: only setup-level
    /// problems (e.g. the backend refusing to list counts) fail init.
    pub async fn init(self: &Arc<Self>, cancel: &CancellationToken, events: &WriteEvents) -> Result<()> {
        let counts = self.collection_counts().await?;

        let mut full_builds = Vec::new();
        for kind in self.resources.kinds() {
            if !self.owned(&kind).await {
                debug!("skipping {}: owned by another instance", kind);
                continue;
            }

            let count = counts.get(&kind).copied().unwrap_or(0);
            if count < self.init_min_count {
                info!(
                    "deferring index build for {} ({} objects < min {})",
                    kind, count, self.init_min_count
                );
                self.states.insert(kind.clone(), IndexState::Pending);
                self.emit(&kind, IndexAction::BuildSkipped);
            } else if count > self.init_max_count {
                info!(
                    "installing empty index for {} ({} objects > max {})",
                    kind, count, self.init_max_count
                );
                match self.search.build_index(&kind, Vec::new()).await {
                    Ok(handle) => {
                        self.states
                            .insert(kind.clone(), IndexState::Ready { handle, empty: true });
                        self.emit(&kind, IndexAction::BuildEmpty);
                    }
                    Err(e) => {
                        self.states
                            .insert(kind.clone(), IndexState::Failed(e.to_string()));
                        self.emit(&kind, IndexAction::BuildFailed { error: e.to_string() });
                    }
                }
            } else {
                self.states.insert(kind.clone(), IndexState::Pending);
                full_builds.push(kind);
            }
        }

        // Bounded worker pool: each build task takes a semaphore permit, so
        // at most worker_threads builds run concurrently.
        let mut handles = Vec::new();
        for kind in full_builds {
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                manager.build_kind(&kind).await;
            }));
        }
        for handle in handles {
            // A panicking build task only loses that kind, like a failed one
            if let Err(e) = handle.await {
                warn!("index build task panicked: {}", e);
            }
        }

        self.spawn_maintenance(cancel.clone(), events);
        if self.rebuild_interval > Duration::ZERO {
            self.spawn_periodic_rebuild(cancel.clone());
        }

        Ok(())
    }

    /// Per-kind object counts, preferring the backend's native stats
    /// capability over listing every collection.
    async fn collection_counts(&self) -> Result<HashMap<Kind, usize>> {
        if let Some(stats) = self.storage.as_stats_provider() {
            let all = stats.collection_stats().await?;
            return Ok(all.into_iter().map(|s| (s.kind, s.count)).collect());
        }

        let mut counts = HashMap::new();
        for kind in self.resources.kinds() {
            let objects = self.storage.list(&kind).await?;
            counts.insert(kind, objects.len());
        }
        Ok(counts)
    }

    async fn owned(&self, kind: &Kind) -> bool {
        match &self.ring {
            Some(ring) => ring.owns(Ring::hash(&kind.to_string())).await,
            None => true,
        }
    }

    /// Runs one full build for a kind, bounded by the worker pool and
    /// serialized per kind. Records the outcome in the state table.
    async fn build_kind(&self, kind: &Kind) {
        let lock = self
            .build_locks
            .entry(kind.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let _permit = self
            .build_sem
            .acquire()
            .await
            .expect("build semaphore never closes");

        self.emit(kind, IndexAction::BuildStarted);
        match self.build_kind_inner(kind).await {
            Ok(doc_count) => {
                info!("index build completed for {} ({} docs)", kind, doc_count);
                self.emit(kind, IndexAction::BuildCompleted { doc_count });
            }
            Err(e) => {
                warn!("index build failed for {}: {}", kind, e);
                self.states
                    .insert(kind.clone(), IndexState::Failed(e.to_string()));
                self.emit(kind, IndexAction::BuildFailed { error: e.to_string() });
            }
        }
    }

    async fn build_kind_inner(&self, kind: &Kind) -> Result<usize> {
        let builder = self
            .resources
            .builder_for(kind)
            .ok_or_else(|| anyhow::anyhow!("no document builder registered for {}", kind))?;

        let objects = self.storage.list(kind).await?;
        let mut docs = Vec::with_capacity(objects.len());
        for obj in objects.iter() {
            docs.push(builder.build_document(obj).await?);
        }

        let doc_count = docs.len();
        let handle = self.search.build_index(kind, docs).await?;
        self.states
            .insert(kind.clone(), IndexState::Ready { handle, empty: false });
        Ok(doc_count)
    }

    /// Resolves a queryable index for a kind, lazily building when pending.
    async fn ready_handle(&self, kind: &Kind) -> Result<IndexHandle> {
        match self.states.get(kind).map(|s| s.clone()) {
            Some(IndexState::Ready { handle, .. }) => return Ok(handle),
            Some(IndexState::Failed(msg)) => {
                return Err(anyhow::anyhow!("index for {} is not ready: {}", kind, msg));
            }
            Some(IndexState::Pending) | None => {}
        }

        if self.resources.builder_for(kind).is_none() {
            return Err(anyhow::anyhow!("no document builder registered for {}", kind));
        }

        // A kind the ring assigned elsewhere must not be built here lazily
        if !self.owned(kind).await {
            return Err(anyhow::anyhow!(
                "index for {} is not owned by this instance",
                kind
            ));
        }

        // Lazy build on first query
        self.build_kind(kind).await;
        match self.states.get(kind).map(|s| s.clone()) {
            Some(IndexState::Ready { handle, .. }) => Ok(handle),
            Some(IndexState::Failed(msg)) => {
                Err(anyhow::anyhow!("index for {} is not ready: {}", kind, msg))
            }
            _ => Err(anyhow::anyhow!("index for {} is not ready", kind)),
        }
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        let handle = self.ready_handle(&req.kind).await?;
        self.search.query(handle, req).await
    }

    /// Stats over the tracked indices. A kind filter narrows the report.
    pub async fn get_stats(&self, req: &ResourceStatsRequest) -> Result<ResourceStatsResponse> {
        // Snapshot first: the map guard must not be held across an await,
        // or a concurrent build's insert blocks the executor on the shard
        // lock while the awaited future can never resume.
        let ready = self.ready_snapshot(req.kind.as_ref());

        let mut stats = Vec::new();
        for (kind, handle) in ready {
            stats.push(CollectionStats {
                count: self.search.doc_count(handle).await?,
                kind,
            });
        }
        stats.sort_by(|a, b| a.kind.to_string().cmp(&b.kind.to_string()));
        Ok(ResourceStatsResponse { stats })
    }

    /// `(kind, handle)` pairs of every ready index, optionally filtered.
    /// Collects under the map guard so callers can await freely afterwards.
    fn ready_snapshot(&self, wanted: Option<&Kind>) -> Vec<(Kind, IndexHandle)> {
        self.states
            .iter()
            .filter_map(|entry| {
                if let Some(wanted) = wanted
                    && wanted != entry.key()
                {
                    return None;
                }
                match entry.value() {
                    IndexState::Ready { handle, .. } => Some((entry.key().clone(), *handle)),
                    _ => None,
                }
            })
            .collect()
    }

    pub async fn list_managed_objects(
        &self,
        req: &ListManagedObjectsRequest,
    ) -> Result<ListManagedObjectsResponse> {
        let mut objects = Vec::new();
        for (_, handle) in self.ready_snapshot(None) {
            objects.extend(
                self.search
                    .list_managed(handle, req.manager.as_deref())
                    .await?,
            );
        }
        objects.sort_by(|a, b| a.key.doc_id().cmp(&b.key.doc_id()));

        let total_count = objects.len();
        let offset = req.offset.unwrap_or(0);
        let limit = req.limit.unwrap_or(total_count);
        let objects = objects.into_iter().skip(offset).take(limit).collect();

        Ok(ListManagedObjectsResponse {
            total_count,
            objects,
        })
    }

    pub async fn count_managed_objects(
        &self,
        req: &CountManagedObjectsRequest,
    ) -> Result<CountManagedObjectsResponse> {
        let listed = self
            .list_managed_objects(&ListManagedObjectsRequest {
                manager: req.manager.clone(),
                limit: None,
                offset: None,
            })
            .await?;

        let mut counts: Vec<ManagerCount> = count_by_manager(&listed.objects)
            .into_iter()
            .map(|(manager, count)| ManagerCount { manager, count })
            .collect();
        counts.sort_by(|a, b| a.manager.cmp(&b.manager));
        Ok(CountManagedObjectsResponse { counts })
    }

    /// Rebuilds every tracked kind, regardless of current state.
    pub async fn rebuild_all(self: &Arc<Self>) {
        let kinds: Vec<Kind> = self.states.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::new();
        for kind in kinds {
            self.emit(&kind, IndexAction::RebuildStarted);
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                manager.build_kind(&kind).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn_periodic_rebuild(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.rebuild_interval);
            // The first tick fires immediately; skip it so the cadence starts
            // one interval after init.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        debug!("periodic index rebuild triggered");
                        manager.rebuild_all().await;
                    }
                }
            }
        });
    }

    /// Keeps ready indices current from the write-event broadcaster. A lag
    /// means events were dropped, so the fallback is a full rebuild.
    fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken, events: &WriteEvents) {
        let mut stream = events.subscribe();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    delivery = stream.recv() => match delivery {
                        EventDelivery::Event(event) => {
                            if let Err(e) = manager.apply_event(&event).await {
                                warn!("failed to apply write event to index: {}", e);
                            }
                        }
                        EventDelivery::Lagged { missed } => {
                            warn!("index maintainer lagged {} events, rebuilding", missed);
                            manager.rebuild_all().await;
                        }
                        EventDelivery::Closed => break,
                    }
                }
            }
        });
    }

    async fn apply_event(&self, event: &WrittenEvent) -> Result<()> {
        let kind = event.key.kind();
        let handle = match self.states.get(&kind).map(|s| s.clone()) {
            Some(IndexState::Ready { handle, .. }) => handle,
            // Pending kinds get the write at lazy-build time; failed kinds
            // stay failed until a rebuild.
            _ => return Ok(()),
        };

        match self.storage.read(&event.key).await? {
            Some(obj) => {
                let builder = self
                    .resources
                    .builder_for(&kind)
                    .ok_or_else(|| anyhow::anyhow!("no document builder registered for {}", kind))?;
                let doc = builder.build_document(&obj).await?;
                self.search.update_document(handle, doc).await?;
            }
            None => {
                self.search.delete_document(handle, &event.key).await?;
            }
        }

        self.emit(
            &kind,
            IndexAction::Updated {
                resource_version: event.resource_version,
            },
        );
        Ok(())
    }

    fn emit(&self, kind: &Kind, action: IndexAction) {
        if let Some(tx) = &self.index_events {
            let _ = tx.send(IndexEvent {
                kind: kind.clone(),
                action,
            });
        }
    }
}
