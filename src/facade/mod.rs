//! Search/Index Facade Module
//!
//! The RPC-facing resource server. Coordinates one-time initialization
//! (guarded, exactly-once under concurrent callers), exposes search, stats,
//! and managed-object listing, owns the resource-version counter and the
//! write-event broadcaster, and performs orderly shutdown.
//!
//! ## Lifecycle
//! `Uninitialized -> Initializing -> Ready | Failed`, with a terminal
//! `Stopped` entered by `stop()`. Once a terminal state is reached the
//! facade must be reconstructed; it never silently retries.

use crate::broadcast::Broadcaster;
use crate::index::support::IndexManager;
use crate::index::types::{
    CountManagedObjectsRequest, CountManagedObjectsResponse, ListManagedObjectsRequest,
    ListManagedObjectsResponse, ResourceStatsRequest, ResourceStatsResponse, SearchOptions,
    SearchRequest, SearchResponse, WriteEvents,
};
use crate::storage::backend::{BlobSupport, StorageBackend};
use crate::storage::types::{CollectionStats, ResourceKey};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};


/// Default cap on per-response memory: 2 MiB.
pub const DEFAULT_MAX_PAGE_SIZE_BYTES: usize = 1024 * 1024 * 2;

// Rough per-entry size used to translate the page-size cap into a row limit.
const APPROX_REF_BYTES: usize = 256;

/// Observable lifecycle state of the facade.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    /// Initialization failed; the message is returned by every later call.
    Failed(String),
    /// Terminal: `stop()` was called.
    Stopped(String),
}

/// Callbacks for startup and shutdown of owned dependencies.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_init(&self) -> Result<()>;
    async fn on_stop(&self) -> Result<()>;
}

/// Access-control decision point. The default is an always-allow client.
pub trait AccessClient: Send + Sync {
    fn allow(&self, subject: &str, action: &str) -> bool;
}

/// Fixed-verdict access client.
pub struct FixedAccessClient(pub bool);

impl AccessClient for FixedAccessClient {
    fn allow(&self, _subject: &str, _action: &str) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub healthy: bool,
    pub message: Option<String>,
}

/// Liveness responder, answerable even when indexing failed.
#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn is_healthy(&self, req: &HealthCheckRequest) -> Result<HealthCheckResponse>;
}

struct NoopDiagnostics;

#[async_trait]
impl Diagnostics for NoopDiagnostics {
    async fn is_healthy(&self, _req: &HealthCheckRequest) -> Result<HealthCheckResponse> {
        Ok(HealthCheckResponse {
            healthy: true,
            message: None,
        })
    }
}

/// Constructor input for the facade. Only the backend is required; every
/// other collaborator has a safe default.
#[derive(Default)]
pub struct ResourceServerOptions {
    /// Real storage backend. Required.
    pub backend: Option<Arc<dyn StorageBackend>>,

    /// Blob store override. When absent, the backend is probed for native
    /// blob support.
    pub blob: Option<Arc<dyn BlobSupport>>,

    /// Search options; without them `search` reports "not configured".
    pub search: Option<SearchOptions>,

    pub diagnostics: Option<Arc<dyn Diagnostics>>,

    pub access: Option<Arc<dyn AccessClient>>,

    /// Callbacks for startup and shutdown.
    pub lifecycle: Option<Arc<dyn LifecycleHooks>>,

    /// Current time in unix millis; defaults to the wall clock.
    pub now: Option<Arc<dyn Fn() -> i64 + Send + Sync>>,

    /// Maximum size of a response page in bytes; 0 means the default.
    pub max_page_size_bytes: usize,
}

/// The RPC-facing resource search server.
pub struct ResourceServer {
    backend: Arc<dyn StorageBackend>,
    blob: Option<Arc<dyn BlobSupport>>,
    search: Option<Arc<IndexManager>>,
    diagnostics: Arc<dyn Diagnostics>,
    access: Arc<dyn AccessClient>,
    lifecycle: Option<Arc<dyn LifecycleHooks>>,
    now: Arc<dyn Fn() -> i64 + Send + Sync>,
    max_page_size_bytes: usize,

    /// The most recent resource version seen by this server. Owned per
    /// instance so independently constructed facades never share state.
    resource_version: Arc<AtomicI64>,
    broadcaster: Arc<WriteEvents>,

    /// Governs the background watch pump and index maintenance.
    cancel: CancellationToken,

    state: std::sync::Mutex<LifecycleState>,
    init_lock: Mutex<()>,
    /// Error recorded by the first `stop()`, replayed by repeat calls so
    /// every caller observes the same terminal outcome.
    stop_error: std::sync::Mutex<Option<String>>,
}

impl ResourceServer {
    pub fn new(opts: ResourceServerOptions) -> Result<Arc<Self>> {
        let backend = opts
            .backend
            .ok_or_else(|| anyhow::anyhow!("missing storage backend implementation"))?;

        let search = match opts.search {
            Some(search_opts) => Some(IndexManager::new(search_opts, backend.clone())?),
            None => None,
        };

        let max_page_size_bytes = if opts.max_page_size_bytes > 0 {
            opts.max_page_size_bytes
        } else {
            DEFAULT_MAX_PAGE_SIZE_BYTES
        };

        Ok(Arc::new(Self {
            backend,
            blob: opts.blob,
            search,
            diagnostics: opts
                .diagnostics
                .unwrap_or_else(|| Arc::new(NoopDiagnostics)),
            access: opts
                .access
                .unwrap_or_else(|| Arc::new(FixedAccessClient(true))),
            lifecycle: opts.lifecycle,
            now: opts.now.unwrap_or_else(|| {
                Arc::new(|| {
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as i64
                })
            }),
            max_page_size_bytes,
            resource_version: Arc::new(AtomicI64::new(0)),
            broadcaster: Arc::new(Broadcaster::default()),
            cancel: CancellationToken::new(),
            state: std::sync::Mutex::new(LifecycleState::Uninitialized),
            init_lock: Mutex::new(()),
            stop_error: std::sync::Mutex::new(None),
        }))
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.state.lock().unwrap().clone()
    }

    fn set_state(&self, next: LifecycleState) {
        *self.state.lock().unwrap() = next;
    }

    /// The most recent write version observed; reads are lock-free and never
    /// decrease.
    pub fn resource_version(&self) -> i64 {
        self.resource_version.load(Ordering::SeqCst)
    }

    pub fn broadcaster(&self) -> &Arc<WriteEvents> {
        &self.broadcaster
    }

    pub fn access_client(&self) -> &Arc<dyn AccessClient> {
        &self.access
    }

    pub fn now_ms(&self) -> i64 {
        (self.now)()
    }

    /// One-time initialization: lifecycle hooks first, then the index build
    /// policy. Idempotent and exactly-once under concurrency; concurrent
    /// callers wait on the guard and receive the cached outcome.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;

        match self.lifecycle_state() {
            LifecycleState::Ready => return Ok(()),
            LifecycleState::Failed(msg) | LifecycleState::Stopped(msg) => {
                return Err(anyhow::anyhow!("{}", msg));
            }
            LifecycleState::Uninitialized => {}
            // Unreachable while the guard is held
            LifecycleState::Initializing => {}
        }

        self.set_state(LifecycleState::Initializing);

        match self.run_init().await {
            Ok(()) => {
                info!("resource server initialized");
                self.set_state(LifecycleState::Ready);
                Ok(())
            }
            Err(e) => {
                error!("resource server init failed: {}", e);
                self.set_state(LifecycleState::Failed(format!(
                    "initialize resource server: {}",
                    e
                )));
                Err(e)
            }
        }
    }

    async fn run_init(&self) -> Result<()> {
        if let Some(hooks) = &self.lifecycle {
            hooks.on_init().await?;
        }

        self.spawn_watch_pump();

        if let Some(search) = &self.search {
            search.init(&self.cancel, &self.broadcaster).await?;
        }
        Ok(())
    }

    /// Pumps the backend change feed into the broadcaster, bumping the
    /// resource-version counter first so readers never observe a version
    /// behind an already-delivered event.
    fn spawn_watch_pump(&self) {
        let mut watch = self.backend.watch();
        let version = self.resource_version.clone();
        let broadcaster = self.broadcaster.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = watch.recv() => match event {
                        Some(event) => {
                            version.fetch_max(event.resource_version, Ordering::SeqCst);
                            broadcaster.publish(event);
                        }
                        None => break,
                    }
                }
            }
        });
    }

    fn check_not_stopped(&self) -> Result<()> {
        match self.lifecycle_state() {
            LifecycleState::Stopped(msg) => Err(anyhow::anyhow!("{}", msg)),
            _ => Ok(()),
        }
    }

    /// Search does not implicitly initialize: an uninitialized facade simply
    /// has nothing built yet, which surfaces as a lazy build or an error
    /// from the index subsystem.
    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        self.check_not_stopped()?;
        if let LifecycleState::Failed(msg) = self.lifecycle_state() {
            return Err(anyhow::anyhow!("{}", msg));
        }

        let search = self
            .search
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("search index not configured"))?;

        let mut req = req.clone();
        let cap = self.max_page_size_bytes / APPROX_REF_BYTES;
        req.limit = Some(req.limit.unwrap_or(cap).min(cap));
        search.search(&req).await
    }

    pub async fn get_stats(&self, req: &ResourceStatsRequest) -> Result<ResourceStatsResponse> {
        self.check_not_stopped()?;
        self.init().await?;

        match &self.search {
            Some(search) => search.get_stats(req).await,
            None => {
                // No index subsystem: fall back to the backend's native
                // stats capability when it has one.
                let provider = self
                    .backend
                    .as_stats_provider()
                    .ok_or_else(|| anyhow::anyhow!("search index not configured"))?;
                let mut stats: Vec<CollectionStats> = provider.collection_stats().await?;
                if let Some(kind) = &req.kind {
                    stats.retain(|s| &s.kind == kind);
                }
                Ok(ResourceStatsResponse { stats })
            }
        }
    }

    pub async fn list_managed_objects(
        &self,
        req: &ListManagedObjectsRequest,
    ) -> Result<ListManagedObjectsResponse> {
        self.check_not_stopped()?;
        let search = self
            .search
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("search index not configured"))?;
        if self.lifecycle_state() != LifecycleState::Ready {
            return Err(anyhow::anyhow!("resource server is not initialized"));
        }

        let mut req = req.clone();
        let cap = self.max_page_size_bytes / APPROX_REF_BYTES;
        req.limit = Some(req.limit.unwrap_or(cap).min(cap));
        search.list_managed_objects(&req).await
    }

    pub async fn count_managed_objects(
        &self,
        req: &CountManagedObjectsRequest,
    ) -> Result<CountManagedObjectsResponse> {
        self.check_not_stopped()?;
        let search = self
            .search
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("search index not configured"))?;
        if self.lifecycle_state() != LifecycleState::Ready {
            return Err(anyhow::anyhow!("resource server is not initialized"));
        }
        search.count_managed_objects(req).await
    }

    /// Liveness is answerable independently of index readiness.
    pub async fn is_healthy(&self, req: &HealthCheckRequest) -> Result<HealthCheckResponse> {
        self.diagnostics.is_healthy(req).await
    }

    /// Fetches a large payload via the blob override or the backend's
    /// native blob capability.
    pub async fn get_blob(&self, key: &ResourceKey) -> Result<Option<Vec<u8>>> {
        self.check_not_stopped()?;
        if let Some(blob) = &self.blob {
            return blob.get_blob(key).await;
        }
        match self.backend.as_blob_support() {
            Some(blob) => blob.get_blob(key).await,
            None => Err(anyhow::anyhow!("blob storage not configured")),
        }
    }

    /// Terminal shutdown. Idempotent: repeat calls re-run no side effects
    /// and report the same terminal outcome as the first call.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if let LifecycleState::Stopped(_) = *state {
                return match &*self.stop_error.lock().unwrap() {
                    Some(msg) => Err(anyhow::anyhow!("{}", msg)),
                    None => Ok(()),
                };
            }
            *state = LifecycleState::Stopped("service is stopping".to_string());
        }

        // Halts the watch pump, index maintenance, and periodic rebuilds
        self.cancel.cancel();

        let mut stop_error = None;
        if let Some(hooks) = &self.lifecycle
            && let Err(e) = hooks.on_stop().await
        {
            stop_error = Some(e);
        }

        match stop_error {
            Some(e) => {
                let msg = format!("service stopped with error: {}", e);
                *self.stop_error.lock().unwrap() = Some(msg.clone());
                self.set_state(LifecycleState::Stopped(msg));
                Err(e)
            }
            None => {
                self.set_state(LifecycleState::Stopped("service is stopped".to_string()));
                Ok(())
            }
        }
    }
}
