//! Service Wrapper
//!
//! Composes the facade, the sharding ring, and the HTTP transport into one
//! runnable service with a starting / running / stopping lifecycle. Startup
//! fails fast on configuration problems; at runtime any subservice failure
//! takes the whole service down rather than limping along half-broken.

use crate::facade::{ResourceServer, ResourceServerOptions};
use crate::index::builder::{DocumentBuilderSupplier, SearchBackend};
use crate::index::types::SearchOptions;
use crate::ring::lifecycler::{Lifecycler, standard_delegate_chain};
use crate::ring::read::Ring;
use crate::ring::store::{GossipRingStore, RingStore, wait_instance_state};
use crate::ring::types::{InstanceState, RingConfig};
use crate::storage::backend::StorageBackend;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::auth::Authenticator;
use super::handlers::router;
use super::subservice::{Subservice, SubserviceFailure, SubserviceManager};

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP bind address. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Bearer token required from service callers; `None` admits everyone
    /// as anonymous.
    pub auth_token: Option<String>,
    pub ring: RingConfig,
    pub worker_threads: usize,
    pub init_min_count: usize,
    pub init_max_count: usize,
    pub rebuild_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            auth_token: None,
            ring: RingConfig::default(),
            worker_threads: 4,
            init_min_count: 0,
            init_max_count: usize::MAX,
            rebuild_interval: Duration::ZERO,
        }
    }
}

impl ServiceConfig {
    /// Startup-time validation; any violation fails construction instead of
    /// surfacing later at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads < 1 {
            return Err(anyhow::anyhow!(
                "search worker threads must be >= 1, got {}",
                self.worker_threads
            ));
        }
        if self.init_min_count > self.init_max_count {
            return Err(anyhow::anyhow!(
                "init min count {} exceeds max count {}",
                self.init_min_count,
                self.init_max_count
            ));
        }
        if self.ring.enabled {
            if self.ring.heartbeat_period >= self.ring.heartbeat_timeout {
                return Err(anyhow::anyhow!(
                    "ring heartbeat period {:?} must be below the timeout {:?}",
                    self.ring.heartbeat_period,
                    self.ring.heartbeat_timeout
                ));
            }
            if self.ring.num_tokens == 0 {
                return Err(anyhow::anyhow!("ring token count must be >= 1"));
            }
        }
        Ok(())
    }
}

/// The runnable search service.
pub struct SearchService {
    cfg: ServiceConfig,
    server: Arc<ResourceServer>,
    auth: Arc<Authenticator>,
    subservices: SubserviceManager,
    failure_rx: mpsc::UnboundedReceiver<SubserviceFailure>,
    lifecycler: Option<Arc<Lifecycler>>,
    ring_store: Option<Arc<dyn RingStore>>,
    cancel: CancellationToken,
    addr_tx: watch::Sender<Option<SocketAddr>>,
}

impl SearchService {
    /// Builds the service with production wiring: a gossip-replicated ring
    /// store when sharding is enabled.
    pub async fn new(
        cfg: ServiceConfig,
        backend: Arc<dyn StorageBackend>,
        search_backend: Arc<dyn SearchBackend>,
        resources: Arc<dyn DocumentBuilderSupplier>,
    ) -> Result<Self> {
        Self::with_ring_store(cfg, backend, search_backend, resources, None).await
    }

    /// Like `new`, but with an injected ring store (tests run several
    /// services against one shared in-memory store).
    pub async fn with_ring_store(
        cfg: ServiceConfig,
        backend: Arc<dyn StorageBackend>,
        search_backend: Arc<dyn SearchBackend>,
        resources: Arc<dyn DocumentBuilderSupplier>,
        ring_store: Option<Arc<dyn RingStore>>,
    ) -> Result<Self> {
        cfg.validate()?;

        let (mut subservices, failure_rx) = SubserviceManager::new();
        let mut lifecycler = None;
        let mut store_handle = None;
        let mut ring = None;

        if cfg.ring.enabled {
            let (store, gossip_addr): (Arc<dyn RingStore>, String) = match ring_store {
                Some(store) => (store, cfg.bind_addr.to_string()),
                None => {
                    let bind = cfg.ring.bind_addr.ok_or_else(|| {
                        anyhow::anyhow!("ring is enabled but no gossip bind address is configured")
                    })?;
                    let gossip = GossipRingStore::bind(bind, cfg.ring.seed_nodes.clone()).await?;
                    gossip.start();
                    let addr = gossip.local_addr().to_string();
                    (gossip, addr)
                }
            };

            let delegate = standard_delegate_chain(&cfg.ring);
            let lc = Lifecycler::new(gossip_addr, cfg.ring.clone(), store.clone(), delegate);
            ring = Some(Ring::new(store.clone(), lc.instance_id().to_string()));
            subservices.add(Arc::new(lc.clone()) as Arc<dyn Subservice>);
            lifecycler = Some(lc);
            store_handle = Some(store);
        }

        let mut search_opts = SearchOptions::new(search_backend, resources);
        search_opts.worker_threads = cfg.worker_threads;
        search_opts.init_min_count = cfg.init_min_count;
        search_opts.init_max_count = cfg.init_max_count;
        search_opts.rebuild_interval = cfg.rebuild_interval;
        search_opts.ring = ring;

        let server = ResourceServer::new(ResourceServerOptions {
            backend: Some(backend),
            search: Some(search_opts),
            ..Default::default()
        })?;

        let auth = Authenticator::new(cfg.auth_token.clone());
        let (addr_tx, _) = watch::channel(None);

        Ok(Self {
            cfg,
            server,
            auth,
            subservices,
            failure_rx,
            lifecycler,
            ring_store: store_handle,
            cancel: CancellationToken::new(),
            addr_tx,
        })
    }

    pub fn resource_server(&self) -> &Arc<ResourceServer> {
        &self.server
    }

    pub fn instance_id(&self) -> Option<String> {
        self.lifecycler
            .as_ref()
            .map(|lc| lc.instance_id().to_string())
    }

    /// Token that shuts the whole service down when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Watch channel publishing the bound HTTP address once the transport
    /// is up.
    pub fn bound_addr(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.addr_tx.subscribe()
    }

    /// Full lifecycle: start, serve until shutdown or failure, stop.
    pub async fn run(mut self) -> Result<()> {
        let stopped_rx = match self.starting().await {
            Ok(rx) => rx,
            Err(e) => {
                // Roll back whatever did come up before reporting
                let _ = self.stopping().await;
                return Err(e);
            }
        };

        let run_result = self.running(stopped_rx).await;
        let stop_result = self.stopping().await;
        run_result.and(stop_result)
    }

    /// Brings everything up in dependency order: subservices, facade init,
    /// the ring ACTIVE transition, and only then the transport, so no
    /// request is answered by an instance the ring does not yet route to.
    async fn starting(&mut self) -> Result<oneshot::Receiver<std::io::Result<()>>> {
        self.subservices.start_all().await?;
        self.server.init().await?;

        if let (Some(lifecycler), Some(store)) = (&self.lifecycler, &self.ring_store) {
            wait_instance_state(
                store.as_ref(),
                lifecycler.instance_id(),
                InstanceState::Joining,
                self.cfg.ring.join_timeout,
            )
            .await?;
            lifecycler.change_state(InstanceState::Active).await?;
        }

        let listener = tokio::net::TcpListener::bind(self.cfg.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("search service listening on {}", local_addr);
        let _ = self.addr_tx.send(Some(local_addr));

        let app = router(self.server.clone(), self.auth.clone());
        let cancel = self.cancel.clone();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            let _ = stopped_tx.send(result);
        });

        Ok(stopped_rx)
    }

    /// Serves until the transport exits, a subservice fails, or the cancel
    /// token fires. A subservice failure is escalated to a service error.
    async fn running(
        &mut self,
        mut stopped_rx: oneshot::Receiver<std::io::Result<()>>,
    ) -> Result<()> {
        tokio::select! {
            result = &mut stopped_rx => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::anyhow!("http transport failed: {}", e)),
                Err(_) => Ok(()),
            },
            failure = self.failure_rx.recv() => match failure {
                Some(f) => Err(anyhow::anyhow!(
                    "subservice failure: {} ({})",
                    f.service,
                    f.error
                )),
                None => Ok(()),
            },
            _ = self.cancel.cancelled() => {
                info!("search service shutdown requested");
                Ok(())
            }
        }
    }

    /// Tears down in reverse order: transport drain, facade stop, then the
    /// subservices (the ring departure last, so peers see LEAVING only once
    /// this instance has stopped answering).
    async fn stopping(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Err(e) = self.server.stop().await {
            warn!("resource server stop reported an error: {}", e);
        }
        self.subservices.stop_all().await
    }
}
