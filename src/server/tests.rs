//! Server Module Tests
//!
//! Validates configuration fail-fast, the authenticator, the subservice
//! manager's ordering guarantees, and the full service lifecycle against an
//! in-memory ring store.
//!
//! ## Test Scopes
//! - **Config**: Invalid configurations are rejected at construction.
//! - **Auth**: Token match, anonymous fallback, hard rejection.
//! - **Subservices**: Start order, rollback on failure, reverse-order stop.
//! - **Lifecycle**: A single instance reaches ACTIVE and leaves on shutdown.

#[cfg(test)]
mod tests {
    use crate::index::builder::{JsonDocumentBuilder, MemorySearchBackend, StaticBuilderSupplier};
    use crate::ring::store::{MemoryRingStore, RingMutator, RingStore, wait_instance_state};
    use crate::ring::types::{InstanceState, RingConfig, RingDesc};
    use crate::server::auth::{Authenticator, Identity};
    use crate::server::service::{SearchService, ServiceConfig};
    use crate::server::subservice::{Subservice, SubserviceFailure, SubserviceManager};
    use crate::storage::backend::MemoryBackend;
    use crate::storage::types::{Kind, ResourceKey};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn test_ring_config() -> RingConfig {
        RingConfig {
            enabled: true,
            heartbeat_timeout: Duration::from_millis(500),
            heartbeat_period: Duration::from_millis(50),
            num_tokens: 16,
            join_timeout: Duration::from_millis(300),
            keep_in_ring_on_shutdown: false,
            bind_addr: None,
            seed_nodes: Vec::new(),
        }
    }

    fn populated_backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        for i in 0..5 {
            backend.write(
                ResourceKey::new(
                    "dashboards.example.io",
                    "dashboards",
                    "default",
                    &format!("dash-{}", i),
                ),
                serde_json::json!({"title": format!("dashboard {}", i)}),
                None,
            );
        }
        backend
    }

    fn supplier() -> Arc<StaticBuilderSupplier> {
        let supplier = StaticBuilderSupplier::new();
        supplier.register(
            Kind::new("dashboards.example.io", "dashboards"),
            Arc::new(JsonDocumentBuilder),
        );
        supplier
    }

    async fn build_service(
        cfg: ServiceConfig,
        store: Option<Arc<dyn RingStore>>,
    ) -> Result<SearchService> {
        SearchService::with_ring_store(
            cfg,
            populated_backend(),
            MemorySearchBackend::new(),
            supplier(),
            store,
        )
        .await
    }

    // ============================================================
    // CONFIG VALIDATION
    // ============================================================

    #[tokio::test]
    async fn test_zero_worker_threads_rejected() {
        let cfg = ServiceConfig {
            worker_threads: 0,
            ..Default::default()
        };

        let err = build_service(cfg, None).await.err().unwrap();

        assert!(err.to_string().contains("worker threads must be >= 1"));
    }

    #[tokio::test]
    async fn test_inverted_count_thresholds_rejected() {
        let cfg = ServiceConfig {
            init_min_count: 100,
            init_max_count: 10,
            ..Default::default()
        };

        let err = build_service(cfg, None).await.err().unwrap();

        assert!(err.to_string().contains("exceeds max count"));
    }

    #[tokio::test]
    async fn test_heartbeat_period_must_undercut_timeout() {
        let mut ring = test_ring_config();
        ring.heartbeat_period = Duration::from_secs(30);
        let cfg = ServiceConfig {
            ring,
            ..Default::default()
        };

        let err = build_service(cfg, None).await.err().unwrap();

        assert!(err.to_string().contains("must be below the timeout"));
    }

    #[tokio::test]
    async fn test_ring_without_gossip_address_rejected() {
        let cfg = ServiceConfig {
            ring: test_ring_config(),
            ..Default::default()
        };

        // No injected store and no gossip bind address configured
        let err = build_service(cfg, None).await.err().unwrap();

        assert!(err.to_string().contains("no gossip bind address"));
    }

    // ============================================================
    // AUTHENTICATION
    // ============================================================

    #[test]
    fn test_matching_token_authenticates_as_service() {
        let auth = Authenticator::new(Some("sekrit".to_string()));

        assert_eq!(
            auth.authenticate(Some("Bearer sekrit")),
            Some(Identity::Service)
        );
    }

    #[test]
    fn test_wrong_token_is_rejected_outright() {
        let auth = Authenticator::new(Some("sekrit".to_string()));

        assert_eq!(auth.authenticate(Some("Bearer wrong")), None);
        assert_eq!(auth.authenticate(Some("Bearer ")), None);
    }

    #[test]
    fn test_missing_credentials_fall_back_to_anonymous() {
        let auth = Authenticator::new(Some("sekrit".to_string()));

        assert_eq!(auth.authenticate(None), Some(Identity::Anonymous));
        // A malformed header carries no bearer token at all
        assert_eq!(
            auth.authenticate(Some("Basic dXNlcg==")),
            Some(Identity::Anonymous)
        );
    }

    #[test]
    fn test_no_configured_token_admits_everyone() {
        let auth = Authenticator::new(None);

        assert_eq!(auth.authenticate(None), Some(Identity::Anonymous));
        assert_eq!(
            auth.authenticate(Some("Bearer anything")),
            Some(Identity::Anonymous)
        );
    }

    // ============================================================
    // SUBSERVICE MANAGER
    // ============================================================

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    }

    impl Recorder {
        fn new(name: &str, log: Arc<Mutex<Vec<String>>>, fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log,
                fail_start,
            })
        }
    }

    #[async_trait]
    impl Subservice for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self, _failures: mpsc::UnboundedSender<SubserviceFailure>) -> Result<()> {
            if self.fail_start {
                return Err(anyhow::anyhow!("{} refused to start", self.name));
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_subservices_start_in_order_and_stop_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut manager, _failures) = SubserviceManager::new();
        manager.add(Recorder::new("a", log.clone(), false));
        manager.add(Recorder::new("b", log.clone(), false));
        manager.add(Recorder::new("c", log.clone(), false));

        manager.start_all().await.unwrap();
        manager.stop_all().await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec!["start a", "start b", "start c", "stop c", "stop b", "stop a"]
        );
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_started_subservices() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut manager, _failures) = SubserviceManager::new();
        manager.add(Recorder::new("a", log.clone(), false));
        manager.add(Recorder::new("b", log.clone(), true));
        manager.add(Recorder::new("c", log.clone(), false));

        let err = manager.start_all().await.unwrap_err();

        assert!(err.to_string().contains("b refused to start"));
        let log = log.lock().unwrap();
        // c never started; a was rolled back
        assert_eq!(*log, vec!["start a", "stop a"]);
    }

    #[tokio::test]
    async fn test_failure_channel_reaches_the_watcher() {
        struct Failing;

        #[async_trait]
        impl Subservice for Failing {
            fn name(&self) -> &str {
                "failing"
            }

            async fn start(
                &self,
                failures: mpsc::UnboundedSender<SubserviceFailure>,
            ) -> Result<()> {
                tokio::spawn(async move {
                    let _ = failures.send(SubserviceFailure {
                        service: "failing".to_string(),
                        error: "lost its backing store".to_string(),
                    });
                });
                Ok(())
            }

            async fn stop(&self) -> Result<()> {
                Ok(())
            }
        }

        let (mut manager, mut failures) = SubserviceManager::new();
        manager.add(Arc::new(Failing));
        manager.start_all().await.unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(2), failures.recv())
            .await
            .expect("timed out waiting for failure")
            .expect("failure channel closed");
        assert_eq!(failure.service, "failing");
        assert!(failure.error.contains("backing store"));
    }

    // ============================================================
    // SERVICE LIFECYCLE
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_instance_reaches_active_and_leaves_on_shutdown() {
        let store = MemoryRingStore::new();
        let cfg = ServiceConfig {
            ring: test_ring_config(),
            ..Default::default()
        };
        let service = build_service(cfg, Some(Arc::new(store.clone()))).await.unwrap();
        let instance_id = service.instance_id().unwrap();
        let cancel = service.cancel_token();

        let runner = tokio::spawn(service.run());

        wait_instance_state(
            &store,
            &instance_id,
            InstanceState::Active,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        cancel.cancel();
        runner.await.unwrap().unwrap();

        let desc = store.get().await;
        assert_eq!(
            desc.instance(&instance_id).unwrap().state,
            InstanceState::Forgotten
        );
    }

    /// Store that accepts writes but never reflects them in reads, like a
    /// gossip store cut off from its peers before converging.
    struct AmnesicStore;

    #[async_trait]
    impl RingStore for AmnesicStore {
        async fn get(&self) -> RingDesc {
            RingDesc::default()
        }

        async fn update(&self, mutator: RingMutator) -> Result<RingDesc> {
            let mut scratch = RingDesc::default();
            mutator(&mut scratch);
            Ok(scratch)
        }
    }

    #[tokio::test]
    async fn test_startup_never_serves_when_registration_stays_invisible() {
        let cfg = ServiceConfig {
            ring: test_ring_config(),
            ..Default::default()
        };
        let service = build_service(cfg, Some(Arc::new(AmnesicStore)))
            .await
            .unwrap();
        let addr_rx = service.bound_addr();

        let err = service.run().await.unwrap_err();

        assert!(err.to_string().contains("timed out"));
        // The transport must never have come up while the join was pending
        assert!(addr_rx.borrow().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_http_surface_answers_health_and_search() {
        let cfg = ServiceConfig::default();
        let service = build_service(cfg, None).await.unwrap();
        let cancel = service.cancel_token();
        let mut addr_rx = service.bound_addr();

        let runner = tokio::spawn(service.run());

        let addr = tokio::time::timeout(Duration::from_secs(5), async {
            addr_rx.wait_for(|a| a.is_some()).await.unwrap().unwrap()
        })
        .await
        .expect("transport never came up");

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /healthz HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"healthy\":true"));

        let body = r#"{"kind":{"group":"dashboards.example.io","resource":"dashboards"},"query":"dashboard"}"#;
        let request = format!(
            "POST /search HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"total_count\":5"));

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wrong_bearer_token_gets_unauthorized() {
        let cfg = ServiceConfig {
            auth_token: Some("sekrit".to_string()),
            ..Default::default()
        };
        let service = build_service(cfg, None).await.unwrap();
        let cancel = service.cancel_token();
        let mut addr_rx = service.bound_addr();

        let runner = tokio::spawn(service.run());

        let addr = tokio::time::timeout(Duration::from_secs(5), async {
            addr_rx.wait_for(|a| a.is_some()).await.unwrap().unwrap()
        })
        .await
        .expect("transport never came up");

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /routes HTTP/1.1\r\nhost: localhost\r\nauthorization: Bearer wrong\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 401"));

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }
}
