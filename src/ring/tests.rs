//! Ring Module Tests
//!
//! Validates the membership state machine, the lifecycler delegate chain,
//! and deterministic shard ownership.
//!
//! ## Test Scopes
//! - **State Machine**: Only the documented transitions are allowed.
//! - **Lifecycler**: Registration, heartbeats, auto-forget, graceful leave.
//! - **Ownership**: Token lookup is deterministic and covers the wrap-around.
//! - **Merge**: Gossip merges never resurrect departed members.

#[cfg(test)]
mod tests {
    use crate::ring::lifecycler::{Lifecycler, standard_delegate_chain};
    use crate::ring::read::Ring;
    use crate::ring::store::{MemoryRingStore, RingStore, wait_instance_state};
    use crate::ring::types::{
        InstanceDesc, InstanceState, RingConfig, RingDesc, generate_tokens, now_ms,
    };
    use crate::server::subservice::Subservice;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_config() -> RingConfig {
        RingConfig {
            enabled: true,
            heartbeat_timeout: Duration::from_millis(200),
            heartbeat_period: Duration::from_millis(50),
            num_tokens: 16,
            join_timeout: Duration::from_secs(1),
            keep_in_ring_on_shutdown: false,
            bind_addr: None,
            seed_nodes: Vec::new(),
        }
    }

    fn lifecycler_on(store: &MemoryRingStore, cfg: RingConfig) -> Arc<Lifecycler> {
        let delegate = standard_delegate_chain(&cfg);
        Lifecycler::new(
            "127.0.0.1:9000".to_string(),
            cfg,
            Arc::new(store.clone()),
            delegate,
        )
    }

    fn desc_with(id: &str, state: InstanceState, heartbeat_ms: u64) -> RingDesc {
        let mut desc = RingDesc::default();
        desc.instances.insert(
            id.to_string(),
            InstanceDesc {
                id: id.to_string(),
                addr: "127.0.0.1:9000".to_string(),
                state,
                tokens: vec![1, 2, 3],
                heartbeat_ms,
            },
        );
        desc
    }

    // ============================================================
    // STATE MACHINE
    // ============================================================

    #[test]
    fn test_valid_state_transitions() {
        assert!(InstanceState::Joining.can_transition_to(InstanceState::Active));
        assert!(InstanceState::Active.can_transition_to(InstanceState::Leaving));
        assert!(InstanceState::Joining.can_transition_to(InstanceState::Leaving));
        assert!(InstanceState::Leaving.can_transition_to(InstanceState::Forgotten));
        // Auto-forget may fire from any state
        assert!(InstanceState::Active.can_transition_to(InstanceState::Forgotten));
        assert!(InstanceState::Joining.can_transition_to(InstanceState::Forgotten));
    }

    #[test]
    fn test_invalid_state_transitions() {
        assert!(!InstanceState::Active.can_transition_to(InstanceState::Joining));
        assert!(!InstanceState::Leaving.can_transition_to(InstanceState::Active));
        assert!(!InstanceState::Forgotten.can_transition_to(InstanceState::Active));
        assert!(!InstanceState::Forgotten.can_transition_to(InstanceState::Joining));
    }

    #[test]
    fn test_only_joining_and_active_own_tokens() {
        assert!(InstanceState::Joining.owns_tokens());
        assert!(InstanceState::Active.owns_tokens());
        assert!(!InstanceState::Leaving.owns_tokens());
        assert!(!InstanceState::Forgotten.owns_tokens());
    }

    #[test]
    fn test_generate_tokens_distinct_and_sorted() {
        let tokens = generate_tokens(64);

        assert_eq!(tokens.len(), 64);
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
    }

    // ============================================================
    // LIFECYCLER
    // ============================================================

    #[tokio::test]
    async fn test_register_joins_in_joining_state() {
        let store = MemoryRingStore::new();
        let lifecycler = lifecycler_on(&store, test_config());

        lifecycler.register().await.unwrap();

        let desc = store.get().await;
        let instance = desc.instance(lifecycler.instance_id()).unwrap();
        assert_eq!(instance.state, InstanceState::Joining);
        assert_eq!(instance.tokens.len(), 16);
    }

    #[tokio::test]
    async fn test_reregister_reuses_tokens() {
        let store = MemoryRingStore::new();
        let lifecycler = lifecycler_on(&store, test_config());

        lifecycler.register().await.unwrap();
        let first_tokens = store
            .get()
            .await
            .instance(lifecycler.instance_id())
            .unwrap()
            .tokens
            .clone();

        lifecycler.register().await.unwrap();
        let second_tokens = store
            .get()
            .await
            .instance(lifecycler.instance_id())
            .unwrap()
            .tokens
            .clone();

        assert_eq!(first_tokens, second_tokens);
    }

    #[tokio::test]
    async fn test_wait_instance_state_observes_own_write() {
        let store = MemoryRingStore::new();
        let lifecycler = lifecycler_on(&store, test_config());

        lifecycler.register().await.unwrap();

        wait_instance_state(
            &store,
            lifecycler.instance_id(),
            InstanceState::Joining,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_instance_state_times_out_with_context() {
        let store = MemoryRingStore::new();

        let err = wait_instance_state(
            &store,
            "missing-instance",
            InstanceState::Active,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("missing-instance"));
    }

    #[tokio::test]
    async fn test_change_state_validates_transition() {
        let store = MemoryRingStore::new();
        let lifecycler = lifecycler_on(&store, test_config());
        lifecycler.register().await.unwrap();

        lifecycler.change_state(InstanceState::Active).await.unwrap();
        let err = lifecycler
            .change_state(InstanceState::Joining)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("invalid ring state transition"));
        let desc = store.get().await;
        assert_eq!(
            desc.instance(lifecycler.instance_id()).unwrap().state,
            InstanceState::Active
        );
    }

    #[tokio::test]
    async fn test_change_state_requires_registration() {
        let store = MemoryRingStore::new();
        let lifecycler = lifecycler_on(&store, test_config());

        let err = lifecycler
            .change_state(InstanceState::Active)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not registered"));
    }

    #[tokio::test]
    async fn test_heartbeat_auto_forgets_silent_members() {
        let store = MemoryRingStore::new();
        let cfg = test_config();
        // Forget period is 2x the 200ms timeout; this member went silent
        // a full second ago.
        let stale = desc_with("stale", InstanceState::Active, now_ms() - 1000);
        store
            .update(Box::new(move |desc| desc.merge(stale)))
            .await
            .unwrap();

        let lifecycler = lifecycler_on(&store, cfg);
        let (tx, _rx) = mpsc::unbounded_channel();
        lifecycler.start(tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let desc = store.get().await;
        assert_eq!(
            desc.instance("stale").unwrap().state,
            InstanceState::Forgotten
        );
        assert_ne!(
            desc.instance(lifecycler.instance_id()).unwrap().state,
            InstanceState::Forgotten
        );

        lifecycler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_leaves_the_ring() {
        let store = MemoryRingStore::new();
        let lifecycler = lifecycler_on(&store, test_config());
        let (tx, _rx) = mpsc::unbounded_channel();

        lifecycler.start(tx).await.unwrap();
        lifecycler.stop().await.unwrap();

        let desc = store.get().await;
        let instance = desc.instance(lifecycler.instance_id()).unwrap();
        assert_eq!(instance.state, InstanceState::Forgotten);
        assert!(!instance.state.owns_tokens());
    }

    #[tokio::test]
    async fn test_keep_in_ring_on_shutdown_skips_departure() {
        let store = MemoryRingStore::new();
        let mut cfg = test_config();
        cfg.keep_in_ring_on_shutdown = true;
        let lifecycler = lifecycler_on(&store, cfg);
        let (tx, _rx) = mpsc::unbounded_channel();

        lifecycler.start(tx).await.unwrap();
        lifecycler.stop().await.unwrap();

        let desc = store.get().await;
        assert_eq!(
            desc.instance(lifecycler.instance_id()).unwrap().state,
            InstanceState::Joining
        );
    }

    // ============================================================
    // MERGE
    // ============================================================

    #[test]
    fn test_merge_newest_heartbeat_wins() {
        let mut local = desc_with("a", InstanceState::Joining, 100);
        let remote = desc_with("a", InstanceState::Active, 200);

        local.merge(remote);

        assert_eq!(local.instance("a").unwrap().state, InstanceState::Active);
    }

    #[test]
    fn test_merge_ignores_stale_view() {
        let mut local = desc_with("a", InstanceState::Active, 200);
        let remote = desc_with("a", InstanceState::Joining, 100);

        local.merge(remote);

        assert_eq!(local.instance("a").unwrap().state, InstanceState::Active);
    }

    #[test]
    fn test_merge_equal_heartbeats_never_resurrect() {
        let mut local = desc_with("a", InstanceState::Forgotten, 100);
        let remote = desc_with("a", InstanceState::Active, 100);

        local.merge(remote);

        assert_eq!(local.instance("a").unwrap().state, InstanceState::Forgotten);
    }

    #[test]
    fn test_merge_adds_unknown_instances() {
        let mut local = desc_with("a", InstanceState::Active, 100);
        let remote = desc_with("b", InstanceState::Joining, 50);

        local.merge(remote);

        assert_eq!(local.instances.len(), 2);
    }

    // ============================================================
    // OWNERSHIP
    // ============================================================

    fn two_member_desc() -> RingDesc {
        let mut desc = RingDesc::default();
        desc.instances.insert(
            "a".to_string(),
            InstanceDesc {
                id: "a".to_string(),
                addr: "127.0.0.1:9001".to_string(),
                state: InstanceState::Active,
                tokens: vec![100, 1000],
                heartbeat_ms: now_ms(),
            },
        );
        desc.instances.insert(
            "b".to_string(),
            InstanceDesc {
                id: "b".to_string(),
                addr: "127.0.0.1:9002".to_string(),
                state: InstanceState::Active,
                tokens: vec![500, 2000],
                heartbeat_ms: now_ms(),
            },
        );
        desc
    }

    #[tokio::test]
    async fn test_owner_is_first_token_at_or_after_hash() {
        let store = MemoryRingStore::new();
        let desc = two_member_desc();
        store
            .update(Box::new(move |d| *d = desc))
            .await
            .unwrap();
        let ring = Ring::new(Arc::new(store), "a".to_string());

        assert_eq!(ring.owner_of(50).await.as_deref(), Some("a")); // -> 100
        assert_eq!(ring.owner_of(100).await.as_deref(), Some("a")); // exact
        assert_eq!(ring.owner_of(101).await.as_deref(), Some("b")); // -> 500
        assert_eq!(ring.owner_of(1500).await.as_deref(), Some("b")); // -> 2000
        // Past the last token, ownership wraps to the first
        assert_eq!(ring.owner_of(3000).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_leaving_member_stops_owning() {
        let store = MemoryRingStore::new();
        let mut desc = two_member_desc();
        desc.instances.get_mut("b").unwrap().state = InstanceState::Leaving;
        store
            .update(Box::new(move |d| *d = desc))
            .await
            .unwrap();
        let ring = Ring::new(Arc::new(store), "a".to_string());

        // Every hash now lands on the surviving member
        assert_eq!(ring.owner_of(101).await.as_deref(), Some("a"));
        assert_eq!(ring.owner_of(1500).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_empty_ring_claims_everything() {
        let store = MemoryRingStore::new();
        let ring = Ring::new(Arc::new(store), "solo".to_string());

        assert!(ring.owns(Ring::hash("anything")).await);
        assert_eq!(ring.owner_of(42).await, None);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(Ring::hash("dashboards"), Ring::hash("dashboards"));
        assert_ne!(Ring::hash("dashboards"), Ring::hash("folders"));
    }
}
