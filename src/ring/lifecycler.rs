//! Ring Lifecycler
//!
//! Manages this instance's registration, heartbeat, and state transitions
//! within the shared ring store. Behavior is composed from an explicitly
//! ordered delegate chain (register -> leave-on-stop -> auto-forget), each
//! wrapping the previous, so call order is visible at construction instead
//! of hidden in the components.

use super::store::{RingStore, touch_heartbeat};
use super::types::{InstanceDesc, InstanceState, RingConfig, generate_tokens, now_ms};

use crate::server::subservice::{Subservice, SubserviceFailure};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One link in the lifecycler's capability chain.
///
/// Delegates run inside the store's update lock, so they must be synchronous
/// and cheap.
pub trait LifecyclerDelegate: Send + Sync {
    /// Decides the initial state and token set for a (re)registering instance.
    fn on_register(
        &self,
        desc: &super::types::RingDesc,
        id: &str,
    ) -> (InstanceState, Vec<u32>);

    /// Invoked on every heartbeat write, after the timestamp is stamped.
    fn on_heartbeat(&self, desc: &mut super::types::RingDesc, id: &str);

    /// Invoked during graceful stop, before the entry is removed.
    fn on_stopping(&self, desc: &mut super::types::RingDesc, id: &str);
}

/// Base delegate: join in state JOINING with a fixed token count, reusing
/// the previous token set when re-registering after a restart.
pub struct RegisterDelegate {
    num_tokens: usize,
}

impl RegisterDelegate {
    pub fn new(num_tokens: usize) -> Self {
        Self { num_tokens }
    }
}

impl LifecyclerDelegate for RegisterDelegate {
    fn on_register(
        &self,
        desc: &super::types::RingDesc,
        id: &str,
    ) -> (InstanceState, Vec<u32>) {
        let tokens = match desc.instance(id) {
            Some(existing)
                if existing.state != InstanceState::Forgotten && !existing.tokens.is_empty() =>
            {
                existing.tokens.clone()
            }
            _ => generate_tokens(self.num_tokens),
        };
        (InstanceState::Joining, tokens)
    }

    fn on_heartbeat(&self, _desc: &mut super::types::RingDesc, _id: &str) {}

    fn on_stopping(&self, _desc: &mut super::types::RingDesc, _id: &str) {}
}

/// Wrapper: on graceful stop, transition the instance through LEAVING so
/// other members see an orderly departure before the entry disappears.
pub struct LeaveOnStopDelegate {
    inner: Arc<dyn LifecyclerDelegate>,
}

impl LeaveOnStopDelegate {
    pub fn new(inner: Arc<dyn LifecyclerDelegate>) -> Self {
        Self { inner }
    }
}

impl LifecyclerDelegate for LeaveOnStopDelegate {
    fn on_register(
        &self,
        desc: &super::types::RingDesc,
        id: &str,
    ) -> (InstanceState, Vec<u32>) {
        self.inner.on_register(desc, id)
    }

    fn on_heartbeat(&self, desc: &mut super::types::RingDesc, id: &str) {
        self.inner.on_heartbeat(desc, id);
    }

    fn on_stopping(&self, desc: &mut super::types::RingDesc, id: &str) {
        self.inner.on_stopping(desc, id);
        if let Some(instance) = desc.instances.get_mut(id) {
            info!("instance {} leaving the ring", id);
            instance.state = InstanceState::Leaving;
            instance.heartbeat_ms = now_ms();
        }
    }
}

/// Wrapper: on every heartbeat, tombstone any member whose last heartbeat is
/// older than the forget period (2x the heartbeat timeout). Bounds the impact
/// of instances that crash without leaving cleanly.
pub struct AutoForgetDelegate {
    forget_period_ms: u64,
    inner: Arc<dyn LifecyclerDelegate>,
}

impl AutoForgetDelegate {
    pub fn new(forget_period: std::time::Duration, inner: Arc<dyn LifecyclerDelegate>) -> Self {
        Self {
            forget_period_ms: forget_period.as_millis() as u64,
            inner,
        }
    }
}

impl LifecyclerDelegate for AutoForgetDelegate {
    fn on_register(
        &self,
        desc: &super::types::RingDesc,
        id: &str,
    ) -> (InstanceState, Vec<u32>) {
        self.inner.on_register(desc, id)
    }

    fn on_heartbeat(&self, desc: &mut super::types::RingDesc, id: &str) {
        let now = now_ms();
        for instance in desc.instances.values_mut() {
            if instance.id == id || instance.state == InstanceState::Forgotten {
                continue;
            }
            if now.saturating_sub(instance.heartbeat_ms) > self.forget_period_ms {
                warn!(
                    "auto-forgetting instance {} (last heartbeat {}ms ago)",
                    instance.id,
                    now.saturating_sub(instance.heartbeat_ms)
                );
                instance.state = InstanceState::Forgotten;
            }
        }
        self.inner.on_heartbeat(desc, id);
    }

    fn on_stopping(&self, desc: &mut super::types::RingDesc, id: &str) {
        self.inner.on_stopping(desc, id);
    }
}

/// Builds the standard delegate chain in reverse call order: the last to be
/// invoked is constructed first, each wrapped by the next.
pub fn standard_delegate_chain(cfg: &RingConfig) -> Arc<dyn LifecyclerDelegate> {
    let delegate: Arc<dyn LifecyclerDelegate> = Arc::new(RegisterDelegate::new(cfg.num_tokens));
    let delegate: Arc<dyn LifecyclerDelegate> = Arc::new(LeaveOnStopDelegate::new(delegate));
    Arc::new(AutoForgetDelegate::new(
        cfg.heartbeat_timeout * 2,
        delegate,
    ))
}

/// The component managing this instance's membership in the ring.
pub struct Lifecycler {
    id: String,
    addr: String,
    cfg: RingConfig,
    store: Arc<dyn RingStore>,
    delegate: Arc<dyn LifecyclerDelegate>,
    cancel: CancellationToken,
    heartbeat_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Lifecycler {
    pub fn new(
        addr: String,
        cfg: RingConfig,
        store: Arc<dyn RingStore>,
        delegate: Arc<dyn LifecyclerDelegate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            addr,
            cfg,
            store,
            delegate,
            cancel: CancellationToken::new(),
            heartbeat_task: Mutex::new(None),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.id
    }

    /// Registers this instance in the shared store via the delegate chain.
    pub async fn register(&self) -> Result<()> {
        let delegate = self.delegate.clone();
        let id = self.id.clone();
        let addr = self.addr.clone();

        self.store
            .update(Box::new(move |desc| {
                let (state, tokens) = delegate.on_register(desc, &id);
                info!(
                    "registering instance {} in state {:?} with {} tokens",
                    id,
                    state,
                    tokens.len()
                );
                desc.instances.insert(
                    id.clone(),
                    InstanceDesc {
                        id,
                        addr,
                        state,
                        tokens,
                        heartbeat_ms: now_ms(),
                    },
                );
            }))
            .await?;
        Ok(())
    }

    /// Transitions this instance to `next`, validating the state machine.
    pub async fn change_state(&self, next: InstanceState) -> Result<()> {
        let desc = self.store.get().await;
        let current = desc
            .instance(&self.id)
            .ok_or_else(|| anyhow::anyhow!("instance {} is not registered in the ring", self.id))?
            .state;

        if !current.can_transition_to(next) {
            return Err(anyhow::anyhow!(
                "invalid ring state transition {:?} -> {:?} for instance {}",
                current,
                next,
                self.id
            ));
        }

        let id = self.id.clone();
        self.store
            .update(Box::new(move |desc| {
                if let Some(instance) = desc.instances.get_mut(&id) {
                    instance.state = next;
                    instance.heartbeat_ms = now_ms();
                }
            }))
            .await?;
        info!("instance {} is now {:?} in the ring", self.id, next);
        Ok(())
    }

    async fn heartbeat_once(&self) -> Result<()> {
        let delegate = self.delegate.clone();
        let id = self.id.clone();
        self.store
            .update(Box::new(move |desc| {
                touch_heartbeat(desc, &id);
                delegate.on_heartbeat(desc, &id);
            }))
            .await?;
        Ok(())
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        failures: mpsc::UnboundedSender<SubserviceFailure>,
    ) -> tokio::task::JoinHandle<()> {
        let lifecycler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(lifecycler.cfg.heartbeat_period);
            loop {
                tokio::select! {
                    _ = lifecycler.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = lifecycler.heartbeat_once().await {
                            warn!("ring heartbeat failed: {}", e);
                            let _ = failures.send(SubserviceFailure {
                                service: "ring-lifecycler".to_string(),
                                error: format!("heartbeat failed: {}", e),
                            });
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Graceful departure: LEAVING first, then the tombstoned removal, so
    /// other members observe the two steps in order.
    async fn leave(&self) -> Result<()> {
        let delegate = self.delegate.clone();
        let id = self.id.clone();
        self.store
            .update(Box::new(move |desc| {
                delegate.on_stopping(desc, &id);
            }))
            .await?;

        let id = self.id.clone();
        self.store
            .update(Box::new(move |desc| {
                if let Some(instance) = desc.instances.get_mut(&id) {
                    instance.state = InstanceState::Forgotten;
                    instance.heartbeat_ms = now_ms();
                }
            }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Subservice for Arc<Lifecycler> {
    fn name(&self) -> &str {
        "ring-lifecycler"
    }

    async fn start(&self, failures: mpsc::UnboundedSender<SubserviceFailure>) -> Result<()> {
        self.register().await?;
        let task = self.spawn_heartbeat(failures);
        *self.heartbeat_task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }

        if self.cfg.keep_in_ring_on_shutdown {
            info!(
                "instance {} staying registered in the ring on shutdown",
                self.id
            );
            return Ok(());
        }
        self.leave().await
    }
}
