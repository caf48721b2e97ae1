//! Shared Ring KV Store
//!
//! Ring membership is the only cross-instance shared state the core depends
//! on. It lives behind the `RingStore` trait: updates are serialized through
//! the store so no two instances observe contradictory state for the same
//! instance id, and a writer always reads its own write back.
//!
//! Two implementations:
//! - **`MemoryRingStore`**: a process-local store (tests, single instance).
//! - **`GossipRingStore`**: replicates the descriptor over UDP. Peers push
//!   their full view on an interval and merge incoming views per instance
//!   (newest heartbeat wins, terminal states win ties).

use super::types::{RingDesc, RingGossip, now_ms};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const MAX_DATAGRAM: usize = 65536;

/// Mutation applied to the ring descriptor under the store's update lock.
pub type RingMutator = Box<dyn FnOnce(&mut RingDesc) + Send>;

#[async_trait]
pub trait RingStore: Send + Sync {
    /// Returns the current membership view.
    async fn get(&self) -> RingDesc;

    /// Applies a mutation atomically and returns the resulting view.
    /// Subsequent `get` calls on this store observe the update.
    async fn update(&self, mutator: RingMutator) -> Result<RingDesc>;
}

/// Process-local ring store. Clones share the same descriptor, which lets
/// tests run several lifecyclers against one "shared" store.
#[derive(Clone, Default)]
pub struct MemoryRingStore {
    desc: Arc<Mutex<RingDesc>>,
}

impl MemoryRingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RingStore for MemoryRingStore {
    async fn get(&self) -> RingDesc {
        self.desc.lock().await.clone()
    }

    async fn update(&self, mutator: RingMutator) -> Result<RingDesc> {
        let mut desc = self.desc.lock().await;
        mutator(&mut desc);
        Ok(desc.clone())
    }
}

/// Gossip-replicated ring store.
///
/// Local updates are applied under a lock and then pushed to peers on a best
/// effort basis; the periodic gossip loop repairs anything a push missed.
/// Convergence is eventual, but read-your-own-write always holds locally,
/// which is what the startup JOINING wait relies on.
pub struct GossipRingStore {
    desc: Arc<Mutex<RingDesc>>,
    socket: Arc<UdpSocket>,
    seed_nodes: Vec<SocketAddr>,
    local_addr: SocketAddr,
}

impl GossipRingStore {
    pub async fn bind(bind_addr: SocketAddr, seed_nodes: Vec<SocketAddr>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("ring gossip store listening on {}", local_addr);

        let store = Arc::new(Self {
            desc: Arc::new(Mutex::new(RingDesc::default())),
            socket: Arc::new(socket),
            seed_nodes,
            local_addr,
        });

        // Catch up from seeds before the first gossip round
        for seed in store.seed_nodes.iter() {
            if let Ok(encoded) = bincode::serialize(&RingGossip::Pull) {
                let _ = store.socket.send_to(&encoded, seed).await;
            }
        }

        Ok(store)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the gossip and receive loops.
    pub fn start(self: &Arc<Self>) {
        let gossip = self.clone();
        tokio::spawn(async move {
            gossip.gossip_loop().await;
        });

        let receive = self.clone();
        tokio::spawn(async move {
            receive.receive_loop().await;
        });
    }

    /// Every known peer address: seeds plus the gossip addresses carried in
    /// the descriptor itself, excluding ourselves.
    async fn peers(&self) -> Vec<SocketAddr> {
        let desc = self.desc.lock().await;
        let mut peers: Vec<SocketAddr> = self.seed_nodes.clone();
        for instance in desc.instances.values() {
            if let Ok(addr) = instance.addr.parse::<SocketAddr>()
                && addr != self.local_addr
                && !peers.contains(&addr)
            {
                peers.push(addr);
            }
        }
        peers.retain(|p| *p != self.local_addr);
        peers
    }

    async fn push_to(&self, target: SocketAddr) {
        let desc = self.desc.lock().await.clone();
        match bincode::serialize(&RingGossip::Push { desc }) {
            Ok(encoded) => {
                if let Err(e) = self.socket.send_to(&encoded, target).await {
                    warn!("failed to gossip ring to {}: {}", target, e);
                }
            }
            Err(e) => warn!("failed to serialize ring gossip: {}", e),
        }
    }

    /// Pushes the local view to every known peer. Called after local updates
    /// so state changes propagate faster than the gossip cadence.
    pub async fn push_all(&self) {
        for peer in self.peers().await {
            self.push_to(peer).await;
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);
        loop {
            interval.tick().await;

            let peers = self.peers().await;
            if peers.is_empty() {
                continue;
            }
            let idx = rand::thread_rng().gen_range(0..peers.len());
            self.push_to(peers[idx]).await;
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<RingGossip>(&buf[..len]) {
                    Ok(RingGossip::Push { desc }) => {
                        debug!("merging ring view from {} ({} entries)", src, desc.instances.len());
                        self.desc.lock().await.merge(desc);
                    }
                    Ok(RingGossip::Pull) => {
                        self.push_to(src).await;
                    }
                    Err(e) => {
                        warn!("failed to deserialize ring gossip from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    warn!("failed to receive ring gossip: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[async_trait]
impl RingStore for GossipRingStore {
    async fn get(&self) -> RingDesc {
        self.desc.lock().await.clone()
    }

    async fn update(&self, mutator: RingMutator) -> Result<RingDesc> {
        let updated = {
            let mut desc = self.desc.lock().await;
            mutator(&mut desc);
            desc.clone()
        };
        // Disseminate eagerly; the gossip loop covers any missed peer
        self.push_all().await;
        Ok(updated)
    }
}

/// Polls the store until `id` is visible in `state`, bounded by `timeout`.
///
/// Used by startup for read-your-own-write confirmation of the JOINING
/// registration. Elapsing the deadline is a startup-fatal error.
pub async fn wait_instance_state(
    store: &dyn RingStore,
    id: &str,
    state: super::types::InstanceState,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let desc = store.get().await;
        if let Some(instance) = desc.instance(id)
            && instance.state == state
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow::anyhow!(
                "timed out after {:?} waiting for instance {} to reach {:?} in the ring",
                timeout,
                id,
                state
            ));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Stamps a fresh heartbeat on an instance entry, if present.
pub fn touch_heartbeat(desc: &mut RingDesc, id: &str) {
    if let Some(instance) = desc.instances.get_mut(id) {
        instance.heartbeat_ms = now_ms();
    }
}
