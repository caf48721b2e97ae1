use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Name of the shared KV entry holding ring membership.
pub const RING_KEY: &str = "search-ring";
/// Default number of tokens each instance claims in the hash space.
pub const RING_NUM_TOKENS: usize = 128;
/// Default heartbeat timeout. Auto-forget triggers at twice this value.
pub const RING_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
/// How long startup waits for its own JOINING write to become visible.
pub const JOIN_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a ring member.
///
/// Valid transitions: `Joining -> Active -> Leaving -> Forgotten`, or
/// `* -> Forgotten` via auto-forget after prolonged heartbeat silence.
/// A forgotten instance must re-register from `Joining` to rejoin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    Joining,
    Active,
    Leaving,
    Forgotten,
}

impl InstanceState {
    /// Whether this member's tokens currently count toward shard ownership.
    pub fn owns_tokens(&self) -> bool {
        matches!(self, InstanceState::Joining | InstanceState::Active)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        matches!(
            (self, next),
            (InstanceState::Joining, InstanceState::Active)
                | (InstanceState::Active, InstanceState::Leaving)
                | (InstanceState::Joining, InstanceState::Leaving)
                | (InstanceState::Leaving, InstanceState::Forgotten)
                | (_, InstanceState::Forgotten)
        )
    }
}

/// One member's entry in the shared ring descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDesc {
    pub id: String,
    /// Gossip address of the instance, used for peer discovery.
    pub addr: String,
    pub state: InstanceState,
    /// Sorted claim points in the u32 hash space.
    pub tokens: Vec<u32>,
    /// Last heartbeat, unix millis. Entries whose heartbeat is older than
    /// twice the configured timeout are auto-forgotten.
    pub heartbeat_ms: u64,
}

/// The complete ring membership view.
///
/// Forgotten members stay in the map as tombstones so removal survives
/// gossip merges; readers filter on `owns_tokens()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RingDesc {
    pub instances: HashMap<String, InstanceDesc>,
}

impl RingDesc {
    pub fn instance(&self, id: &str) -> Option<&InstanceDesc> {
        self.instances.get(id)
    }

    pub fn members(&self) -> impl Iterator<Item = &InstanceDesc> {
        self.instances.values().filter(|i| i.state.owns_tokens())
    }

    /// Merges a remote view into this one, per instance.
    ///
    /// Newest heartbeat wins; on equal heartbeats the more terminal state
    /// wins so that Leaving/Forgotten are never resurrected by a stale Ack.
    pub fn merge(&mut self, other: RingDesc) {
        for (id, remote) in other.instances {
            match self.instances.get_mut(&id) {
                Some(local) => {
                    let newer = remote.heartbeat_ms > local.heartbeat_ms
                        || (remote.heartbeat_ms == local.heartbeat_ms
                            && state_rank(remote.state) > state_rank(local.state));
                    if newer {
                        *local = remote;
                    }
                }
                None => {
                    self.instances.insert(id, remote);
                }
            }
        }
    }

    /// All tokens owned by live members, sorted, each tagged with its owner.
    pub fn sorted_tokens(&self) -> Vec<(u32, &str)> {
        let mut tokens: Vec<(u32, &str)> = self
            .members()
            .flat_map(|i| i.tokens.iter().map(move |t| (*t, i.id.as_str())))
            .collect();
        tokens.sort_by_key(|(t, _)| *t);
        tokens
    }
}

fn state_rank(state: InstanceState) -> u8 {
    match state {
        InstanceState::Joining => 0,
        InstanceState::Active => 1,
        InstanceState::Leaving => 2,
        InstanceState::Forgotten => 3,
    }
}

/// The gossip wire protocol for ring replication.
///
/// - `Push`: periodic dissemination of the full local view to a random peer.
/// - `Pull`: sent by a freshly started store to its seeds to catch up fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RingGossip {
    Push { desc: RingDesc },
    Pull,
}

/// Cluster/sharding configuration surface.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Sharding enable flag. When false no ring subservice is started and a
    /// single instance owns every index.
    pub enabled: bool,
    pub heartbeat_timeout: Duration,
    /// Heartbeat write cadence. Must be well below the timeout.
    pub heartbeat_period: Duration,
    pub num_tokens: usize,
    /// How long startup waits for the JOINING registration to become
    /// visible before giving up.
    pub join_timeout: Duration,
    /// When true, graceful shutdown leaves the instance registered (e.g. to
    /// avoid token redistribution churn during a rolling restart).
    pub keep_in_ring_on_shutdown: bool,
    /// UDP bind address for the gossip store.
    pub bind_addr: Option<SocketAddr>,
    /// Seed peers for the gossip store.
    pub seed_nodes: Vec<SocketAddr>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            heartbeat_timeout: RING_HEARTBEAT_TIMEOUT,
            heartbeat_period: Duration::from_secs(5),
            num_tokens: RING_NUM_TOKENS,
            join_timeout: JOIN_WAIT_TIMEOUT,
            keep_in_ring_on_shutdown: false,
            bind_addr: None,
            seed_nodes: Vec::new(),
        }
    }
}

/// Generates `count` distinct random tokens, sorted.
pub fn generate_tokens(count: usize) -> Vec<u32> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut tokens = std::collections::BTreeSet::new();
    while tokens.len() < count {
        tokens.insert(rng.r#gen::<u32>());
    }
    tokens.into_iter().collect()
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
