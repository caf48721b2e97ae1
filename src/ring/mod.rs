//! Sharding Ring & Lifecycle Module
//!
//! When sharding is enabled, multiple service instances split index ownership
//! via a consistent-hash ring. Membership lives in a shared KV store
//! (gossip-replicated across instances); each instance runs a lifecycler that
//! registers itself, heartbeats, and walks the
//! JOINING -> ACTIVE -> LEAVING state machine.
//!
//! ## Core Mechanisms
//! - **Shared store**: `RingStore` serializes membership updates; the gossip
//!   implementation merges views by newest heartbeat.
//! - **Delegate chain**: registration, leave-on-stop, and auto-forget are
//!   composed as explicitly ordered wrappers around one capability interface.
//! - **Auto-forget**: members silent for twice the heartbeat timeout are
//!   tombstoned so crashed instances do not pin shard ownership.

pub mod lifecycler;
pub mod read;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
