//! Distributed Resource Search Service Library
//!
//! This library crate defines the core modules of the search/index service.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of six loosely coupled subsystems:
//!
//! - **`storage`**: The persistence boundary. A capability-interface hierarchy
//!   (`StorageBackend` plus optional `BlobSupport`/`StatsProvider`) over the
//!   external object store, with an in-memory implementation for tests.
//! - **`broadcast`**: The write-event fan-out. Delivers `WrittenEvent`s to index
//!   maintainers without ever blocking the writer; slow subscribers lag and are
//!   told so, instead of stalling ingestion.
//! - **`index`**: The index build policy and worker pool. Decides per resource
//!   kind whether to build eagerly, lazily, or as an empty placeholder, and
//!   executes full builds with bounded parallelism.
//! - **`ring`**: The cluster coordination layer. A consistent-hash ring whose
//!   membership lives in a shared, gossip-replicated KV store; a lifecycler
//!   manages this instance's JOINING/ACTIVE/LEAVING transitions and heartbeats.
//! - **`facade`**: The RPC-facing resource server. Owns one-time guarded
//!   initialization, the resource-version counter, and orderly shutdown.
//! - **`server`**: The service wrapper. Starts subservices in dependency order,
//!   watches them for failure, and binds the HTTP transport.

pub mod broadcast;
pub mod facade;
pub mod index;
pub mod ring;
pub mod server;
pub mod storage;
