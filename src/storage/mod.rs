//! Storage Boundary Module
//!
//! The core never owns resource data; it consumes an external object store
//! through the `StorageBackend` trait and probes optional capabilities
//! (`BlobSupport`, `StatsProvider`) at runtime.
//!
//! ## Core Pieces
//! - **`StorageBackend`**: read, list, and change-feed access to versioned objects.
//! - **Capability probes**: `as_blob_support()` / `as_stats_provider()` instead of
//!   inheritance, so a backend advertises exactly what it can do.
//! - **`MemoryBackend`**: in-memory implementation used by tests and the demo binary.

pub mod backend;
pub mod types;
