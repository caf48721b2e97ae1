//! Index Module
//!
//! Everything between the storage boundary and the query surface: document
//! builders, the injected search-backend capability, and the build
//! policy/worker pool that constructs and maintains per-kind indices.

pub mod builder;
pub mod support;
pub mod tokenizer;
pub mod types;
