//! Server Module
//!
//! The deployable service wrapper: configuration validation, the subservice
//! manager and failure watcher, request authentication, and the HTTP
//! transport over the facade.

pub mod auth;
pub mod handlers;
pub mod service;
pub mod subservice;

#[cfg(test)]
mod tests;
