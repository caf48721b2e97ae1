//! Subservice Manager & Failure Watcher
//!
//! Owned background components (ring lifecycler, gossip store, ...) share one
//! lifecycle contract: start in declaration order, report asynchronous
//! failures on a shared channel, stop in reverse order.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// An asynchronous failure reported by a running subservice.
#[derive(Debug, Clone)]
pub struct SubserviceFailure {
    pub service: String,
    pub error: String,
}

/// Lifecycle contract for an owned background component.
#[async_trait]
pub trait Subservice: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the component. Failures after startup are reported on the
    /// `failures` channel rather than returned.
    async fn start(&self, failures: mpsc::UnboundedSender<SubserviceFailure>) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Starts subservices in order and stops them in reverse order.
pub struct SubserviceManager {
    services: Vec<Arc<dyn Subservice>>,
    failure_tx: mpsc::UnboundedSender<SubserviceFailure>,
}

impl SubserviceManager {
    /// Returns the manager and the receiving end of the failure channel,
    /// which the owner watches to escalate any subservice failure.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SubserviceFailure>) {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        (
            Self {
                services: Vec::new(),
                failure_tx,
            },
            failure_rx,
        )
    }

    pub fn add(&mut self, service: Arc<dyn Subservice>) {
        self.services.push(service);
    }

    /// Starts every registered subservice in registration order. The first
    /// startup failure aborts and the already started ones are stopped in
    /// reverse order.
    pub async fn start_all(&self) -> Result<()> {
        let mut started: Vec<&Arc<dyn Subservice>> = Vec::new();
        for service in &self.services {
            info!("starting subservice {}", service.name());
            if let Err(e) = service.start(self.failure_tx.clone()).await {
                warn!("subservice {} failed to start: {}", service.name(), e);
                for running in started.into_iter().rev() {
                    if let Err(stop_err) = running.stop().await {
                        warn!(
                            "failed to stop subservice {} during rollback: {}",
                            running.name(),
                            stop_err
                        );
                    }
                }
                return Err(e);
            }
            started.push(service);
        }
        Ok(())
    }

    /// Stops every subservice in reverse registration order. Stop errors are
    /// logged and collected; the first one is returned after all have been
    /// attempted.
    pub async fn stop_all(&self) -> Result<()> {
        let mut first_error = None;
        for service in self.services.iter().rev() {
            info!("stopping subservice {}", service.name());
            if let Err(e) = service.stop().await {
                warn!("subservice {} failed to stop: {}", service.name(), e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
