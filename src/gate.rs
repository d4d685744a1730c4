//! Bounded admission control for download pipelines.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

/// Limits how many download pipelines run at once.
///
/// Constructed once at startup and shared through the HTTP state; cloning is
/// cheap and every clone refers to the same slots.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Proof of an acquired slot. The slot returns to the gate when the token is
/// released or dropped, whichever happens first.
#[derive(Debug)]
pub struct AdmissionToken {
    permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Waits up to `timeout` for a free slot.
    pub async fn acquire(&self, timeout: Duration) -> GatewayResult<AdmissionToken> {
        let waiting = self.semaphore.clone().acquire_owned();
        match tokio::time::timeout(timeout, waiting).await {
            Ok(Ok(permit)) => {
                debug!(in_flight = self.in_flight(), "admission slot acquired");
                Ok(AdmissionToken {
                    permit: Some(permit),
                })
            }
            Ok(Err(_)) => Err(GatewayError::internal("admission gate closed")),
            Err(_) => {
                warn!(
                    capacity = self.capacity,
                    timeout_ms = timeout.as_millis() as u64,
                    "admission gate saturated"
                );
                Err(GatewayError::AdmissionRejected)
            }
        }
    }
}

impl AdmissionToken {
    /// Returns the slot. Safe to call more than once.
    pub fn release(&mut self) {
        if self.permit.take().is_some() {
            debug!("admission slot released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.release();
    }
}
