//! Connection admission control.

use crate::{MqError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of live connections with a semaphore.
///
/// Each admitted connection holds an [`AdmissionPermit`]; dropping the permit
/// frees the slot, so every exit path of a handler (including a panic) gives
/// it back.
#[derive(Debug)]
pub struct ConnectionLimiter {
    max_connections: usize,
    permits: Arc<Semaphore>,
    total_connections: AtomicUsize,
    rejected_connections: AtomicUsize,
}

#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub total_connections: usize,
    pub rejected_connections: usize,
    pub max_connections: usize,
    pub utilization: f64,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.min(Semaphore::MAX_PERMITS);
        Self {
            max_connections,
            permits: Arc::new(Semaphore::new(max_connections)),
            total_connections: AtomicUsize::new(0),
            rejected_connections: AtomicUsize::new(0),
        }
    }

    /// Take a slot without waiting. Excess connections are rejected, never
    /// queued.
    pub fn try_admit(&self) -> Result<AdmissionPermit> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                self.total_connections.fetch_add(1, Ordering::Relaxed);
                Ok(AdmissionPermit { _permit: permit })
            }
            Err(_) => {
                self.rejected_connections.fetch_add(1, Ordering::Relaxed);
                Err(MqError::AdmissionRejected {
                    limit: self.max_connections,
                })
            }
        }
    }

    pub fn can_accept_connection(&self) -> bool {
        self.permits.available_permits() > 0
    }

    pub fn active_connections(&self) -> usize {
        self.max_connections - self.permits.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn get_stats(&self) -> ConnectionStats {
        let active = self.active_connections();
        ConnectionStats {
            active_connections: active,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            max_connections: self.max_connections,
            utilization: if self.max_connections > 0 {
                active as f64 / self.max_connections as f64
            } else {
                0.0
            },
        }
    }
}
