// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-principal connection quota. Every subscriber session holds a
//! [`Permit`] for as long as it lives; the permit's `Drop` releases the slot
//! automatically, so quota accounting survives early returns, panics in
//! unrelated code, and abrupt WebSocket disconnects alike.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::HubError;

/// Holds a subscriber's quota slot. Releasing is automatic on drop; there is
/// no explicit `release()` to call.
pub struct Permit {
    _inner: OwnedSemaphorePermit,
    principal: String,
}

impl Permit {
    pub fn principal(&self) -> &str {
        &self.principal
    }
}

/// Tracks one [`Semaphore`] per principal, each sized to
/// `max_connections_per_principal`. Principals are created lazily on first
/// acquisition and never removed, since a principal with zero active
/// connections costs only a handful of bytes.
pub struct ConnectionManager {
    max_per_principal: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConnectionManager {
    pub fn new(max_per_principal: usize) -> Self {
        Self { max_per_principal: max_per_principal.max(1), semaphores: Mutex::new(HashMap::new()) }
    }

    fn semaphore_for(&self, principal: &str) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        semaphores
            .entry(principal.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_principal)))
            .clone()
    }

    /// Acquires a quota slot for `principal`, failing fast with
    /// `QuotaExceeded` rather than queuing — a connection attempt over quota
    /// is rejected outright, never made to wait for a slot to free up.
    pub fn acquire(&self, principal: &str) -> Result<Permit, HubError> {
        let semaphore = self.semaphore_for(principal);
        match Arc::clone(&semaphore).try_acquire_owned() {
            Ok(inner) => {
                debug!(principal, "connection quota slot acquired");
                Ok(Permit { _inner: inner, principal: principal.to_owned() })
            }
            Err(_) => Err(HubError::QuotaExceeded),
        }
    }

    pub fn active_connections(&self, principal: &str) -> usize {
        let semaphores = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        match semaphores.get(principal) {
            Some(semaphore) => self.max_per_principal - semaphore.available_permits(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_rejects_beyond_the_limit() {
        let manager = ConnectionManager::new(2);
        let a = manager.acquire("alice").unwrap();
        let b = manager.acquire("alice").unwrap();
        let over = manager.acquire("alice");
        assert_eq!(over.unwrap_err(), HubError::QuotaExceeded);
        assert_eq!(manager.active_connections("alice"), 2);

        drop(a);
        let c = manager.acquire("alice");
        assert!(c.is_ok());
        drop(b);
        drop(c);
    }

    #[test]
    fn principals_are_independent() {
        let manager = ConnectionManager::new(1);
        let _a = manager.acquire("alice").unwrap();
        let bob = manager.acquire("bob");
        assert!(bob.is_ok());
    }
}
