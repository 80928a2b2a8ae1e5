//! Per-identity mutual exclusion for instrument operations.
//!
//! Guards are created lazily the first time an identity is referenced and
//! live as long as the manager. A lease is an owned guard, so it is released
//! on every exit path when dropped, including when the future holding it is
//! cancelled.

use crate::error::InstrumentError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct LeaseManager {
    guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard_for(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.guards
            .lock()
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive use of `identity`, or until `cancel` fires.
    pub async fn acquire(
        &self,
        identity: &str,
        cancel: &CancellationToken,
    ) -> Result<InstrumentLease, InstrumentError> {
        let guard = self.guard_for(identity);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InstrumentError::Cancelled),
            held = guard.lock_owned() => Ok(InstrumentLease {
                identity: identity.to_string(),
                _guard: held,
            }),
        }
    }

    /// True if a lease on `identity` is currently held
    pub fn is_leased(&self, identity: &str) -> bool {
        self.guards
            .lock()
            .get(identity)
            .is_some_and(|guard| guard.try_lock().is_err())
    }

    /// Identities referenced so far
    pub fn identities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.guards.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Exclusive hold on one instrument identity; released on drop.
#[derive(Debug)]
pub struct InstrumentLease {
    identity: String,
    _guard: OwnedMutexGuard<()>,
}

impl InstrumentLease {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}
