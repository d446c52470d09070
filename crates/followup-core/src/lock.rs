//! Per-tenant refresh lock.
//!
//! The lock is a document in the shared store, not a process-local mutex:
//! overlapping jobs (a retried job racing a fresh one) may run in different
//! workers. Acquisition is optimistic and never blocks. A caller that loses
//! the race carries on with whatever credential it already has.
//!
//! A lock whose `expires_at` has passed is treated as absent, so a crashed
//! holder delays other refreshes by at most one TTL.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::LockStore;

/// Lifetime of a refresh lock when none is configured.
pub const DEFAULT_LOCK_TTL: Duration = Duration::seconds(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshLock {
    pub tenant_id: String,
    pub expires_at: DateTime<Utc>,
}

pub struct LockManager {
    store: Arc<dyn LockStore>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Try to take the lock for `tenant_id`. Returns `false` if another
    /// holder's lock is still live at `now`.
    pub fn acquire(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let candidate = RefreshLock {
            tenant_id: tenant_id.to_string(),
            expires_at: now + self.ttl,
        };
        let acquired = self.store.try_put_lock(candidate, now)?;
        tracing::debug!(tenant_id, acquired, "refresh lock acquire");
        Ok(acquired)
    }

    /// Unconditionally delete the lock record.
    pub fn release(&self, tenant_id: &str) -> Result<()> {
        self.store.delete_lock(tenant_id)?;
        tracing::debug!(tenant_id, "refresh lock released");
        Ok(())
    }

    /// Acquire and wrap the lock in a guard that releases it when dropped,
    /// including on early return or panic inside the protected section.
    pub fn lock(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<Option<LockGuard<'_>>> {
        if !self.acquire(tenant_id, now)? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            manager: self,
            tenant_id: tenant_id.to_string(),
            released: false,
        }))
    }
}

/// Held refresh lock. Dropping it releases the lock.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    tenant_id: String,
    released: bool,
}

impl LockGuard<'_> {
    /// Release now and surface any store error instead of logging it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.tenant_id)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.tenant_id) {
            tracing::warn!(tenant_id = %self.tenant_id, error = %e, "failed to release refresh lock");
        }
    }
}
