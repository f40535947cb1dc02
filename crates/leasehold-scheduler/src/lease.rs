use std::future::Future;
use std::time::Duration;

use leasehold_core::{types::validate_name, Ticket};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::lock_store::LockStore;
use crate::schedule::{to_delta, MIN_LEASE};
use crate::types::{Lease, MutexRecord};

/// Acquire-or-renew leases on named mutexes.
///
/// Holds no lock state of its own; every answer comes from one conditional
/// write against the `mutexes` table.
#[derive(Clone)]
pub struct LeaseManager {
    store: LockStore,
}

impl LeaseManager {
    pub fn new(store: LockStore) -> Self {
        Self { store }
    }

    /// Returns `true` when `ticket` now holds `id` for `lease_duration`.
    ///
    /// `false` means another live holder has it. Store failures come back as
    /// `Err` and say nothing about who holds the lease.
    pub fn try_acquire_or_renew(
        &self,
        id: &str,
        ticket: &Ticket,
        lease_duration: Duration,
    ) -> Result<bool> {
        Ok(self.acquire(id, ticket, lease_duration)?.is_some())
    }

    /// Same as [`try_acquire_or_renew`](Self::try_acquire_or_renew) but hands
    /// back the granted lease.
    #[instrument(skip(self, ticket), fields(mutex_id = %id))]
    pub fn acquire(
        &self,
        id: &str,
        ticket: &Ticket,
        lease_duration: Duration,
    ) -> Result<Option<Lease>> {
        validate_name(id)?;
        let lease = lease_delta(lease_duration)?;
        self.store.try_acquire_or_renew(id, ticket, lease)
    }

    pub fn release(&self, id: &str, ticket: &Ticket) -> Result<bool> {
        let released = self.store.release(id, ticket)?;
        if !released {
            debug!(mutex_id = %id, "release ignored, ticket no longer holds the mutex");
        }
        Ok(released)
    }

    pub fn current(&self, id: &str) -> Result<Option<MutexRecord>> {
        self.store.get(id)
    }

    pub fn list(&self) -> Result<Vec<MutexRecord>> {
        self.store.list()
    }

    pub fn reset_expired(&self) -> Result<usize> {
        self.store.reset_expired()
    }
}

/// Leases shorter than the store's millisecond precision would be expired
/// on arrival and could be granted twice.
fn lease_delta(lease_duration: Duration) -> Result<chrono::Duration> {
    if lease_duration < MIN_LEASE {
        return Err(SchedulerError::InvalidLease(format!(
            "lease duration must be at least {MIN_LEASE:?}, got {lease_duration:?}"
        )));
    }
    to_delta(lease_duration)
        .map_err(|_| SchedulerError::InvalidLease(format!("lease too long: {lease_duration:?}")))
}

/// A reusable mutual-exclusion handle for one named mutex.
///
/// No cadence and no rescheduling: callers decide when to try.
#[derive(Clone)]
pub struct LockedWorker {
    id: String,
    lease_duration: Duration,
    leases: LeaseManager,
}

impl LockedWorker {
    pub(crate) fn new(id: &str, lease_duration: Duration, leases: LeaseManager) -> Result<Self> {
        validate_name(id)?;
        lease_delta(lease_duration)?;
        Ok(Self {
            id: id.to_string(),
            lease_duration,
            leases,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Try to take the mutex with a fresh ticket.
    pub fn try_lock(&self) -> Result<Option<Lease>> {
        self.leases.acquire(&self.id, &Ticket::new(), self.lease_duration)
    }

    /// Extend a held lease. `None` means it was lost to someone else.
    pub fn renew(&self, lease: &Lease) -> Result<Option<Lease>> {
        self.leases.acquire(&self.id, &lease.ticket, self.lease_duration)
    }

    pub fn release(&self, lease: Lease) -> Result<bool> {
        self.leases.release(&self.id, &lease.ticket)
    }

    /// Run `body` while holding the mutex. Returns `None` without running it
    /// when another holder has the lease.
    ///
    /// The lease is not renewed while `body` runs; a body longer than the
    /// lease duration can overlap with the next holder.
    pub async fn run_exclusive<F, Fut, T>(&self, body: F) -> Result<Option<T>>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(lease) = self.try_lock()? else {
            debug!(mutex_id = %self.id, "mutex busy, skipping exclusive section");
            return Ok(None);
        };
        info!(mutex_id = %self.id, expires_at = %lease.expires_at, "mutex acquired");

        let ticket = lease.ticket.clone();
        let value = body(lease).await;

        if !self.leases.release(&self.id, &ticket)? {
            warn!(mutex_id = %self.id, "lease expired before the exclusive section finished");
        }
        Ok(Some(value))
    }
}
