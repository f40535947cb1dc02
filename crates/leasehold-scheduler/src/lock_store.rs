use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use leasehold_core::Ticket;
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::db::{opt_time, store_now, to_db_time, Database};
use crate::error::{Result, SchedulerError};
use crate::types::{Lease, MutexRecord};

/// Row access for the `mutexes` table.
///
/// Every state change is one conditional statement; the row count it
/// reports is the verdict.
#[derive(Clone)]
pub struct LockStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl LockStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        store_now(self.clock.as_ref())
    }

    /// Acquire `id` for `ticket`, or renew it if `ticket` already holds it.
    ///
    /// Succeeds when the row is absent (created here), unlocked, expired, or
    /// held by the same ticket. Returns `None` without touching the row
    /// otherwise.
    #[instrument(skip(self, ticket), fields(mutex_id = %id))]
    pub fn try_acquire_or_renew(
        &self,
        id: &str,
        ticket: &Ticket,
        lease: chrono::Duration,
    ) -> Result<Option<Lease>> {
        let now = self.now();
        let expires_at = now
            .checked_add_signed(lease)
            .ok_or_else(|| {
                SchedulerError::InvalidLease(format!("lease of {lease} overflows the clock"))
            })?
            .trunc_subsecs(3);
        let now_str = to_db_time(now);

        let conn = self.db.lock()?;
        let changed = conn.execute(
            "INSERT INTO mutexes
                 (id, current_lock_ticket, current_lock_acquired_at, current_lock_expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 current_lock_ticket      = excluded.current_lock_ticket,
                 current_lock_acquired_at = excluded.current_lock_acquired_at,
                 current_lock_expires_at  = excluded.current_lock_expires_at
             WHERE mutexes.current_lock_ticket IS NULL
                OR mutexes.current_lock_ticket = excluded.current_lock_ticket
                OR mutexes.current_lock_expires_at IS NULL
                OR mutexes.current_lock_expires_at <= ?3",
            rusqlite::params![id, ticket.as_str(), now_str, to_db_time(expires_at)],
        )?;

        if changed == 0 {
            debug!("mutex held by another ticket");
            return Ok(None);
        }
        Ok(Some(Lease {
            mutex_id: id.to_string(),
            ticket: ticket.clone(),
            acquired_at: now,
            expires_at,
        }))
    }

    /// Clear the lease if `ticket` still holds it. Stale releases change nothing.
    #[instrument(skip(self, ticket), fields(mutex_id = %id))]
    pub fn release(&self, id: &str, ticket: &Ticket) -> Result<bool> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE mutexes
             SET current_lock_ticket = NULL,
                 current_lock_acquired_at = NULL,
                 current_lock_expires_at = NULL
             WHERE id = ?1 AND current_lock_ticket = ?2",
            rusqlite::params![id, ticket.as_str()],
        )?;
        Ok(changed == 1)
    }

    pub fn get(&self, id: &str) -> Result<Option<MutexRecord>> {
        let conn = self.db.lock()?;
        let record = conn
            .query_row(
                "SELECT id, current_lock_ticket, current_lock_acquired_at, current_lock_expires_at
                 FROM mutexes WHERE id = ?1",
                [id],
                row_to_mutex,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<MutexRecord>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, current_lock_ticket, current_lock_acquired_at, current_lock_expires_at
             FROM mutexes ORDER BY id",
        )?;
        let records = stmt
            .query_map([], row_to_mutex)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Clear every lease whose expiry has passed. Returns the number cleared.
    #[instrument(skip(self))]
    pub fn reset_expired(&self) -> Result<usize> {
        let now_str = to_db_time(self.now());
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE mutexes
             SET current_lock_ticket = NULL,
                 current_lock_acquired_at = NULL,
                 current_lock_expires_at = NULL
             WHERE current_lock_ticket IS NOT NULL
               AND (current_lock_expires_at IS NULL OR current_lock_expires_at <= ?1)",
            [&now_str],
        )?;
        Ok(changed)
    }
}

fn row_to_mutex(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutexRecord> {
    Ok(MutexRecord {
        id: row.get(0)?,
        current_lock_ticket: row.get::<_, Option<String>>(1)?.map(Ticket::from),
        current_lock_acquired_at: opt_time(row, 2)?,
        current_lock_expires_at: opt_time(row, 3)?,
    })
}
