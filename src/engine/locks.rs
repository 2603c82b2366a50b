use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use ulid::Ulid;

use super::EngineError;
use super::error::ConflictKind;
use crate::limits::MAX_ACTIVE_LEASES;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::store::BookingStore;

/// Hold state of a single slot. At most one lease at a time.
#[derive(Debug, Default)]
pub struct SlotState {
    lease: Option<Lease>,
}

/// In-memory table of leases, one async mutex per slot.
///
/// Every mutation goes through a [`SlotGuard`], which broadcasts the slot's
/// new hold state before the guard is released. `leases` is a secondary
/// index kept in step with the per-slot state for lookups by lease id,
/// by session and for read-only views.
pub struct LockTable {
    slots: DashMap<SlotKey, Arc<Mutex<SlotState>>>,
    leases: DashMap<Ulid, Lease>,
    store: Arc<dyn BookingStore>,
    notify: Arc<NotifyHub>,
    ttl: Ms,
}

/// Exclusive access to one slot's hold state.
pub struct SlotGuard<'a> {
    table: &'a LockTable,
    slot: SlotKey,
    state: OwnedMutexGuard<SlotState>,
}

impl SlotGuard<'_> {
    pub fn slot(&self) -> SlotKey {
        self.slot
    }

    /// The lease in place, expired or not.
    pub fn lease(&self) -> Option<&Lease> {
        self.state.lease.as_ref()
    }

    pub fn active_lease(&self, now: Ms) -> Option<&Lease> {
        let ttl = self.table.ttl;
        self.state.lease.as_ref().filter(|l| !l.is_expired(now, ttl))
    }

    /// Install a fresh lease for `session_id`, replacing whatever was there.
    pub fn grant(&mut self, session_id: Ulid, now: Ms) -> Lease {
        if let Some(old) = self.state.lease.take() {
            self.table.leases.remove(&old.id);
            metrics::counter!(observability::LEASES_EXPIRED_TOTAL).increment(1);
            debug!(lease_id = %old.id, slot = %self.slot, "expired lease taken over");
        }
        let lease = Lease {
            id: Ulid::new(),
            slot: self.slot,
            session_id,
            acquired_at: now,
        };
        self.state.lease = Some(lease.clone());
        self.table.leases.insert(lease.id, lease.clone());
        self.table.record_active();
        self.publish();
        lease
    }

    /// Restart the TTL of the current lease. Keeps the lease id.
    pub fn refresh(&mut self, now: Ms) -> Option<Lease> {
        let lease = self.state.lease.as_mut()?;
        lease.acquired_at = now;
        let lease = lease.clone();
        self.table.leases.insert(lease.id, lease.clone());
        self.publish();
        Some(lease)
    }

    pub fn revoke(&mut self) -> Option<Lease> {
        let lease = self.state.lease.take()?;
        self.table.leases.remove(&lease.id);
        self.table.record_active();
        self.publish();
        Some(lease)
    }

    /// Broadcast the full hold map of this slot.
    fn publish(&self) {
        let holders = self
            .state
            .lease
            .iter()
            .map(|l| l.info(self.table.ttl))
            .collect();
        self.table.notify.send(Event::LockStateChanged {
            slot: self.slot,
            holders,
        });
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.state.lease.is_some() {
            return;
        }
        // Prune the entry unless someone else is queued on it. The map holds
        // one reference and this guard the other.
        let cell = OwnedMutexGuard::mutex(&self.state);
        self.table.slots.remove_if(&self.slot, |_, entry| {
            Arc::ptr_eq(entry, cell) && Arc::strong_count(entry) == 2
        });
    }
}

impl LockTable {
    pub fn new(store: Arc<dyn BookingStore>, notify: Arc<NotifyHub>, ttl: Ms) -> Self {
        Self {
            slots: DashMap::new(),
            leases: DashMap::new(),
            store,
            notify,
            ttl,
        }
    }

    pub fn ttl(&self) -> Ms {
        self.ttl
    }

    /// Wait for exclusive access to a slot.
    pub async fn lock(&self, slot: SlotKey) -> SlotGuard<'_> {
        let cell = self.slots.entry(slot).or_default().clone();
        let state = cell.lock_owned().await;
        SlotGuard { table: self, slot, state }
    }

    fn record_active(&self) {
        metrics::gauge!(observability::LEASES_ACTIVE).set(self.leases.len() as f64);
    }

    /// Claim a slot for a session.
    ///
    /// A session re-acquiring its own slot gets the same lease back with a
    /// fresh TTL. An expired lease of another session is replaced.
    pub async fn acquire(&self, slot: SlotKey, session_id: Ulid, now: Ms) -> Result<Lease, EngineError> {
        let mut guard = self.lock(slot).await;

        if self.store.find_active(&slot).await?.is_some() {
            metrics::counter!(observability::LEASE_CONFLICTS_TOTAL, "reason" => "booked").increment(1);
            return Err(EngineError::Conflict(ConflictKind::AlreadyBooked));
        }

        let holder = guard.active_lease(now).map(|l| l.session_id);
        if holder == Some(session_id)
            && let Some(lease) = guard.refresh(now)
        {
            return Ok(lease);
        }
        if holder.is_some() {
            metrics::counter!(observability::LEASE_CONFLICTS_TOTAL, "reason" => "held").increment(1);
            return Err(EngineError::Conflict(ConflictKind::HeldByOtherSession));
        }

        if guard.lease().is_none() && self.leases.len() >= MAX_ACTIVE_LEASES {
            return Err(EngineError::LimitExceeded("too many active leases"));
        }
        let lease = guard.grant(session_id, now);
        metrics::counter!(observability::LEASES_ACQUIRED_TOTAL).increment(1);
        debug!(lease_id = %lease.id, %slot, %session_id, "lease acquired");
        Ok(lease)
    }

    /// Remove a lease if `session_id` owns it. Unknown or foreign lease ids
    /// are a no-op; returns whether anything was removed.
    pub async fn release(&self, lease_id: Ulid, session_id: Ulid) -> bool {
        let Some(slot) = self.leases.get(&lease_id).map(|l| l.slot) else {
            return false;
        };
        let mut guard = self.lock(slot).await;
        let owned = guard
            .lease()
            .is_some_and(|l| l.id == lease_id && l.session_id == session_id);
        if !owned {
            return false;
        }
        guard.revoke();
        metrics::counter!(observability::LEASES_RELEASED_TOTAL, "reason" => "explicit").increment(1);
        debug!(%lease_id, %slot, "lease released");
        true
    }

    /// Drop every lease held by a session. Emits one lock-state event per
    /// slot, then a single session-loss event if anything was removed.
    pub async fn release_all_for(&self, session_id: Ulid) -> usize {
        let slots: Vec<SlotKey> = self
            .leases
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| e.value().slot)
            .collect();

        let mut removed = 0;
        for slot in slots {
            let mut guard = self.lock(slot).await;
            if guard.lease().is_some_and(|l| l.session_id == session_id) {
                guard.revoke();
                removed += 1;
            }
        }

        if removed > 0 {
            metrics::counter!(observability::LEASES_RELEASED_TOTAL, "reason" => "session_lost")
                .increment(removed as u64);
            self.notify.send(Event::LeasesClearedBySessionLoss { session_id });
            debug!(%session_id, removed, "session leases cleared");
        }
        removed
    }

    /// Remove every lease whose TTL has run out as of `now`.
    pub async fn sweep_expired(&self, now: Ms) -> usize {
        let candidates: Vec<SlotKey> = self
            .leases
            .iter()
            .filter(|e| e.value().is_expired(now, self.ttl))
            .map(|e| e.value().slot)
            .collect();

        let mut swept = 0;
        for slot in candidates {
            let mut guard = self.lock(slot).await;
            // Re-check under the lock: the lease may have been refreshed.
            let expired = guard.lease().is_some_and(|l| l.is_expired(now, self.ttl));
            if expired && guard.revoke().is_some() {
                swept += 1;
            }
        }
        if swept > 0 {
            metrics::counter!(observability::LEASES_EXPIRED_TOTAL).increment(swept as u64);
        }
        swept
    }

    /// Unexpired holds across all slots, ordered by slot.
    pub fn snapshot(&self, now: Ms) -> Vec<SlotHolds> {
        let mut by_slot: BTreeMap<SlotKey, Vec<LeaseInfo>> = BTreeMap::new();
        for entry in self.leases.iter() {
            let lease = entry.value();
            if !lease.is_expired(now, self.ttl) {
                by_slot.entry(lease.slot).or_default().push(lease.info(self.ttl));
            }
        }
        by_slot
            .into_iter()
            .map(|(slot, holders)| SlotHolds { slot, holders })
            .collect()
    }

    /// Unexpired holds for one service on one date, keyed by time.
    pub fn holders_on(&self, service_id: Ulid, date: NaiveDate, now: Ms) -> HashMap<TimeOfDay, Lease> {
        self.leases
            .iter()
            .filter(|e| {
                let l = e.value();
                l.slot.service_id == service_id && l.slot.date == date && !l.is_expired(now, self.ttl)
            })
            .map(|e| (e.value().slot.time, e.value().clone()))
            .collect()
    }

    pub fn lease(&self, lease_id: &Ulid) -> Option<Lease> {
        self.leases.get(lease_id).map(|e| e.value().clone())
    }

    pub fn active_lease_count(&self) -> usize {
        self.leases.len()
    }

    /// Number of slots with a live mutex entry. Empty slots are pruned.
    pub fn tracked_slots(&self) -> usize {
        self.slots.len()
    }
}
