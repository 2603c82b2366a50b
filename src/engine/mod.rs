mod availability;
mod error;
mod locks;
mod mutations;
mod promote;
mod queries;
mod validate;

pub use availability::{expand_slots, merge_overlapping, subtract_intervals};
pub use error::{ConflictKind, EngineError};
pub use locks::{LockTable, SlotGuard};
pub use promote::PromoteRequest;
pub(crate) use validate::now_ms;

use std::sync::Arc;

use ulid::Ulid;

use crate::catalog::Catalog;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::BookingStore;

pub const DEFAULT_LEASE_TTL_MS: Ms = 5 * 60 * 1000;
pub const DEFAULT_SLOT_MINUTES: u16 = 30;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub lease_ttl_ms: Ms,
    pub slot_minutes: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            slot_minutes: DEFAULT_SLOT_MINUTES,
        }
    }
}

/// The slot reservation core: lock table, booking store and catalog behind
/// one handle. Cheap to share as `Arc<Engine>`.
pub struct Engine {
    pub locks: LockTable,
    pub store: Arc<dyn BookingStore>,
    pub catalog: Arc<Catalog>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn BookingStore>,
        catalog: Arc<Catalog>,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> Self {
        Self {
            locks: LockTable::new(store.clone(), notify.clone(), config.lease_ttl_ms),
            store,
            catalog,
            notify,
            config,
        }
    }

    /// Validate and claim a slot for a session.
    pub async fn acquire(&self, slot: SlotKey, session_id: Ulid) -> Result<Lease, EngineError> {
        self.validate_slot(&slot)?;
        self.locks.acquire(slot, session_id, now_ms()).await
    }

    /// Release a lease. Always succeeds; returns whether a lease was removed.
    pub async fn release(&self, lease_id: Ulid, session_id: Ulid) -> bool {
        self.locks.release(lease_id, session_id).await
    }

    pub async fn release_all_for(&self, session_id: Ulid) -> usize {
        self.locks.release_all_for(session_id).await
    }

    pub async fn sweep_expired(&self) -> usize {
        self.locks.sweep_expired(now_ms()).await
    }
}
