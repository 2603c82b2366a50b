use ulid::Ulid;

use crate::model::*;

use super::validate::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// All bookings, ordered by date then time (creation order breaks ties).
    pub async fn list_bookings(&self) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self.store.list().await?;
        bookings.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then(a.time.cmp(&b.time))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(bookings)
    }

    /// Pending and confirmed bookings, in the same order as `list_bookings`.
    pub async fn active_bookings(&self) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self.list_bookings().await?;
        bookings.retain(Booking::is_active);
        Ok(bookings)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.get(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Current unexpired holds, for subscribers that ask for a snapshot.
    pub fn lock_snapshot(&self) -> Vec<SlotHolds> {
        self.locks.snapshot(now_ms())
    }
}
