use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::validate::{now_ms, validate_patch};
use super::{Engine, EngineError};

impl Engine {
    /// Apply an operator edit. Status changes are unrestricted, except that a
    /// booking cannot become active on a slot that already has an active one.
    pub async fn update_booking(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, EngineError> {
        validate_patch(&patch)?;
        let current = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;

        let _guard = self.locks.lock(current.slot()).await;
        let updated = self.store.update(id, &patch, now_ms()).await?;
        self.notify.send(Event::BookingUpdated { booking: updated.clone() });
        info!(booking_id = %id, status = %updated.status, "booking updated");
        Ok(updated)
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let current = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;

        let _guard = self.locks.lock(current.slot()).await;
        let removed = self.store.delete(id).await?;
        self.notify.send(Event::BookingDeleted {
            slot: removed.slot(),
            booking_id: removed.id,
        });
        info!(booking_id = %id, slot = %removed.slot(), "booking deleted");
        Ok(removed)
    }
}
