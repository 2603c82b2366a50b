use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::error::ConflictKind;
use super::validate::{now_ms, validate_client};
use super::{Engine, EngineError};

/// Everything needed to turn a hold into a booking.
#[derive(Debug, Clone)]
pub struct PromoteRequest {
    /// Lease the client believes it holds. May be stale or absent.
    pub lease_id: Option<Ulid>,
    pub session_id: Ulid,
    pub slot: SlotKey,
    pub client: ClientDetails,
}

enum Holder {
    Caller(Ulid),
    Other,
    Nobody,
}

impl Engine {
    pub async fn promote(&self, req: PromoteRequest) -> Result<Booking, EngineError> {
        self.promote_at(req, now_ms()).await
    }

    /// Promote a held slot into a pending booking.
    ///
    /// A caller without a live lease is still served when the slot is free
    /// and nobody else holds it. The store's unique index decides any race
    /// that gets past the lock table; the loser gets `Conflict`, no retry.
    pub async fn promote_at(&self, req: PromoteRequest, now: Ms) -> Result<Booking, EngineError> {
        validate_client(&req.client)?;
        self.validate_slot(&req.slot)?;
        if let Some(lease_id) = req.lease_id
            && let Some(lease) = self.locks.lease(&lease_id)
            && lease.session_id == req.session_id
            && lease.slot != req.slot
        {
            return Err(EngineError::invalid(format!(
                "lease {lease_id} is for {}, not {}",
                lease.slot, req.slot
            )));
        }

        let mut guard = self.locks.lock(req.slot).await;
        let holder = match guard.active_lease(now) {
            Some(l) if l.session_id == req.session_id => Holder::Caller(l.id),
            Some(_) => Holder::Other,
            None => Holder::Nobody,
        };
        let lease_origin = match holder {
            Holder::Caller(id) => Some(id),
            Holder::Other => {
                metrics::counter!(observability::PROMOTIONS_TOTAL, "outcome" => "held").increment(1);
                return Err(EngineError::Conflict(ConflictKind::HeldByOtherSession));
            }
            Holder::Nobody => None,
        };

        if self.store.find_active(&req.slot).await?.is_some() {
            metrics::counter!(observability::PROMOTIONS_TOTAL, "outcome" => "booked").increment(1);
            return Err(EngineError::Conflict(ConflictKind::AlreadyBooked));
        }

        let booking = Booking {
            id: Ulid::new(),
            service_id: req.slot.service_id,
            date: req.slot.date,
            time: req.slot.time,
            client_name: req.client.name,
            client_contact: req.client.contact,
            status: BookingStatus::Pending,
            lease_origin,
            created_at: now,
            updated_at: now,
        };
        let booking = match self.store.insert(booking).await {
            Ok(b) => b,
            Err(e) => {
                metrics::counter!(observability::PROMOTIONS_TOTAL, "outcome" => "rejected").increment(1);
                return Err(e.into());
            }
        };

        // Booked now, so any lease left on the slot is moot.
        guard.revoke();
        self.notify.send(Event::BookingCreated { booking: booking.clone() });
        metrics::counter!(observability::PROMOTIONS_TOTAL, "outcome" => "created").increment(1);
        info!(
            booking_id = %booking.id,
            slot = %req.slot,
            session_id = %req.session_id,
            with_lease = lease_origin.is_some(),
            "booking created"
        );
        Ok(booking)
    }
}
