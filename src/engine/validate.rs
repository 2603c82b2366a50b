use crate::limits::{MAX_CONTACT_LEN, MAX_NAME_LEN};
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid("client name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("client name too long"));
    }
    Ok(())
}

fn validate_contact(contact: &str) -> Result<(), EngineError> {
    if contact.len() > MAX_CONTACT_LEN {
        return Err(EngineError::LimitExceeded("client contact too long"));
    }
    Ok(())
}

pub(crate) fn validate_client(client: &ClientDetails) -> Result<(), EngineError> {
    validate_name(&client.name)?;
    validate_contact(&client.contact)
}

pub(crate) fn validate_patch(patch: &BookingPatch) -> Result<(), EngineError> {
    if patch.is_empty() {
        return Err(EngineError::invalid("empty update"));
    }
    if let Some(name) = &patch.client_name {
        validate_name(name)?;
    }
    if let Some(contact) = &patch.client_contact {
        validate_contact(contact)?;
    }
    Ok(())
}

impl Engine {
    /// A slot is valid when its service exists and its time is one of the
    /// working slots generated for that date.
    pub(crate) fn validate_slot(&self, slot: &SlotKey) -> Result<(), EngineError> {
        if self.catalog.service(&slot.service_id).is_none() {
            return Err(EngineError::invalid(format!("unknown service {}", slot.service_id)));
        }
        if !self.working_slots(slot.date).contains(&slot.time) {
            return Err(EngineError::invalid(format!(
                "{} is not a bookable time on {}",
                slot.time, slot.date
            )));
        }
        Ok(())
    }
}
