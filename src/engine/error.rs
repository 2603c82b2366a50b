use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    HeldByOtherSession,
    AlreadyBooked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Conflict(ConflictKind),
    NotFound(Ulid),
    Validation(String),
    LimitExceeded(&'static str),
    StoreUnavailable(String),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Conflict(ConflictKind::HeldByOtherSession) => {
                write!(f, "slot is held by another session")
            }
            EngineError::Conflict(ConflictKind::AlreadyBooked) => write!(f, "slot already booked"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreUnavailable(e) => write!(f, "booking store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate { .. } => EngineError::Conflict(ConflictKind::AlreadyBooked),
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
        }
    }
}
