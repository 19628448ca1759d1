use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Checkout not after check-in. Rejected before any lock is taken.
    InvalidRange {
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    /// Overlap detected under the unit lock. Not retryable without new dates.
    NotAvailable(Ulid),
    /// Confirm attempted after the hold TTL lapsed.
    HoldExpired(Ulid),
    /// Operation not permitted from the reservation's current status.
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
    },
    /// Unit removal refused while held/confirmed reservations exist.
    HasActiveReservations(Ulid),
    /// The unit lock could not be acquired within the bounded wait. Retryable.
    LockTimeout(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code for the wire layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::NotAvailable(_) => "not_available",
            EngineError::HoldExpired(_) => "hold_expired",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::HasActiveReservations(_) => "has_active_reservations",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidRange { start_date, end_date } => {
                write!(f, "invalid range: [{start_date}, {end_date}) has no nights")
            }
            EngineError::NotAvailable(id) => {
                write!(f, "unit {id} is not available for the requested dates")
            }
            EngineError::HoldExpired(id) => write!(f, "hold on reservation {id} has expired"),
            EngineError::InvalidTransition { id, from } => {
                write!(f, "reservation {id} cannot transition from {from}")
            }
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot remove unit {id}: active reservations exist")
            }
            EngineError::LockTimeout(id) => {
                write!(f, "timed out waiting for lock on unit {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
