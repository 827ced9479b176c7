use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("slot overlaps booking {0}")]
    Conflict(Ulid),
    #[error("caller {caller} may not {action} booking {booking}")]
    Unauthorized {
        caller: Ulid,
        booking: Ulid,
        action: &'static str,
    },
    #[error("cannot {action} booking {booking} while it is {status}")]
    InvalidState {
        booking: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("station {0} still has active bookings")]
    HasActiveBookings(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
