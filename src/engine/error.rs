use ulid::Ulid;

use crate::schedule::ScheduleError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Experience still has events.
    HasChildren(Ulid),
    /// Session, event or guest still has bookings.
    HasBookings(Ulid),
    /// Ticket type is referenced by a live hold or confirmed booking.
    InUse(Ulid),
    InvalidSpan,
    InvalidInput(String),
    CapacityExceeded {
        requested: u32,
        remaining: u32,
    },
    CapacityBelowCommitted {
        capacity: u32,
        committed: u32,
    },
    SessionClosed(Ulid),
    NotBookable(Ulid),
    HoldExpired(Ulid),
    AlreadyCancelled(Ulid),
    Schedule(ScheduleError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::HasChildren(id) => write!(f, "cannot delete {id}: has events"),
            EngineError::HasBookings(id) => write!(f, "cannot delete {id}: has bookings"),
            EngineError::InUse(id) => {
                write!(f, "ticket type {id} is referenced by active reservations")
            }
            EngineError::InvalidSpan => write!(f, "invalid time range: start must be before end"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::CapacityExceeded { requested, remaining } => write!(
                f,
                "capacity exceeded: requested {requested}, {remaining} remaining"
            ),
            EngineError::CapacityBelowCommitted { capacity, committed } => write!(
                f,
                "capacity {capacity} is below the {committed} tickets already booked or held"
            ),
            EngineError::SessionClosed(id) => write!(f, "session {id} is not open for booking"),
            EngineError::NotBookable(id) => write!(f, "experience {id} is not published"),
            EngineError::HoldExpired(id) => write!(f, "hold {id} has expired"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::Schedule(e) => write!(f, "schedule: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ScheduleError> for EngineError {
    fn from(e: ScheduleError) -> Self {
        EngineError::Schedule(e)
    }
}
