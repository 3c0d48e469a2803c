use ulid::Ulid;

use crate::model::{AppointmentStatus, Ms};
use crate::repository::RepositoryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidInterval {
        start: Ms,
        end: Ms,
    },
    InvalidSlotSet(String),
    NoAvailability,
    SlotFull,
    IllegalTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    TimeConstraintViolated {
        ends_at: Ms,
        now: Ms,
    },
    NotFound(Ulid),
    Conflict(Ulid),
    LockTimeout,
    LimitExceeded(&'static str),
    Storage(String),
}

impl EngineError {
    /// Expected, typed outcomes of a request, as opposed to infrastructure failures.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EngineError::LockTimeout | EngineError::Storage(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::InvalidSlotSet(msg) => write!(f, "invalid slot set: {msg}"),
            EngineError::NoAvailability => {
                write!(f, "no published availability covers the requested interval")
            }
            EngineError::SlotFull => write!(f, "slot full: no remaining capacity"),
            EngineError::IllegalTransition { from, to } => {
                write!(f, "illegal transition from {from} to {to}")
            }
            EngineError::TimeConstraintViolated { ends_at, now } => {
                write!(f, "appointment ends at {ends_at}, not yet passed (now {now})")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(id) => write!(f, "concurrent modification of appointment: {id}"),
            EngineError::LockTimeout => write!(f, "timed out waiting for provider lock"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RepositoryError> for EngineError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Conflict(id) => EngineError::Conflict(id),
            RepositoryError::Unavailable(msg) => EngineError::Storage(msg),
        }
    }
}
