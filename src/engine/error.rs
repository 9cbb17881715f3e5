use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::{FieldError, Status};

/// Booking rule failures. All of them are recoverable: the client fixes the
/// request and tries again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The veterinarian already has an active appointment at that time.
    SlotConflict { suggested: NaiveDateTime },
    /// A dog and a cat (or two of either) at the same timestamp.
    SpeciesConflict,
    OwnerLimitExceeded { owner: String, date: NaiveDate },
    NotFound(Ulid),
    /// Only `Active` appointments may be edited.
    InvalidState(Status),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::SlotConflict { suggested } => write!(
                f,
                "slot already taken; suggested time: {}",
                suggested.format("%Y-%m-%dT%H:%M")
            ),
            ValidationError::SpeciesConflict => {
                write!(f, "dogs and cats cannot be booked at the same time")
            }
            ValidationError::OwnerLimitExceeded { owner, date } => {
                write!(f, "{owner} already has 2 appointments on {date}")
            }
            ValidationError::NotFound(id) => write!(f, "appointment not found: {id}"),
            ValidationError::InvalidState(status) => write!(
                f,
                "cannot change an appointment that is {}",
                status.as_str().to_lowercase()
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    InvalidField(FieldError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "{e}"),
            EngineError::InvalidField(e) => write!(f, "invalid field: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Validation(e) => Some(e),
            EngineError::InvalidField(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl From<FieldError> for EngineError {
    fn from(e: FieldError) -> Self {
        EngineError::InvalidField(e)
    }
}
