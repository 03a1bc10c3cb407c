use thiserror::Error;

use crate::domain::entry::{EntryId, EntryStatus};
use crate::lifecycle::Operation;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unsupported file format")]
    UnsupportedFileFormat,
    #[error("entry {entry_id} cannot {operation} while {status}")]
    InvalidStateTransition { entry_id: EntryId, status: EntryStatus, operation: Operation },
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: i64 },
    #[error("entry {entry_id} was modified concurrently")]
    ConcurrentModification { entry_id: EntryId },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(resource: &'static str, id: i64) -> Self {
        Self::NotFound { resource, id }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("render failure: {0}")]
    Render(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("upstream unavailable: {0}")]
    Upstream(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::UnsupportedMediaType { .. } => {
                "Only PDF, PNG, GIF and JPEG files are accepted."
            }
            Self::Conflict { .. } => {
                "The entry is not in a state that allows this action. Reload and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::UnsupportedMediaType { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::UnsupportedMediaType { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

const UNASSIGNED: &str = "unassigned";

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = UNASSIGNED.to_owned();
        match value {
            ApplicationError::Domain(error) => {
                let message = error.to_string();
                match error {
                    DomainError::Validation(_) | DomainError::InvariantViolation(_) => {
                        Self::BadRequest { message, correlation_id }
                    }
                    DomainError::UnsupportedFileFormat => {
                        Self::UnsupportedMediaType { message, correlation_id }
                    }
                    DomainError::NotFound { .. } => Self::NotFound { message, correlation_id },
                    DomainError::InvalidStateTransition { .. }
                    | DomainError::ConcurrentModification { .. } => {
                        Self::Conflict { message, correlation_id }
                    }
                }
            }
            ApplicationError::Persistence(message) | ApplicationError::Upstream(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Render(message) | ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id }
            }
        }
    }
}
