use std::path::PathBuf;

use thiserror::Error;
use umbra_common::{ErrorKind, SecurityError};

use crate::lifecycle::ServiceState;

/// Access ledger and bookmark storage errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The provider refused access to the resource
    #[error("Access to {} was denied: {reason}", .path.display())]
    AuthorizationDenied { path: PathBuf, reason: String },

    /// A bookmark could not be created (missing resource or refused grant)
    #[error("Failed to create bookmark for {}: {reason}", .path.display())]
    BookmarkCreation { path: PathBuf, reason: String },

    /// No bookmark is recorded for the path
    #[error("No bookmark recorded for {}", .0.display())]
    BookmarkNotFound(PathBuf),

    /// The token is malformed or its resource can no longer be located
    #[error("Failed to resolve bookmark: {0}")]
    BookmarkResolution(String),

    /// Persisted state could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::AuthorizationDenied { .. } => ErrorKind::AuthorizationDenied,
            LedgerError::BookmarkCreation { .. } | LedgerError::BookmarkResolution(_) => {
                ErrorKind::InvalidInput
            }
            LedgerError::BookmarkNotFound(_) => ErrorKind::KeyNotFound,
            LedgerError::Storage(_) => ErrorKind::InternalError,
        }
    }
}

/// Service lifecycle and container errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service {service} is {state}, expected {expected}")]
    InvalidState {
        service:  String,
        state:    ServiceState,
        expected: ServiceState,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No service registered for type {0}")]
    NotRegistered(&'static str),

    /// Resolution chain that led back to a type already being initialized
    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<&'static str>),

    #[error("Failed to initialize {service}: {reason}")]
    Initialization { service: String, reason: String },

    /// Every failure collected while shutting services down
    #[error("{} service(s) failed to shut down: {}", .0.len(), describe_all(.0))]
    Shutdown(Vec<ServiceError>),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidState { .. } => ErrorKind::InvalidState,
            ServiceError::Configuration(_) => ErrorKind::InvalidInput,
            ServiceError::NotRegistered(_) | ServiceError::Initialization { .. } => {
                ErrorKind::ServiceUnavailable
            }
            ServiceError::DependencyCycle(_) | ServiceError::Shutdown(_) => {
                ErrorKind::InternalError
            }
            ServiceError::Security(err) => err.kind,
            ServiceError::Ledger(err) => err.kind(),
        }
    }
}

fn describe_all(errors: &[ServiceError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_kinds() {
        let denied = LedgerError::AuthorizationDenied {
            path:   "/srv/repo".into(),
            reason: "outside allowed roots".into(),
        };
        assert_eq!(denied.kind(), ErrorKind::AuthorizationDenied);
        assert!(denied.to_string().contains("/srv/repo"));
        assert_eq!(LedgerError::Storage("disk full".into()).kind(), ErrorKind::InternalError);
    }

    #[test]
    fn test_shutdown_error_lists_every_failure() {
        let err = ServiceError::Shutdown(vec![
            ServiceError::Configuration("first".into()),
            ServiceError::Configuration("second".into()),
        ]);
        let message = err.to_string();
        assert!(message.starts_with("2 service(s)"));
        assert!(message.contains("first") && message.contains("second"));
    }

    #[test]
    fn test_security_errors_keep_their_kind() {
        let err: ServiceError = SecurityError::key_not_found("vault").into();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
    }
}
