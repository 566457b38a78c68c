//! Error taxonomy shared by both sides of the bridge.
//!
//! [`ErrorKind`] is the closed local set every operation reports through.
//! [`RemoteError`] is the shape errors take while crossing the process
//! boundary: a domain string, a numeric code and a human readable
//! description. Errors from a domain we do not know, or codes we do not
//! recognise, come back as [`ErrorKind::InternalError`] with the original
//! description preserved.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error domain used for codes produced by the Umbra helper
pub const SECURITY_ERROR_DOMAIN: &str = "umbra.security";

/// Closed set of failure categories for security operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The remote service cannot be reached or the connection is invalidated
    ServiceUnavailable,
    /// The operation is not valid in the current lifecycle state
    InvalidState,
    /// Arguments were malformed or missing
    InvalidInput,
    /// The caller is not allowed to perform the operation
    AuthorizationDenied,
    /// A cryptographic primitive failed
    CryptographicError,
    /// No key exists under the requested identifier
    KeyNotFound,
    /// The operation is not supported
    NotImplemented,
    /// The connection dropped while the operation was in flight
    ConnectionInterrupted,
    /// Anything else
    InternalError,
    /// The operation exceeded its time bound
    Timeout,
}

impl ErrorKind {
    /// All kinds, in code order
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::ServiceUnavailable,
        ErrorKind::InvalidState,
        ErrorKind::InvalidInput,
        ErrorKind::AuthorizationDenied,
        ErrorKind::CryptographicError,
        ErrorKind::KeyNotFound,
        ErrorKind::NotImplemented,
        ErrorKind::ConnectionInterrupted,
        ErrorKind::InternalError,
        ErrorKind::Timeout,
    ];

    /// Numeric code used in [`SECURITY_ERROR_DOMAIN`]
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::ServiceUnavailable => 1,
            ErrorKind::InvalidState => 2,
            ErrorKind::InvalidInput => 3,
            ErrorKind::AuthorizationDenied => 4,
            ErrorKind::CryptographicError => 5,
            ErrorKind::KeyNotFound => 6,
            ErrorKind::NotImplemented => 7,
            ErrorKind::ConnectionInterrupted => 8,
            ErrorKind::InternalError => 9,
            ErrorKind::Timeout => 10,
        }
    }

    /// Inverse of [`ErrorKind::code`]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    fn label(self) -> &'static str {
        match self {
            ErrorKind::ServiceUnavailable => "service unavailable",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::AuthorizationDenied => "authorization denied",
            ErrorKind::CryptographicError => "cryptographic error",
            ErrorKind::KeyNotFound => "key not found",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::ConnectionInterrupted => "connection interrupted",
            ErrorKind::InternalError => "internal error",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Uniform error returned by every bridge operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {description}")]
pub struct SecurityError {
    /// Failure category
    pub kind:        ErrorKind,
    /// Human readable detail, never dropped when mapping across the boundary
    pub description: String,
}

impl SecurityError {
    /// Creates an error of the given kind
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Shorthand for [`ErrorKind::ServiceUnavailable`]
    pub fn unavailable(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, description)
    }

    /// Shorthand for [`ErrorKind::InvalidInput`]
    pub fn invalid_input(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, description)
    }

    /// Shorthand for [`ErrorKind::KeyNotFound`]
    pub fn key_not_found(identifier: &str) -> Self {
        Self::new(ErrorKind::KeyNotFound, format!("no key with identifier '{identifier}'"))
    }

    /// Shorthand for [`ErrorKind::InternalError`]
    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, description)
    }

    /// Converts into the boundary representation
    pub fn to_remote(&self) -> RemoteError {
        RemoteError {
            domain:      SECURITY_ERROR_DOMAIN.to_string(),
            code:        self.kind.code(),
            description: self.description.clone(),
        }
    }
}

/// Error as carried across the process boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Originating error domain
    pub domain:      String,
    /// Domain specific code
    pub code:        i32,
    /// Description supplied by the remote side
    pub description: String,
}

impl RemoteError {
    /// Maps into the local taxonomy. Unknown domains and codes become
    /// [`ErrorKind::InternalError`] carrying the remote description.
    pub fn into_local(self) -> SecurityError {
        let kind = if self.domain == SECURITY_ERROR_DOMAIN {
            ErrorKind::from_code(self.code)
        } else {
            None
        };

        match kind {
            Some(kind) => SecurityError::new(kind, self.description),
            None => SecurityError::internal(format!(
                "{} (domain {}, code {})",
                self.description, self.domain, self.code
            )),
        }
    }
}

impl From<SecurityError> for RemoteError {
    fn from(err: SecurityError) -> Self {
        err.to_remote()
    }
}

impl From<RemoteError> for SecurityError {
    fn from(err: RemoteError) -> Self {
        err.into_local()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_every_kind_survives_the_boundary() {
        for kind in ErrorKind::ALL {
            let local = SecurityError::new(kind, "detail");
            let back = local.to_remote().into_local();
            assert_eq!(back, local);
        }
    }

    #[test]
    fn test_unknown_domain_falls_back_to_internal() {
        let remote = RemoteError {
            domain:      "NSCocoaErrorDomain".to_string(),
            code:        4,
            description: "file vanished".to_string(),
        };

        let local = remote.into_local();
        assert_eq!(local.kind, ErrorKind::InternalError);
        assert!(local.description.contains("file vanished"));
        assert!(local.description.contains("NSCocoaErrorDomain"));
    }

    #[test]
    fn test_unknown_code_falls_back_to_internal() {
        let remote = RemoteError {
            domain:      SECURITY_ERROR_DOMAIN.to_string(),
            code:        999,
            description: "future error".to_string(),
        };

        let local = remote.into_local();
        assert_eq!(local.kind, ErrorKind::InternalError);
        assert!(local.description.contains("future error"));
    }

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<i32> = ErrorKind::ALL.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), ErrorKind::ALL.len());
    }
}
