//! Error types for Cirrus
//!
//! Every layer of the data path surfaces failures through the single
//! [`Error`] enum defined here.

use thiserror::Error;

/// Boxed cause attached to internal errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Common result type for Cirrus operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Common error type for Cirrus
#[derive(Debug, Error)]
pub enum Error {
    /// Bad path, malformed identifier or bad presign parameters
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    /// Reserved for versioned-bucket semantics
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            source: None,
        }
    }

    /// Create an internal error with the original cause attached
    pub fn internal_with(msg: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Internal {
            message: msg.into(),
            source: Some(source.into()),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create an object-not-found error
    pub fn object_not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::ObjectNotFound { .. })
    }

    /// Check if this is an internal error
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Get HTTP status code for handlers that surface these errors
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) | Self::ObjectNotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::Internal { .. } => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::internal_with(format!("filesystem error: {err}"), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_not_found() {
        assert!(Error::object_not_found("b", "k").is_not_found());
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::forbidden("nope").is_not_found());
    }

    #[test]
    fn test_io_error_wraps_as_internal_with_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::from(io);
        assert!(err.is_internal());
        assert!(err.source().is_some());
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::invalid_input("bad").http_status_code(), 400);
        assert_eq!(Error::forbidden("URL expired").http_status_code(), 403);
        assert_eq!(Error::object_not_found("b", "k").http_status_code(), 404);
        assert_eq!(Error::internal("boom").http_status_code(), 500);
    }
}
