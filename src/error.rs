//! Unified error types for the model repository manager
//!
//! All failures surface as a `ManagerError`. Per-model failures during a
//! poll or load wave are recorded on the affected dependency node and never
//! abort the surrounding operation; operation-level failures (mode
//! violations, unknown repositories) are returned directly.

use thiserror::Error;

/// Unified error type for repository manager operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManagerError {
    /// Request referenced an unknown model, version, or repository
    #[error("{0}")]
    NotFound(String),

    /// Repository or path registration conflict
    #[error("{0}")]
    AlreadyExists(String),

    /// Incompatible mode flags or invalid model configuration
    #[error("{0}")]
    InvalidArgument(String),

    /// Model is known but has no usable version
    #[error("{0}")]
    Unavailable(String),

    /// Unexpected lifecycle or filesystem failure
    #[error("{0}")]
    Internal(String),
}

impl ManagerError {
    /// Get a short error code for this error kind
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<std::io::Error> for ManagerError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("failed to parse model configuration: {err}"))
    }
}

/// Result type alias using ManagerError
pub type ManagerResult<T> = Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ManagerError::not_found("model 'x' is not found").error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            ManagerError::already_exists("repository already registered").error_code(),
            "ALREADY_EXISTS"
        );
        assert_eq!(
            ManagerError::invalid_argument("bad config").error_code(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            ManagerError::unavailable("no ready version").error_code(),
            "UNAVAILABLE"
        );
        assert_eq!(ManagerError::internal("boom").error_code(), "INTERNAL");
    }

    #[test]
    fn test_error_display_is_message_only() {
        let err = ManagerError::not_found("model 'resnet' is not found");
        assert_eq!(err.to_string(), "model 'resnet' is not found");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ManagerError = io_err.into();
        assert!(matches!(err, ManagerError::Internal(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let err: ManagerError = json_err.into();
        assert!(matches!(err, ManagerError::InvalidArgument(_)));
    }
}
