//! Error types for the Datagate service.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ratelimit::Tier;

/// Coarse error classes exposed at the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed input (400)
    Validation,
    /// Missing or rejected credentials (401)
    Unauthenticated,
    /// Authenticated but not authorized (403)
    Forbidden,
    /// Path traversal or disallowed extension (403)
    Security,
    /// Quota exhausted (429)
    RateLimit,
    /// Resource does not exist (404)
    NotFound,
    /// Unexpected fault (500)
    Internal,
}

impl ErrorClass {
    /// Stable identifier used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "VALIDATION",
            ErrorClass::Unauthenticated => "UNAUTHENTICATED",
            ErrorClass::Forbidden => "FORBIDDEN",
            ErrorClass::Security => "SECURITY",
            ErrorClass::RateLimit => "RATE_LIMIT",
            ErrorClass::NotFound => "NOT_FOUND",
            ErrorClass::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of security rule a rejected path broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityViolation {
    /// A traversal sequence or encoded equivalent; carries the pattern name.
    PathTraversal { pattern: &'static str },
    /// The file extension is not in the whitelist.
    DisallowedExtension,
}

impl std::fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityViolation::PathTraversal { pattern } => {
                write!(f, "PATH_TRAVERSAL ({})", pattern)
            }
            SecurityViolation::DisallowedExtension => f.write_str("DISALLOWED_EXTENSION"),
        }
    }
}

/// Main error type for Datagate operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or rejected bearer token
    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    /// The user's tier is below the endpoint's required tier
    #[error("Tier {user_tier} is below required tier {required_tier}")]
    InsufficientTier { user_tier: Tier, required_tier: Tier },

    /// Any other authorization denial
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Security-classed path rejection
    #[error("Security violation: {0}")]
    Security(SecurityViolation),

    /// The caller exhausted its quota
    #[error("Rate limit exceeded: {limit} requests, resets at {reset_time}")]
    RateLimited {
        limit: u32,
        reset_time: DateTime<Utc>,
        retry_after_secs: u64,
    },

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unexpected internal fault
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The boundary class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Validation(_) => ErrorClass::Validation,
            GatewayError::Unauthenticated(_) => ErrorClass::Unauthenticated,
            GatewayError::InsufficientTier { .. } | GatewayError::Forbidden(_) => {
                ErrorClass::Forbidden
            }
            GatewayError::Security(_) => ErrorClass::Security,
            GatewayError::RateLimited { .. } => ErrorClass::RateLimit,
            GatewayError::NotFound(_) => ErrorClass::NotFound,
            GatewayError::Internal(_) | GatewayError::Config(_) | GatewayError::Io(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Returns true for path traversal rejections.
    pub fn is_path_traversal(&self) -> bool {
        matches!(
            self,
            GatewayError::Security(SecurityViolation::PathTraversal { .. })
        )
    }
}

/// Result type alias for Datagate operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            GatewayError::Validation("x".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            GatewayError::InsufficientTier {
                user_tier: Tier::Tier1,
                required_tier: Tier::Tier2,
            }
            .class(),
            ErrorClass::Forbidden
        );
        assert_eq!(
            GatewayError::Config("bad".into()).class(),
            ErrorClass::Internal
        );
        assert_eq!(
            GatewayError::Security(SecurityViolation::DisallowedExtension).class(),
            ErrorClass::Security
        );
    }

    #[test]
    fn test_path_traversal_detection() {
        let err = GatewayError::Security(SecurityViolation::PathTraversal {
            pattern: "dot-dot segment",
        });
        assert!(err.is_path_traversal());
        assert!(!GatewayError::Security(SecurityViolation::DisallowedExtension).is_path_traversal());
        assert_eq!(err.to_string(), "Security violation: PATH_TRAVERSAL (dot-dot segment)");
    }
}
