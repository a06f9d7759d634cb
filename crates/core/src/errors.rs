use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy. Transient failures are retried with backoff, validation
/// failures are rejected immediately, policy rejections are surfaced for
/// review, terminal failures require manual intervention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Validation,
    PolicyRejection,
    Terminal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::PolicyRejection => "policy_rejection",
            Self::Terminal => "terminal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transient" => Some(Self::Transient),
            "validation" => Some(Self::Validation),
            "policy_rejection" => Some(Self::PolicyRejection),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("unknown action kind `{0}`")]
    UnknownActionKind(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("platform call failed: {0}")]
    Platform(String),
    #[error("origin fetch failed: {0}")]
    Origin(String),
    #[error("deadline exceeded: {0}")]
    Timeout(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Domain(_) => ErrorClass::Validation,
            Self::Persistence(_) | Self::Platform(_) | Self::Origin(_) | Self::Timeout(_) => {
                ErrorClass::Transient
            }
            Self::Configuration(_) => ErrorClass::Terminal,
        }
    }
}

/// Errors crossing the read API boundary. `Unavailable` carries the
/// retry-after hint returned on a true empty-cache-plus-origin-failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("service unavailable: {message}")]
    Unavailable { message: String, retry_after_secs: u64 },
    #[error("internal error: {message}")]
    Internal { message: String },
}

#[cfg(test)]
mod tests {
    use super::{ApplicationError, DomainError, ErrorClass};

    #[test]
    fn error_class_round_trips_from_storage_encoding() {
        for class in [
            ErrorClass::Transient,
            ErrorClass::Validation,
            ErrorClass::PolicyRejection,
            ErrorClass::Terminal,
        ] {
            assert_eq!(ErrorClass::parse(class.as_str()), Some(class));
        }
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::PolicyRejection.is_retryable());
        assert!(!ErrorClass::Terminal.is_retryable());
    }

    #[test]
    fn domain_errors_classify_as_validation() {
        let error = ApplicationError::from(DomainError::InvalidSnapshot("bad ctr".to_string()));
        assert_eq!(error.class(), ErrorClass::Validation);
    }

    #[test]
    fn timeouts_classify_as_transient_not_unknown() {
        let error = ApplicationError::Timeout("platform apply".to_string());
        assert_eq!(error.class(), ErrorClass::Transient);
    }
}
