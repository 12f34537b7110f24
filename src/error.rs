use thiserror::Error;

/// Classifies selector resolution failures for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionErrorKind {
    /// A `@<network>/<peer>` selector names a peer that is not established
    Unresolved,
    /// The target backend lacks the capability the selector needs
    MissingCapability,
    /// Subject-name selector used on the wrong side of the traffic
    InvalidPosition,
}

/// Classifies backend apply/remove errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorKind {
    /// Backend did not answer within the caller-supplied timeout
    Timeout,
    /// Backend temporarily busy (lock held, transaction conflict)
    Busy,
    /// Backend rejected the generated configuration
    Malformed,
    /// Backend refused the operation for lack of privileges
    PermissionDenied,
    /// No backend registered for the target, or any other hard failure
    Backend,
}

impl ApplyErrorKind {
    /// Transient failures are retried with backoff; the rest surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyErrorKind::Timeout | ApplyErrorKind::Busy)
    }
}

/// ACL engine error types
#[derive(Error, Debug)]
pub enum AclError {
    #[error("Invalid ACL {acl:?}: {field}: {message}")]
    Validation {
        acl: String,
        field: String,
        message: String,
    },

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Selector {selector:?} on backend {backend:?}: {message}")]
    Resolution {
        kind: ResolutionErrorKind,
        selector: String,
        backend: String,
        message: String,
    },

    #[error("Compile error for {target}: {message}")]
    Compile { target: String, message: String },

    #[error("Apply error on backend {backend:?} for {target}: {message}")]
    Apply {
        kind: ApplyErrorKind,
        backend: String,
        target: String,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("In use: {0}")]
    InUse(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl AclError {
    pub(crate) fn validation(
        acl: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AclError::Validation {
            acl: acl.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether a failed apply should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, AclError::Apply { kind, .. } if kind.is_transient())
    }
}

pub type Result<T> = std::result::Result<T, AclError>;
