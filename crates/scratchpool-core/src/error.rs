//! Error types for scratchpool
//!
//! Two layers:
//! - [`RemoteError`]: what a single round trip to the remote store can report
//! - [`PoolError`]: the pool-level failure kinds seen by callers
//!
//! The [`Retryable`] trait is the seam used by the retry combinator to decide
//! whether a failure is worth another attempt.

use crate::types::RecordId;

/// Outcome of a failed round trip against the remote store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Connection, DNS or timeout failure before a response arrived
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote store throttled the request
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// 5xx response
    #[error("remote unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// 401 - the session handle is no longer valid
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 400 - the remote store rejected the request
    #[error("validation failed [{code}]: {message}")]
    Validation { code: String, message: String },

    /// 404
    #[error("not found: {0}")]
    NotFound(String),

    /// 412 - a conditional write lost against a newer write
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The response body did not have the expected shape
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Check if the failure is transient (worth retrying)
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited(_) | Self::Unavailable { .. }
        )
    }

    /// Validation error code, if this is a validation failure
    #[must_use]
    pub fn validation_code(&self) -> Option<&str> {
        match self {
            Self::Validation { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Pipeline stage at which a provisioned environment was left unusable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStage {
    /// Resolving the login URL from the signup record
    LoginUrl,
    /// Generating the access credential
    Credential,
    /// Marking the record Active
    Activation,
}

impl std::fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LoginUrl => "login-url",
            Self::Credential => "credential",
            Self::Activation => "activation",
        };
        f.write_str(s)
    }
}

/// Pool-level error
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A remote call failed (transient kinds are absorbed by retries first)
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A record written earlier is not yet visible to queries
    #[error("{object} record for {key} not yet visible")]
    NotYetVisible { object: String, key: String },

    /// Nothing matches (e.g. named sandbox absent)
    #[error("not found: {0}")]
    NotFound(String),

    /// A claim lost the race against another caller
    #[error("record {record_id} was claimed by another caller")]
    Conflict { record_id: RecordId },

    /// Environment creation failed after the retry budget
    #[error("provisioning of {alias} failed: {source}")]
    ProvisioningFailed {
        alias: String,
        #[source]
        source: Box<PoolError>,
    },

    /// Environment exists remotely but post-create steps failed; it is marked Error
    #[error("environment {record_id} left in Error state at {stage} stage: {reason}")]
    PartialProvisioning {
        record_id: RecordId,
        stage: ProvisioningStage,
        reason: String,
    },

    /// A remote record failed typed validation
    #[error("malformed {object} record: {reason}")]
    MalformedRecord { object: String, reason: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Create a malformed record error
    #[inline]
    pub fn malformed(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            object: object.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a lost claim race
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::Remote(RemoteError::PreconditionFailed(_))
        )
    }

    /// Check if this is a non-fatal partial provisioning warning
    #[inline]
    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartialProvisioning { .. })
    }
}

/// Classifies failures for the retry combinator
pub trait Retryable {
    /// Whether another attempt may succeed
    fn is_transient(&self) -> bool;
}

impl Retryable for RemoteError {
    fn is_transient(&self) -> bool {
        RemoteError::is_transient(self)
    }
}

impl Retryable for PoolError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_transient(),
            Self::NotYetVisible { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_transience() {
        assert!(RemoteError::Transport("reset".into()).is_transient());
        assert!(RemoteError::RateLimited("REQUEST_LIMIT_EXCEEDED".into()).is_transient());
        assert!(RemoteError::Unavailable {
            status: 503,
            message: String::new()
        }
        .is_transient());

        assert!(!RemoteError::Unauthorized("expired".into()).is_transient());
        assert!(!RemoteError::NotFound("x".into()).is_transient());
        assert!(!RemoteError::Validation {
            code: "FIELD_INTEGRITY_EXCEPTION".into(),
            message: "bad".into()
        }
        .is_transient());
    }

    #[test]
    fn pool_error_transience() {
        let lag = PoolError::NotYetVisible {
            object: "ScratchOrgInfo".into(),
            key: "u@example.com".into(),
        };
        assert!(lag.is_transient());
        assert!(PoolError::from(RemoteError::Transport("x".into())).is_transient());
        assert!(!PoolError::NotFound("sandboxA".into()).is_transient());
    }

    #[test]
    fn precondition_failure_is_conflict() {
        let err = PoolError::from(RemoteError::PreconditionFailed("modified".into()));
        assert!(err.is_conflict());
        assert!(!PoolError::NotFound("x".into()).is_conflict());
    }

    #[test]
    fn display_messages() {
        let err = RemoteError::Validation {
            code: "DUPLICATE_USERNAME".into(),
            message: "taken".into(),
        };
        assert_eq!(err.to_string(), "validation failed [DUPLICATE_USERNAME]: taken");
        assert_eq!(ProvisioningStage::Credential.to_string(), "credential");
    }
}
