//! Error types for the groundwork reconciliation engine.
//!
//! Errors are grouped by the phase that produces them: specification
//! building, state persistence, provider calls, planning and execution.
//! Everything raised while planning happens before any real-world mutation.

use std::path::PathBuf;
use std::time::Duration;
use serde::Serialize;
use thiserror::Error;

/// The main error type for the groundwork engine.
#[derive(Debug, Error)]
pub enum GroundworkError {
    /// Malformed, cyclic or unresolved specification input.
    #[error("Specification error: {0}")]
    Specification(#[from] SpecificationError),

    /// State persistence errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider plugin errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// A resource operation failed during apply.
    #[error("Execution failure: {0}")]
    Execution(#[from] ExecutionFailure),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors in the declarative specification.
#[derive(Debug, Error)]
pub enum SpecificationError {
    /// The specification file was not found.
    #[error("Specification file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The specification document could not be parsed.
    #[error("Failed to parse specification: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Specification validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing or malformed.
    #[error("Invalid environment variable: {name}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
    },

    /// Two declarations resolve to the same logical id.
    #[error("Duplicate logical id: {logical_id}")]
    DuplicateId {
        /// The duplicated logical id.
        logical_id: String,
    },

    /// A reference or `depends_on` entry names a resource that does not exist.
    #[error("Resource '{from}' references unknown resource '{target}'")]
    UnresolvedReference {
        /// Resource holding the reference.
        from: String,
        /// The missing target.
        target: String,
    },

    /// The dependency edges contain a cycle.
    #[error("Circular dependency detected: {cycle}")]
    CyclicDependency {
        /// The cycle path, e.g. `a -> b -> a`.
        cycle: String,
    },

    /// No provider is registered for a resource type.
    #[error("No provider registered for resource type '{resource_type}'")]
    UnknownResourceType {
        /// The unsupported resource type.
        resource_type: String,
    },
}

/// State persistence errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Persisted state cannot be parsed into valid records.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version is not supported.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Supported state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// No record exists for the given logical id.
    #[error("No state record for '{logical_id}'")]
    RecordNotFound {
        /// The missing logical id.
        logical_id: String,
    },
}

/// Errors reported by provider plugins.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Retryable failure (network timeout, throttling).
    #[error("Transient provider error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Provider hint for how long to wait before retrying.
        retry_after: Option<Duration>,
    },

    /// Non-retryable failure (validation, permission denial).
    #[error("Permanent provider error: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// The physical resource does not exist.
    #[error("Resource not found: {physical_id}")]
    NotFound {
        /// The physical id that was looked up.
        physical_id: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The change-set could not be ordered.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },

    /// The plan was computed against an older revision of the state.
    #[error("Plan is stale: computed against state serial {planned}, current serial is {current}")]
    StalePlan {
        /// Serial recorded in the plan.
        planned: u64,
        /// Serial currently stored.
        current: u64,
    },

    /// The plan targets a different environment than the engine.
    #[error("Plan targets environment '{planned}' but engine is bound to '{current}'")]
    EnvironmentMismatch {
        /// Environment recorded in the plan.
        planned: String,
        /// Environment of the engine.
        current: String,
    },
}

/// A single resource operation that failed during apply.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{operation} of '{logical_id}' failed after {attempts} attempt(s): {cause}")]
pub struct ExecutionFailure {
    /// Logical id of the failing resource.
    pub logical_id: String,
    /// Operation that was attempted.
    pub operation: String,
    /// Underlying cause.
    pub cause: String,
    /// Number of provider attempts made.
    pub attempts: u32,
}

/// Result type alias for groundwork operations.
pub type Result<T> = std::result::Result<T, GroundworkError>;

impl GroundworkError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if the error was raised before any mutation could happen.
    #[must_use]
    pub const fn is_planning_error(&self) -> bool {
        matches!(self, Self::Specification(_) | Self::Plan(_) | Self::State(_))
    }
}

impl SpecificationError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error without a retry hint.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a throttling error carrying a retry-after hint.
    #[must_use]
    pub fn throttled(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(physical_id: impl Into<String>) -> Self {
        Self::NotFound {
            physical_id: physical_id.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the provider's retry hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_classification() {
        assert!(ProviderError::transient("timeout").is_retryable());
        assert!(!ProviderError::permanent("denied").is_retryable());
        assert!(!ProviderError::not_found("i-123").is_retryable());

        let throttled = ProviderError::throttled("slow down", Duration::from_secs(3));
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_execution_failure_display() {
        let failure = ExecutionFailure {
            logical_id: String::from("web"),
            operation: String::from("create"),
            cause: String::from("quota"),
            attempts: 3,
        };
        assert_eq!(
            failure.to_string(),
            "create of 'web' failed after 3 attempt(s): quota"
        );
    }

    #[test]
    fn test_planning_errors_are_flagged() {
        let err = GroundworkError::from(SpecificationError::CyclicDependency {
            cycle: String::from("a -> b -> a"),
        });
        assert!(err.is_planning_error());
        assert!(!err.is_retryable());
    }
}
