//! Error types for the stackweave engine.
//!
//! This module provides the error hierarchy for every phase of a run:
//! configuration, resource modelling, cross-stack resolution, state
//! management, provider calls, planning and apply.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the stackweave engine.
#[derive(Debug, Error)]
pub enum StackweaveError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource model and graph errors.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Cross-stack reference resolution errors.
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors surfaced outside of a node (e.g. during planning).
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A `$ref`, `$stack` or `$concat` value could not be interpreted.
    #[error("Invalid value reference '{reference}': {reason}")]
    InvalidReference {
        /// The offending reference text.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Resource model and dependency graph errors.
///
/// All of these are structural and abort a run before any provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// A resource id was declared twice in the same stack.
    #[error("Duplicate resource id '{id}' in stack '{stack}'")]
    DuplicateId {
        /// Stack name.
        stack: String,
        /// The duplicated id.
        id: String,
    },

    /// A resource id contains a reserved character.
    #[error("Resource id '{id}' in stack '{stack}' must not contain '#'")]
    ReservedId {
        /// Stack name.
        stack: String,
        /// The offending id.
        id: String,
    },

    /// A dependency or value reference names an undeclared resource.
    #[error("Resource '{referenced_by}' in stack '{stack}' references unknown resource '{resource}'")]
    UnknownResource {
        /// Stack name.
        stack: String,
        /// The missing resource id.
        resource: String,
        /// The resource holding the reference.
        referenced_by: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency detected: {}", format_cycle(.cycle))]
    CyclicDependency {
        /// Node sequence of the cycle, lowest id first.
        cycle: Vec<String>,
    },
}

/// Cross-stack reference resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The referenced stack is neither declared nor present in state.
    #[error("Unknown stack: {stack}")]
    UnknownStack {
        /// Stack name.
        stack: String,
    },

    /// The referenced stack published its outputs without this key.
    #[error("Stack '{stack}' does not export output '{key}'")]
    UnknownOutput {
        /// Stack name.
        stack: String,
        /// Output key.
        key: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
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
    #[error("Stack '{stack}' is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Stack name.
        stack: String,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Storage backend I/O error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Optimistic concurrency check on a record failed.
    #[error(
        "Version conflict on {stack}/{resource}: expected {}, found {}",
        format_version(*.expected),
        format_version(*.found)
    )]
    VersionConflict {
        /// Stack name.
        stack: String,
        /// Resource id.
        resource: String,
        /// Version the writer expected.
        expected: Option<u64>,
        /// Version currently stored.
        found: Option<u64>,
    },
}

/// Error returned by a provider operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    /// Human-readable description from the provider.
    pub message: String,
    /// Whether the operation may succeed if retried.
    pub transient: bool,
    /// Whether the operation may have taken effect anyway (timeout, or a
    /// server error on a mutating call).
    pub indeterminate: bool,
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A resource or record names a provider that is not registered.
    #[error("Resource '{resource}' uses unknown provider '{provider}'")]
    UnknownProvider {
        /// Resource id.
        resource: String,
        /// Provider id.
        provider: String,
    },

    /// The plan is internally inconsistent.
    #[error("Invalid plan: {message}")]
    InvalidPlan {
        /// Description of the inconsistency.
        message: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Some nodes did not converge.
    #[error(
        "Apply of stack '{stack}' partially failed: {failed} failed, {blocked} blocked, \
         {cancelled} cancelled, {needs_reconciliation} need reconciliation"
    )]
    PartialFailure {
        /// Stack name.
        stack: String,
        /// Number of failed nodes.
        failed: usize,
        /// Number of blocked nodes.
        blocked: usize,
        /// Number of cancelled nodes.
        cancelled: usize,
        /// Number of nodes in an indeterminate provider state.
        needs_reconciliation: usize,
    },

    /// The run was cancelled before the stack started.
    #[error("Run cancelled before stack '{stack}' was applied")]
    Cancelled {
        /// Stack name.
        stack: String,
    },
}

/// Result type alias for stackweave operations.
pub type Result<T> = std::result::Result<T, StackweaveError>;

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {first}", cycle.join(" -> ")),
        None => String::from("<empty>"),
    }
}

fn format_version(version: Option<u64>) -> String {
    version.map_or_else(|| String::from("none"), |v| v.to_string())
}

impl StackweaveError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.transient,
            Self::State(StateError::LockFailed { .. } | StateError::VersionConflict { .. }) => true,
            _ => false,
        }
    }

    /// Returns the process exit code for this error.
    ///
    /// `2` for plan-time errors, `3` for cycles, `4` for partial apply
    /// failures, `5` for cancellation and `1` for everything else.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Model(ModelError::CyclicDependency { .. }) => 3,
            Self::Config(_) | Self::Model(_) | Self::Resolve(_) | Self::Plan(_) => 2,
            Self::Apply(ApplyError::PartialFailure {
                failed: 0,
                blocked: 0,
                needs_reconciliation: 0,
                ..
            })
            | Self::Apply(ApplyError::Cancelled { .. }) => 5,
            Self::Apply(ApplyError::PartialFailure { .. }) => 4,
            _ => 1,
        }
    }
}

impl ConfigError {
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
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
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

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error (rate limiting, unavailable backend).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            indeterminate: false,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            indeterminate: false,
        }
    }

    /// Creates a timeout error. Timeouts are transient.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::indeterminate(message)
    }

    /// Creates a transient error whose effect on the backend is unknown.
    #[must_use]
    pub fn indeterminate(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            indeterminate: true,
        }
    }
}
