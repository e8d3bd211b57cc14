//! Error types for orgrbac
//!
//! Errors are structured with fields to aid debugging in production.
//! Store errors carry the kind and name of the object involved so that a
//! failing namespace can be reported precisely in template status.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for orgrbac operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error not covered by a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespaced name (`namespace/name`) or name of the object
        name: String,
    },

    /// A create raced with another writer
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of the object
        kind: String,
        /// Namespaced name (`namespace/name`) or name of the object
        name: String,
    },

    /// An update was based on a stale resource version
    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict {
        /// Kind of the object
        kind: String,
        /// Namespaced name (`namespace/name`) or name of the object
        name: String,
    },

    /// Malformed selector, spec or configuration
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with the invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.scope.organizationSelector")
        field: Option<String>,
    },

    /// An existing object is controlled by a different owner
    #[error("{kind} {namespace}/{name} is controlled by {owner}")]
    Ownership {
        /// Kind of the object
        kind: String,
        /// Namespace of the object
        namespace: String,
        /// Name of the object
        name: String,
        /// Description of the foreign owner (`Kind/name`)
        owner: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Some targets of a multi-namespace pass failed
    #[error("{context}: failed for {}", .failed.join(", "))]
    Partial {
        /// What was being reconciled (e.g., "rolebindingtemplate admins")
        context: String,
        /// Targets that failed, typically namespace names
        failed: Vec<String>,
    },

    /// The pass was cancelled before reaching the next store call
    #[error("reconciliation pass cancelled")]
    Cancelled,

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, ownership and serialization errors need a change to the
    /// inputs before another attempt can succeed. Conflicts, partial failures
    /// and transient API errors are retried by the controller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout, 5xx)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::Ownership { .. } => false,
            Error::Serialization { .. } => false,
            Error::Partial { .. } => true,
            Error::Cancelled => true,
            Error::Internal { .. } => true,
        }
    }

    /// True for [`Error::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for [`Error::AlreadyExists`]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// True for [`Error::Conflict`]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Partial { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
