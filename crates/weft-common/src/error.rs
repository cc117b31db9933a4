//! Error types for the Weft control plane
//!
//! Every failure a controller can observe is a distinct variant so callers
//! match on the variant instead of comparing against sentinel values. Each
//! variant carries the object identity it concerns to aid debugging in
//! production.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Weft operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error (never a 404; absence is reported as a value)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A controller reference was requested across namespaces
    ///
    /// The platform refuses cross-namespace controller references, so this is
    /// always a logic error in the caller, never a transient condition.
    #[error("owner {owner} is in namespace {owner_namespace:?}, target {target} is in {target_namespace:?}")]
    OwnerInOtherNamespace {
        /// Owner as `kind/name`
        owner: String,
        /// Owner namespace
        owner_namespace: Option<String>,
        /// Target object name
        target: String,
        /// Target namespace
        target_namespace: Option<String>,
    },

    /// The dependency-of annotation on an object could not be decoded
    #[error("malformed dependency-of annotation on {target}: {message}")]
    MalformedDependencyOf {
        /// Object carrying the annotation
        target: String,
        /// Decoder message
        message: String,
    },

    /// A service account never received its token secret within the waiter timeout
    #[error("service account {namespace}/{name} has no default token secret")]
    ServiceAccountMissingDefaultTokenSecret {
        /// Service account namespace
        namespace: String,
        /// Service account name
        name: String,
    },

    /// A token secret exists but has the wrong type or no token data
    #[error("secret {namespace}/{name} is not a usable service account token: {message}")]
    InvalidTokenSecret {
        /// Secret namespace
        namespace: String,
        /// Secret name
        name: String,
        /// What is wrong with it
        message: String,
    },

    /// A secret referenced by name in a spec does not exist
    #[error("required secret {namespace}/{name} not found")]
    RequiredSecretMissing {
        /// Secret namespace
        namespace: String,
        /// Secret name
        name: String,
    },

    /// Signing workload identity claims failed
    #[error("signing error: {message}")]
    Signing {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Validation error for CRD specs
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
    },

    /// An error that the reconciler should retry quickly
    #[error("transient: {source}")]
    Transient {
        /// The wrapped error
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "waiter")
        context: String,
    },
}

impl Error {
    /// Create a validation error without object context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named object
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a signing error
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing {
            message: msg.into(),
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

    /// Mark an error as transient
    ///
    /// Already-transient errors are returned unchanged.
    pub fn transient(err: Error) -> Self {
        match err {
            Error::Transient { .. } => err,
            other => Self::Transient {
                source: Box::new(other),
            },
        }
    }

    /// Whether this error was explicitly marked transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Check if this error is retryable
    ///
    /// Retryable errors are requeued with standard backoff. Non-retryable
    /// errors need a spec change (or a code fix) before another attempt can
    /// succeed, so they are requeued on a much longer interval.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                // Conflicts and throttling resolve on their own
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::OwnerInOtherNamespace { .. } => false,
            Error::MalformedDependencyOf { .. } => false,
            Error::ServiceAccountMissingDefaultTokenSecret { .. } => false,
            Error::InvalidTokenSecret { .. } => true,
            Error::RequiredSecretMissing { .. } => true,
            Error::Signing { .. } => true,
            Error::Serialization { .. } => false,
            Error::Validation { .. } => false,
            Error::Transient { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Returns true if the kube error is an API "not found" response
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Returns true if the kube error is an API "already exists" response
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}
