//! Error types for fleet-mirror
//!
//! Errors carry the cluster, mirror or object key they relate to so that a
//! single log line is enough to locate the failing sync. Each variant maps onto
//! one failure class of the sync pipeline:
//!
//! - `Connection`: a cluster client could not be built (fatal to that cluster)
//! - `Kube`: an API call failed; NotFound/AlreadyExists/Conflict are recognised
//!   by the helpers in [`crate::kube_utils`], everything else is transient
//! - `Conflict`: optimistic-concurrency clash on update, a soft failure
//! - `MalformedDocument`: an object could not be encoded, transformed or decoded
//! - `Config`: a cluster or mirror definition is invalid

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fleet-mirror operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A cluster client could not be established
    #[error("connection error for cluster {cluster}: {message}")]
    Connection {
        /// Name of the cluster being connected
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Update lost an optimistic-concurrency race on a follower
    #[error("conflict updating {key} on {cluster}")]
    Conflict {
        /// Namespace-qualified object key
        key: String,
        /// Follower cluster that rejected the update
        cluster: String,
    },

    /// Document could not be encoded, transformed or decoded
    #[error("malformed document {key}: {message}")]
    MalformedDocument {
        /// Namespace-qualified object key
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid cluster or mirror configuration
    #[error("configuration error for {subject}: {message}")]
    Config {
        /// Mirror or cluster name the problem belongs to
        subject: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "registry", "informer", "worker")
        context: String,
    },
}

impl Error {
    /// Create a connection error for a cluster
    pub fn connection_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error for an object on a follower
    pub fn conflict(key: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            cluster: cluster.into(),
        }
    }

    /// Create a malformed document error for an object key
    pub fn malformed(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedDocument {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error without a specific subject
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            subject: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for a mirror or cluster
    pub fn config_for(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            subject: subject.into(),
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

    /// Soft failures are expected races: logged quietly, counted as an
    /// outcome rather than an error, and left to the normal requeue.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Metrics label describing why the operation failed
    ///
    /// Uses the API server's `reason` for API errors (e.g. "Forbidden",
    /// "ServiceUnavailable"), a fixed label for the other variants.
    pub fn reason(&self) -> String {
        match self {
            Error::Kube { source } => crate::kube_utils::reason_for_error(source),
            Error::Connection { .. } => "ConnectionError".to_string(),
            Error::Conflict { .. } => "Conflict".to_string(),
            Error::MalformedDocument { .. } => "MalformedDocument".to_string(),
            Error::Config { .. } => "InvalidConfig".to_string(),
            Error::Internal { .. } => "Internal".to_string(),
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Connection { cluster, .. } => Some(cluster),
            Error::Conflict { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}
