//! Error types for the MySQL cluster operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the cluster or node it concerns and, where the
//! failure came from outside the process, whether a retry can help.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.replicas")
        field: Option<String>,
    },

    /// Optimistic-concurrency conflict writing a resource
    #[error("conflict writing {cluster}: {message}")]
    Conflict {
        /// Name of the cluster whose write lost the race
        cluster: String,
        /// Description of the conflicting write
        message: String,
    },

    /// A membership step (create, join, rescan, remove) did not succeed
    #[error("membership {step} failed for {cluster}: {message}")]
    Membership {
        /// Name of the cluster being changed
        cluster: String,
        /// The step that failed (e.g., "create-group", "add-instance")
        step: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A node did not become reachable within its probe budget
    #[error("node {address} unreachable: {message}")]
    Unreachable {
        /// Address of the node that was probed
        address: String,
        /// Description of the last failed attempt
        message: String,
    },

    /// The admin tool could not be executed at all
    #[error("admin tool error [{operation}]: {message}")]
    AdminTool {
        /// Operation being executed
        operation: String,
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

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "teardown")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error for a stale write
    pub fn conflict(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable membership error
    pub fn membership(
        cluster: impl Into<String>,
        step: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Membership {
            cluster: cluster.into(),
            step: step.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable membership error (e.g., rejected credentials)
    pub fn membership_permanent(
        cluster: impl Into<String>,
        step: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Membership {
            cluster: cluster.into(),
            step: step.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an unreachable-node error
    pub fn unreachable(address: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unreachable {
            address: address.into(),
            message: msg.into(),
        }
    }

    /// Create an admin tool execution error
    pub fn admin_tool(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AdminTool {
            operation: operation.into(),
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
    /// Validation and serialization errors need a spec fix. Conflicts,
    /// unreachable nodes and tool timeouts clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is a lost optimistic-concurrency race; other 4xx need a fix
                match source {
                    kube::Error::Api(ae) if ae.code == 409 => true,
                    kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::Membership { retryable, .. } => *retryable,
            Error::Unreachable { .. } => true,
            Error::AdminTool { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Conflict { cluster, .. } => Some(cluster),
            Error::Membership { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Error Propagation in Membership Operations
    // ==========================================================================

    /// Story: Spec validation catches unsupported cluster sizes before any pod exists
    #[test]
    fn story_validation_prevents_invalid_cluster_sizes() {
        let err = Error::validation_for_field("orders", "spec.replicas", "must be 0 or at least 3");
        assert!(err.to_string().contains("validation error for orders"));
        assert_eq!(err.cluster(), Some("orders"));
        assert!(!err.is_retryable());

        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.replicas")),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: A lost status-write race is retried, never surfaced as fatal
    #[test]
    fn story_conflicts_are_retryable() {
        let err = Error::conflict("orders", "resourceVersion changed");
        assert!(err.is_conflict());
        assert!(err.is_retryable());

        let err = Error::from(api_error(409));
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    /// Story: Client errors from the API server need a fix, server errors do not
    #[test]
    fn story_kube_errors_classified_by_status_code() {
        assert!(!Error::from(api_error(422)).is_retryable());
        assert!(!Error::from(api_error(404)).is_conflict());
        assert!(Error::from(api_error(503)).is_retryable());
    }

    /// Story: Membership failures carry whether the admin tool can succeed later
    #[test]
    fn story_membership_errors_track_retryability() {
        let err = Error::membership("orders", "add-instance", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("add-instance"));

        let err = Error::membership_permanent("orders", "create-group", "access denied");
        assert!(!err.is_retryable());
        assert_eq!(err.cluster(), Some("orders"));
    }

    /// Story: Unreachable nodes and tool timeouts resolve themselves
    #[test]
    fn story_transient_node_failures_are_retryable() {
        let err = Error::unreachable("orders-1.orders.db.svc.cluster.local:3306", "timed out");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("orders-1"));

        assert!(Error::admin_tool("status", "spawn failed").is_retryable());
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_errors_carry_context() {
        let err = Error::internal_with_context("teardown", "missing namespace");
        assert!(err.to_string().contains("[teardown]"));
        assert!(Error::internal("x").to_string().contains(UNKNOWN_CONTEXT));
    }
}
