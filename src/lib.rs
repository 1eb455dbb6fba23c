//! Lattice MySQL - CRD-driven Kubernetes operator for MySQL group-replication clusters
//!
//! A `MysqlCluster` resource describes how many MySQL servers should run as one
//! InnoDB group-replication group. The operator renders the pod group and its
//! supporting objects, waits for the pods, and then drives group membership
//! through the `mysqlsh` admin tool: bootstrap, join on scale-out, removal
//! before scale-in, reboot after a complete outage and dissolve on deletion.
//!
//! # Modules
//!
//! - [`crd`] - The MysqlCluster custom resource and its status
//! - [`controller`] - Reconciliation loop and transition handlers
//! - [`lifecycle`] - Pure decision of the next transition
//! - [`membership`] - Group membership orchestration
//! - [`admin`] - Admin tool invocation and report parsing
//! - [`probe`] - Node health probing
//! - [`topology`] - Stable node addresses
//! - [`resources`] - Child resource rendering and convergence
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Operator settings
//! - [`telemetry`] - Logging setup
//! - [`retry`] - Backoff helpers
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod admin;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod membership;
pub mod probe;
pub mod resources;
pub mod retry;
pub mod telemetry;
pub mod topology;

#[cfg(test)]
pub mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default DNS suffix of the Kubernetes cluster
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Finalizer that holds a MysqlCluster until its group is shut down
pub const FINALIZER: &str = "lattice.dev/mysql-cluster";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "lattice-mysql";
