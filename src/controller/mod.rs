//! Controller for MysqlCluster resources
//!
//! Follows the Kubernetes controller pattern: every reconcile observes the
//! cluster and its pods, decides one transition, acts, and persists the result.

mod cluster;
mod phases;
mod teardown;

pub use cluster::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use phases::READY_CONDITION;
