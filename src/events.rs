//! Kubernetes Event recording for the MySQL cluster controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that membership changes show up in `kubectl describe mysqlcluster`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "GroupBootstrapped")
    /// * `action` - What action was taken (e.g. "Bootstrap")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Replication group created and every node joined
    pub const GROUP_BOOTSTRAPPED: &str = "GroupBootstrapped";
    /// New ordinals joined the group
    pub const MEMBERS_JOINED: &str = "MembersJoined";
    /// Departing ordinals left the group
    pub const MEMBERS_REMOVED: &str = "MembersRemoved";
    /// Group rebooted after every member had stopped
    pub const GROUP_REBOOTED: &str = "GroupRebooted";
    /// A membership step failed
    pub const MEMBERSHIP_FAILED: &str = "MembershipFailed";
    /// All nodes are ready group members
    pub const CLUSTER_READY: &str = "ClusterReady";
    /// Data tier scaled to zero
    pub const CLUSTER_CLOSED: &str = "ClusterClosed";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Deletion started
    pub const DELETION_STARTED: &str = "DeletionStarted";
    /// Graceful group shutdown did not complete; deletion continued
    pub const DISSOLVE_DEGRADED: &str = "DissolveDegraded";
    /// Deletion is waiting for an in-flight bootstrap
    pub const DELETION_BLOCKED: &str = "DeletionBlocked";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Bootstrapping the replication group
    pub const BOOTSTRAP: &str = "Bootstrap";
    /// Joining or removing members
    pub const SCALE: &str = "Scale";
    /// Rebooting a stopped group
    pub const REBOOT: &str = "Reboot";
    /// Tearing the cluster down
    pub const DELETE: &str = "Delete";
}
