//! MysqlCluster Custom Resource Definition
//!
//! A MysqlCluster declares N MySQL servers that form one InnoDB group-replication
//! cluster, plus an optional MySQL Router tier in front of it. The status is
//! owned by the controller; the `membership` marker is the only durable record
//! of whether the replication group has been bootstrapped.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ClusterState, Condition, MembershipMarker, MysqlSpec, NodeRole, NodeView, PersistenceSpec,
    PodPolicy, RouterSpec, MAX_ROUTER_REPLICAS,
};

/// Annotation that authorises teardown while a bootstrap is in flight
pub const FORCE_DELETE_ANNOTATION: &str = "lattice.dev/force-delete";

/// Smallest replica count that forms a fault-tolerant group
pub const MIN_GROUP_SIZE: u32 = 3;

/// Group replication supports at most nine members
pub const MAX_GROUP_SIZE: u32 = 9;

/// Specification for a MysqlCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "MysqlCluster",
    plural = "mysqlclusters",
    shortname = "mysql",
    status = "MysqlClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyNodes"}"#,
    printcolumn = r#"{"name":"Leader","type":"string","jsonPath":".status.leader"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MysqlClusterSpec {
    /// Number of MySQL servers (0 stops the data tier)
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// MySQL server configuration
    #[serde(default)]
    pub mysql: MysqlSpec,

    /// MySQL Router configuration
    #[serde(default)]
    pub router: RouterSpec,

    /// Pod scheduling and metadata policy
    #[serde(default)]
    pub pod_policy: PodPolicy,

    /// Persistent storage for data directories
    #[serde(default)]
    pub persistence: PersistenceSpec,
}

fn default_replicas() -> u32 {
    MIN_GROUP_SIZE
}

impl MysqlClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self, cluster: &str) -> Result<(), crate::Error> {
        if self.replicas != 0 && !(MIN_GROUP_SIZE..=MAX_GROUP_SIZE).contains(&self.replicas) {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.replicas",
                format!(
                    "replicas must be 0 or between {} and {}, got {}",
                    MIN_GROUP_SIZE, MAX_GROUP_SIZE, self.replicas
                ),
            ));
        }

        if self.router.replicas > MAX_ROUTER_REPLICAS {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.router.replicas",
                format!(
                    "router replicas must be at most {}, got {}",
                    MAX_ROUTER_REPLICAS, self.router.replicas
                ),
            ));
        }

        if self.mysql.image.trim().is_empty() {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.mysql.image",
                "image must not be empty",
            ));
        }

        if self.router.replicas > 0 && self.router.image.trim().is_empty() {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.router.image",
                "image must not be empty when the router is enabled",
            ));
        }

        if self.mysql.root_password.is_empty() {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.mysql.rootPassword",
                "root password must not be empty",
            ));
        }

        if self.mysql.user.is_some() != self.mysql.password.is_some() {
            return Err(crate::Error::validation_for_field(
                cluster,
                "spec.mysql.user",
                "user and password must be set together",
            ));
        }

        Ok(())
    }
}

impl MysqlCluster {
    /// Current status, or the default for a cluster never reconciled
    pub fn status_or_default(&self) -> MysqlClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Current membership marker
    pub fn membership(&self) -> MembershipMarker {
        self.status
            .as_ref()
            .map(|s| s.membership)
            .unwrap_or_default()
    }

    /// Whether the user asked to delete even with a bootstrap in flight
    pub fn force_delete_requested(&self) -> bool {
        self.annotations()
            .get(FORCE_DELETE_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// Status for a MysqlCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MysqlClusterStatus {
    /// Externally visible cluster state
    #[serde(default)]
    pub state: ClusterState,

    /// Number of group members that are replicating (never above spec.replicas)
    #[serde(default)]
    pub ready_nodes: u32,

    /// Members as reported by the last topology query, ordered by ordinal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology: Vec<NodeView>,

    /// Address of the current leader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,

    /// Whether the replication group has been bootstrapped
    #[serde(default)]
    pub membership: MembershipMarker,

    /// When the marker last moved to Installing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_claimed_at: Option<DateTime<Utc>>,

    /// When the group first finished bootstrapping
    ///
    /// A group that existed once is rebooted after an outage, never recreated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrapped_at: Option<DateTime<Utc>>,

    /// spec.replicas at the last topology read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_replicas: Option<u32>,

    /// Consecutive failed membership steps
    #[serde(default)]
    pub failed_attempts: u32,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MysqlClusterStatus {
    /// Create a new status with the given state
    pub fn with_state(state: ClusterState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    /// Set the state and return self for chaining
    pub fn state(mut self, state: ClusterState) -> Self {
        self.state = state;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    ///
    /// An unchanged condition keeps its original transition time.
    pub fn condition(mut self, condition: Condition) -> Self {
        if let Some(existing) = self.conditions.iter().find(|c| c.type_ == condition.type_) {
            if existing.same_as(&condition) {
                return self;
            }
        }
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Record a topology read, capping `ready_nodes` at `desired`
    pub fn observe_topology(mut self, topology: Vec<NodeView>, desired: u32) -> Self {
        let replicating = topology.iter().filter(|n| n.replicating).count() as u32;
        self.ready_nodes = replicating.min(desired);
        self.leader = topology
            .iter()
            .find(|n| n.role == NodeRole::Leader)
            .map(|n| n.address.clone());
        self.topology = topology;
        self.observed_replicas = Some(desired);
        self
    }

    /// Clear the recorded topology (e.g., when the data tier is stopped)
    pub fn clear_topology(mut self) -> Self {
        self.topology.clear();
        self.leader = None;
        self.ready_nodes = 0;
        self
    }

    /// Highest ordinal still listed in the recorded topology
    pub fn highest_member_ordinal(&self) -> Option<u32> {
        self.topology.iter().map(|n| n.ordinal).max()
    }
}
