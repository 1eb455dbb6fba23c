//! Shared types for the MysqlCluster CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default MySQL server image
pub const DEFAULT_MYSQL_IMAGE: &str = "mysql:8.0.32";

/// Default MySQL Router image
pub const DEFAULT_ROUTER_IMAGE: &str = "mysql/mysql-router:8.0.32";

/// Default root password when none is supplied
pub const DEFAULT_ROOT_PASSWORD: &str = "lattice";

/// Default persistent volume size per node
pub const DEFAULT_VOLUME_SIZE: &str = "10Gi";

/// Maximum number of router instances
pub const MAX_ROUTER_REPLICAS: u32 = 3;

// =============================================================================
// Spec types
// =============================================================================

/// MySQL server configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MysqlSpec {
    /// Server image reference
    #[serde(default = "default_mysql_image")]
    pub image: String,

    /// Password for the root account used by the admin tool
    #[serde(default = "default_root_password")]
    pub root_password: String,

    /// Optional application account created on first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password for the application account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Extra `[mysqld]` settings rendered into my.cnf
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conf: BTreeMap<String, String>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl Default for MysqlSpec {
    fn default() -> Self {
        Self {
            image: default_mysql_image(),
            root_password: default_root_password(),
            user: None,
            password: None,
            conf: BTreeMap::new(),
            resources: None,
        }
    }
}

/// MySQL Router configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    /// Router image reference
    #[serde(default = "default_router_image")]
    pub image: String,

    /// Number of router instances (0 disables the router)
    #[serde(default = "default_router_replicas")]
    pub replicas: u32,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl Default for RouterSpec {
    fn default() -> Self {
        Self {
            image: default_router_image(),
            replicas: default_router_replicas(),
            resources: None,
        }
    }
}

/// Pod-level scheduling and metadata policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodPolicy {
    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Extra labels for every pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations for every pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Priority class for database pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

/// Persistent storage for data directories
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Use a PersistentVolumeClaim per node (emptyDir otherwise)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Access modes for the claims
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,

    /// Storage class name (cluster default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Requested volume size (e.g., "10Gi")
    #[serde(default = "default_volume_size")]
    pub size: String,
}

impl Default for PersistenceSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            access_modes: default_access_modes(),
            storage_class: None,
            size: default_volume_size(),
        }
    }
}

fn default_mysql_image() -> String {
    DEFAULT_MYSQL_IMAGE.to_string()
}

fn default_router_image() -> String {
    DEFAULT_ROUTER_IMAGE.to_string()
}

fn default_root_password() -> String {
    DEFAULT_ROOT_PASSWORD.to_string()
}

fn default_router_replicas() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

fn default_volume_size() -> String {
    DEFAULT_VOLUME_SIZE.to_string()
}

// =============================================================================
// Status types
// =============================================================================

/// Externally visible cluster state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterState {
    /// Resources are being created and the group has not been bootstrapped
    #[default]
    Initializing,
    /// Pods are rolling out on an already bootstrapped group
    Updating,
    /// All nodes are ready and members of the group
    Ready,
    /// New ordinals are joining the group
    ScaleOut,
    /// Departing ordinals are leaving the group
    ScaleIn,
    /// The data tier is scaled to zero
    Closed,
    /// The last membership step failed
    Error,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Updating => write!(f, "Updating"),
            Self::Ready => write!(f, "Ready"),
            Self::ScaleOut => write!(f, "ScaleOut"),
            Self::ScaleIn => write!(f, "ScaleIn"),
            Self::Closed => write!(f, "Closed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Durable record of whether the replication group has been bootstrapped
///
/// Transitions into `Installing` are claimed with an optimistic-concurrency
/// write so that only one reconcile can ever run a bootstrap.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MembershipMarker {
    /// No bootstrap has been attempted
    #[default]
    NotInstalled,
    /// A bootstrap is in flight
    Installing,
    /// The group exists and was last seen healthy
    Installed,
    /// The last membership step failed; the next pass resumes it
    InstallFailed,
}

impl MembershipMarker {
    /// Whether a new bootstrap may be claimed from this marker
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::NotInstalled | Self::InstallFailed)
    }
}

impl std::fmt::Display for MembershipMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInstalled => write!(f, "NotInstalled"),
            Self::Installing => write!(f, "Installing"),
            Self::Installed => write!(f, "Installed"),
            Self::InstallFailed => write!(f, "InstallFailed"),
        }
    }
}

/// Role of a node within the replication group
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeRole {
    /// Elected primary accepting writes
    Leader,
    /// Replica following the leader
    Secondary,
    /// Role could not be determined
    #[default]
    Unknown,
}

/// Observed view of one node, recomputed from every topology query
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    /// Pod ordinal
    pub ordinal: u32,
    /// host:port the group knows the node by
    pub address: String,
    /// Leader, Secondary or Unknown
    pub role: NodeRole,
    /// Member is ONLINE and applying the group's transactions
    pub replicating: bool,
    /// Member rejects writes
    pub read_only: bool,
    /// Member's applier queue is behind
    pub lagged: bool,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same type, status, reason and message, ignoring the timestamp
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}
