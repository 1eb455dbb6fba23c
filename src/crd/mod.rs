//! Custom Resource Definitions for the MySQL operator
//!
//! This module contains the MysqlCluster CRD and the types shared by its spec and status.

mod cluster;
mod types;

pub use cluster::{
    MysqlCluster, MysqlClusterSpec, MysqlClusterStatus, FORCE_DELETE_ANNOTATION, MAX_GROUP_SIZE,
    MIN_GROUP_SIZE,
};
pub use types::{
    ClusterState, Condition, ConditionStatus, MembershipMarker, MysqlSpec, NodeRole, NodeView,
    PersistenceSpec, PodPolicy, RouterSpec, DEFAULT_MYSQL_IMAGE, DEFAULT_ROOT_PASSWORD,
    DEFAULT_ROUTER_IMAGE, DEFAULT_VOLUME_SIZE, MAX_ROUTER_REPLICAS,
};
