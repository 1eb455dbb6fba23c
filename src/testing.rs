//! In-memory stand-ins used by unit tests
//!
//! [`FakeGroup`] simulates a replication group behind the admin tool and
//! answers probes from the same state, so membership and controller tests can
//! make nodes unreachable or offline and watch what the operator does.
//! [`FakeStore`] and [`FakeResources`] play the API server for the controller.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::EventType;
use serde_json::json;

use crate::admin::{AdminOperation, AdminTool, Credentials, Outcome};
use crate::controller::KubeClient;
use crate::crd::{MysqlCluster, MysqlClusterSpec, MysqlClusterStatus, NodeRole, NodeView};
use crate::events::EventPublisher;
use crate::lifecycle::RolloutStatus;
use crate::probe::{NodeProber, ProbeResult};
use crate::resources::{ConvergeOutcome, DesiredResourceSet, ResourceSynchronizer};
use crate::topology::{ClusterTopology, NodeAddress};
use crate::Error;

/// Cluster `orders` in namespace `db` with default settings
pub fn sample_cluster(replicas: u32) -> MysqlCluster {
    let mut cluster = MysqlCluster::new(
        "orders",
        serde_json::from_value::<MysqlClusterSpec>(json!({ "replicas": replicas })).unwrap(),
    );
    cluster.metadata.namespace = Some("db".to_string());
    cluster.metadata.uid = Some("0d6f6c1e-uid".to_string());
    cluster
}

#[derive(Default)]
struct GroupState {
    exists: bool,
    /// ordinal -> ONLINE
    members: BTreeMap<u32, bool>,
    leader: Option<u32>,
    unreachable: BTreeSet<u32>,
    calls: Vec<(u32, AdminOperation)>,
    injected: HashMap<&'static str, Outcome>,
}

/// Simulated replication group driven through [`AdminTool`]
pub struct FakeGroup {
    topology: ClusterTopology,
    state: Mutex<GroupState>,
}

impl FakeGroup {
    /// No group exists yet
    pub fn new(topology: ClusterTopology) -> Self {
        Self {
            topology,
            state: Mutex::new(GroupState::default()),
        }
    }

    /// A healthy group with the given members; the lowest one leads
    pub fn with_members(topology: ClusterTopology, ordinals: &[u32]) -> Self {
        let group = Self::new(topology);
        {
            let mut state = group.lock();
            state.exists = !ordinals.is_empty();
            state.members = ordinals.iter().map(|o| (*o, true)).collect();
            state.leader = ordinals.iter().min().copied();
        }
        group
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.state.lock().unwrap()
    }

    /// Make a node refuse connections (or accept them again)
    pub fn set_unreachable(&self, ordinal: u32, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(ordinal);
        } else {
            state.unreachable.remove(&ordinal);
        }
    }

    /// Keep a member listed but stop it replicating
    pub fn set_offline(&self, ordinal: u32) {
        let mut state = self.lock();
        if let Some(online) = state.members.get_mut(&ordinal) {
            *online = false;
        }
        if state.leader == Some(ordinal) {
            state.leader = state
                .members
                .iter()
                .find(|(_, online)| **online)
                .map(|(o, _)| *o);
        }
    }

    /// Return `outcome` the next time an operation called `name` runs
    pub fn fail_next(&self, name: &'static str, outcome: Outcome) {
        self.lock().injected.insert(name, outcome);
    }

    /// Every call so far as (target ordinal, operation)
    pub fn calls(&self) -> Vec<(u32, AdminOperation)> {
        self.lock().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of calls to the named operation
    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|(_, op)| op.name() == name).count()
    }

    /// Target ordinals of calls to the named operation, in call order
    pub fn targets_of(&self, name: &str) -> Vec<u32> {
        self.calls()
            .iter()
            .filter(|(_, op)| op.name() == name)
            .map(|(target, _)| *target)
            .collect()
    }

    /// Ordinals named by AddInstance/RejoinInstance, in call order
    pub fn joined_in_order(&self) -> Vec<u32> {
        self.calls()
            .iter()
            .filter_map(|(_, op)| match op {
                AdminOperation::AddInstance { instance }
                | AdminOperation::RejoinInstance { instance } => self.topology.ordinal_of(instance),
                _ => None,
            })
            .collect()
    }

    /// Ordinals named by RemoveInstance, in call order
    pub fn removed_in_order(&self) -> Vec<u32> {
        self.calls()
            .iter()
            .filter_map(|(_, op)| match op {
                AdminOperation::RemoveInstance { instance, .. } => {
                    self.topology.ordinal_of(instance)
                }
                _ => None,
            })
            .collect()
    }

    /// Current member ordinals
    pub fn members(&self) -> Vec<u32> {
        self.lock().members.keys().copied().collect()
    }

    /// Current group as the status report would describe it
    pub fn views(&self) -> Vec<NodeView> {
        let state = self.lock();
        state
            .members
            .iter()
            .map(|(ordinal, online)| NodeView {
                ordinal: *ordinal,
                address: self.topology.node(*ordinal).endpoint(),
                role: if state.leader == Some(*ordinal) {
                    NodeRole::Leader
                } else if *online {
                    NodeRole::Secondary
                } else {
                    NodeRole::Unknown
                },
                replicating: *online,
                read_only: state.leader != Some(*ordinal),
                lagged: false,
            })
            .collect()
    }

    fn report(&self, state: &GroupState) -> String {
        let topology: serde_json::Map<String, serde_json::Value> = state
            .members
            .iter()
            .map(|(ordinal, online)| {
                let endpoint = self.topology.node(*ordinal).endpoint();
                let leader = state.leader == Some(*ordinal);
                let member = json!({
                    "address": endpoint,
                    "memberRole": if leader { "PRIMARY" } else { "SECONDARY" },
                    "mode": if leader { "R/W" } else if *online { "R/O" } else { "n/a" },
                    "status": if *online { "ONLINE" } else { "(MISSING)" },
                    "replicationLag": if *online { json!("applier_queue_applied") } else { json!(null) },
                });
                (endpoint, member)
            })
            .collect();
        json!({
            "clusterName": self.topology.name(),
            "defaultReplicaSet": {
                "name": "default",
                "primary": state.leader.map(|o| self.topology.node(o).endpoint()),
                "topology": topology,
            }
        })
        .to_string()
    }

    fn apply(&self, state: &mut GroupState, target: u32, operation: &AdminOperation) -> Outcome {
        let in_group = state.exists && state.members.contains_key(&target);
        let ordinal_of = |instance: &str| self.topology.ordinal_of(instance).unwrap_or(u32::MAX);

        match operation {
            AdminOperation::Ping => Outcome::Success("ok".to_string()),
            AdminOperation::Status => {
                if in_group {
                    Outcome::Success(self.report(state))
                } else {
                    Outcome::Absent("standalone instance".to_string())
                }
            }
            AdminOperation::CreateGroup { .. } => {
                if in_group {
                    return Outcome::AlreadyDone("already in an InnoDB cluster".to_string());
                }
                state.exists = true;
                state.members = BTreeMap::from([(target, true)]);
                state.leader = Some(target);
                Outcome::Success(String::new())
            }
            AdminOperation::AddInstance { instance } => {
                let ordinal = ordinal_of(instance);
                if !in_group {
                    return Outcome::Absent("standalone instance".to_string());
                }
                if state.unreachable.contains(&ordinal) {
                    return Outcome::Transient(format!("Can't connect to MySQL server on '{instance}'"));
                }
                if state.members.contains_key(&ordinal) {
                    return Outcome::AlreadyDone("is already a member".to_string());
                }
                state.members.insert(ordinal, true);
                Outcome::Success(String::new())
            }
            AdminOperation::RejoinInstance { instance } => {
                let ordinal = ordinal_of(instance);
                if state.unreachable.contains(&ordinal) {
                    return Outcome::Transient(format!("Can't connect to MySQL server on '{instance}'"));
                }
                state.members.insert(ordinal, true);
                if state.leader.is_none() {
                    state.leader = Some(ordinal);
                }
                Outcome::Success(String::new())
            }
            AdminOperation::RemoveInstance { instance, force } => {
                let ordinal = ordinal_of(instance);
                if !state.members.contains_key(&ordinal) {
                    return Outcome::AlreadyDone("does not belong to the cluster".to_string());
                }
                if state.unreachable.contains(&ordinal) && !force {
                    return Outcome::Transient(format!("Can't connect to MySQL server on '{instance}'"));
                }
                state.members.remove(&ordinal);
                if state.leader == Some(ordinal) {
                    state.leader = state.members.keys().next().copied();
                }
                Outcome::Success(String::new())
            }
            AdminOperation::Rescan => {
                if in_group {
                    Outcome::Success(String::new())
                } else {
                    Outcome::Absent("standalone instance".to_string())
                }
            }
            AdminOperation::RebootGroup { .. } => {
                if !in_group {
                    return Outcome::Absent("standalone instance".to_string());
                }
                if state.members.values().any(|online| *online) {
                    return Outcome::AlreadyDone("The cluster is ONLINE".to_string());
                }
                state.members.insert(target, true);
                state.leader = Some(target);
                Outcome::Success(String::new())
            }
            AdminOperation::Dissolve => {
                if !state.exists {
                    return Outcome::Absent("standalone instance".to_string());
                }
                state.exists = false;
                state.members.clear();
                state.leader = None;
                Outcome::Success(String::new())
            }
        }
    }
}

#[async_trait]
impl AdminTool for FakeGroup {
    async fn invoke(
        &self,
        target: &NodeAddress,
        _credentials: &Credentials,
        operation: &AdminOperation,
    ) -> Outcome {
        let target = target.ordinal;
        let mut state = self.lock();
        state.calls.push((target, operation.clone()));

        if let Some(outcome) = state.injected.remove(operation.name()) {
            return outcome;
        }
        if state.unreachable.contains(&target) {
            return Outcome::Transient("Can't connect to MySQL server".to_string());
        }
        self.apply(&mut state, target, operation)
    }
}

#[async_trait]
impl NodeProber for FakeGroup {
    async fn probe(
        &self,
        node: &NodeAddress,
        _credentials: &Credentials,
        _budget: Duration,
    ) -> ProbeResult {
        if self.lock().unreachable.contains(&node.ordinal) {
            ProbeResult::Unready
        } else {
            ProbeResult::Ready
        }
    }
}

type Interleaved = Box<dyn FnOnce(&mut MysqlCluster) + Send>;

#[derive(Default)]
struct StoreState {
    cluster: Option<MysqlCluster>,
    version: u64,
    writes: Vec<MysqlClusterStatus>,
    interleave: Option<Interleaved>,
}

impl StoreState {
    fn bump(&mut self) {
        self.version += 1;
        if let Some(cluster) = self.cluster.as_mut() {
            cluster.metadata.resource_version = Some(self.version.to_string());
        }
    }
}

/// A single MysqlCluster held the way the API server would hold it
///
/// Status writes carrying a stale resourceVersion fail with a conflict.
/// Removing the last finalizer from a deleting cluster deletes it.
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    /// Store holding `cluster`
    pub fn new(cluster: MysqlCluster) -> Self {
        let mut state = StoreState {
            cluster: Some(cluster),
            ..Default::default()
        };
        state.bump();
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    /// Current stored object
    pub fn cluster(&self) -> MysqlCluster {
        self.lock().cluster.clone().expect("cluster was deleted")
    }

    /// Current stored status
    pub fn status(&self) -> MysqlClusterStatus {
        self.cluster().status_or_default()
    }

    /// Every status accepted so far
    pub fn status_writes(&self) -> Vec<MysqlClusterStatus> {
        self.lock().writes.clone()
    }

    /// Change the stored object as another writer would
    pub fn update(&self, f: impl FnOnce(&mut MysqlCluster)) {
        let mut state = self.lock();
        if let Some(cluster) = state.cluster.as_mut() {
            f(cluster);
        }
        state.bump();
    }

    /// Run `f` as another writer just before the next status write lands
    pub fn interleave_next_write(&self, f: impl FnOnce(&mut MysqlCluster) + Send + 'static) {
        self.lock().interleave = Some(Box::new(f));
    }

    /// Set a deletion timestamp
    pub fn mark_deleted(&self) {
        self.update(|c| c.metadata.deletion_timestamp = Some(Time(Utc::now())));
    }

    /// Whether the object has been removed
    pub fn is_gone(&self) -> bool {
        self.lock().cluster.is_none()
    }
}

#[async_trait]
impl KubeClient for FakeStore {
    async fn get_cluster(
        &self,
        _name: &str,
        _namespace: &str,
    ) -> Result<Option<MysqlCluster>, Error> {
        Ok(self.lock().cluster.clone())
    }

    async fn replace_status(
        &self,
        cluster: &MysqlCluster,
        status: &MysqlClusterStatus,
    ) -> Result<MysqlCluster, Error> {
        let mut state = self.lock();
        if let Some(interleaved) = state.interleave.take() {
            if let Some(stored) = state.cluster.as_mut() {
                interleaved(stored);
            }
            state.bump();
        }

        let stored_version = state
            .cluster
            .as_ref()
            .and_then(|c| c.metadata.resource_version.clone());
        if stored_version.is_none() {
            return Err(Error::conflict("orders", "cluster no longer exists"));
        }
        if cluster.metadata.resource_version != stored_version {
            return Err(Error::conflict("orders", "resourceVersion changed"));
        }

        state.writes.push(status.clone());
        if let Some(stored) = state.cluster.as_mut() {
            stored.status = Some(status.clone());
        }
        state.bump();
        Ok(state.cluster.clone().expect("checked above"))
    }

    async fn add_finalizer(
        &self,
        _name: &str,
        _namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.update(|c| {
            let finalizers = c.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        });
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        _name: &str,
        _namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.update(|c| {
            if let Some(finalizers) = c.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != finalizer);
            }
        });
        let mut state = self.lock();
        let collectible = state.cluster.as_ref().is_some_and(|c| {
            c.metadata.deletion_timestamp.is_some()
                && c.metadata.finalizers.as_ref().map_or(true, Vec::is_empty)
        });
        if collectible {
            state.cluster = None;
        }
        Ok(())
    }
}

#[derive(Default)]
struct ResourceState {
    replicas: Option<u32>,
    held_ready: Option<u32>,
    releases: usize,
}

/// Child resources that converge instantly
///
/// Only the pod group size is tracked: a converge that changes it reports a
/// write, and the rollout completes at once unless held.
#[derive(Default)]
pub struct FakeResources {
    state: Mutex<ResourceState>,
}

impl FakeResources {
    /// Nothing applied yet
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap()
    }

    /// Pretend a pod group of `replicas` was applied on an earlier pass
    pub fn assume_applied(&self, replicas: u32) {
        self.lock().replicas = Some(replicas);
    }

    /// Cap ready pods at `ready` until released
    pub fn hold_rollout(&self, ready: u32) {
        self.lock().held_ready = Some(ready);
    }

    /// Pod group size from the last converge
    pub fn last_replicas(&self) -> Option<u32> {
        self.lock().replicas
    }

    /// Number of release calls
    pub fn releases(&self) -> usize {
        self.lock().releases
    }
}

#[async_trait]
impl ResourceSynchronizer for FakeResources {
    async fn converge(
        &self,
        _cluster: &MysqlCluster,
        desired: &DesiredResourceSet,
    ) -> Result<ConvergeOutcome, Error> {
        let replicas = desired
            .statefulset
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0)
            .max(0) as u32;
        let mut state = self.lock();
        let changed = state.replicas != Some(replicas);
        state.replicas = Some(replicas);
        Ok(ConvergeOutcome { changed })
    }

    async fn rollout_status(
        &self,
        _name: &str,
        _namespace: &str,
    ) -> Result<Option<RolloutStatus>, Error> {
        let state = self.lock();
        Ok(state.replicas.map(|replicas| RolloutStatus {
            desired_replicas: replicas,
            ready_replicas: state.held_ready.map_or(replicas, |held| held.min(replicas)),
            current_revision: Some("orders-1".to_string()),
            update_revision: Some("orders-1".to_string()),
        }))
    }

    async fn release(&self, _cluster: &MysqlCluster) -> Result<(), Error> {
        let mut state = self.lock();
        state.releases += 1;
        state.replicas = None;
        Ok(())
    }
}

/// Event publisher that remembers reasons
#[derive(Default)]
pub struct RecordingEvents {
    reasons: Mutex<Vec<String>>,
}

impl RecordingEvents {
    /// Whether an event with `reason` was published
    pub fn contains(&self, reason: &str) -> bool {
        self.reasons.lock().unwrap().iter().any(|r| r == reason)
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}
