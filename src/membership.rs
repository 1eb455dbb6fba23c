//! Replication-group membership orchestration
//!
//! The orchestrator sequences admin-tool calls to create a group, join nodes
//! to it, remove nodes from it and shut it down. Every operation is safe to
//! re-run after a partial failure: before acting on a node it checks whether
//! the desired end state already holds, so a resumed pass starts from the
//! first ordinal that is not yet a confirmed member.
//!
//! Ordering rules:
//! - nodes join in strictly increasing ordinal order
//! - nodes leave in strictly decreasing ordinal order
//! - every per-node step is preceded by a bounded health probe

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::admin::{parse_status, AdminOperation, AdminTool, Credentials, Outcome};
use crate::crd::{NodeRole, NodeView};
use crate::probe::{NodeProber, ProbeResult, DEFAULT_PROBE_BUDGET};
use crate::topology::{ClusterTopology, NodeAddress};
use crate::Error;

/// Group name the admin tool registers for a cluster
///
/// Group names may only hold letters, digits, `_` and `-`, and may not start
/// with a digit.
pub fn group_name(cluster: &str) -> String {
    let mut name: String = cluster
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "g_");
    }
    name
}

/// Lowest ordinal that is an ONLINE member
pub fn anchor_ordinal(views: &[NodeView]) -> Option<u32> {
    views
        .iter()
        .filter(|v| v.replicating)
        .map(|v| v.ordinal)
        .min()
}

/// Ordinal of the ONLINE leader, if any
pub fn leader_ordinal(views: &[NodeView]) -> Option<u32> {
    views
        .iter()
        .find(|v| v.replicating && v.role == NodeRole::Leader)
        .map(|v| v.ordinal)
}

/// Whether a bootstrap may create a group that no node reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupCreation {
    /// The group has never been created; create it at ordinal 0 if absent
    Allowed,
    /// The group was created before; only resume joins
    Forbidden,
}

/// Sequences bootstrap, join, removal and shutdown against the admin tool
pub struct MembershipOrchestrator {
    tool: Arc<dyn AdminTool>,
    prober: Arc<dyn NodeProber>,
    probe_budget: Duration,
}

impl MembershipOrchestrator {
    /// Create an orchestrator that acts through `tool` and checks nodes with `prober`
    pub fn new(tool: Arc<dyn AdminTool>, prober: Arc<dyn NodeProber>) -> Self {
        Self {
            tool,
            prober,
            probe_budget: DEFAULT_PROBE_BUDGET,
        }
    }

    /// Override the per-node probe budget
    pub fn with_probe_budget(mut self, budget: Duration) -> Self {
        self.probe_budget = budget;
        self
    }

    /// Create the group at ordinal 0 (unless it exists) and join every other node
    ///
    /// Every node is asked for a group before anything is created; if any of
    /// them reports one, the lowest ONLINE member anchors the joins. With
    /// [`GroupCreation::Forbidden`] a missing group is an error instead of
    /// being created. Returns the topology reported after a final rescan.
    pub async fn bootstrap(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        nodes: &[NodeAddress],
        creation: GroupCreation,
    ) -> Result<Vec<NodeView>, Error> {
        let nodes = ascending(nodes);
        let Some(seed) = nodes.first() else {
            return Err(Error::validation_for_field(
                topo.name(),
                "spec.replicas",
                "bootstrap needs at least one node",
            ));
        };

        // No fallback anchor: the seed must answer before anything else happens
        self.ensure_ready(seed, credentials).await?;

        let existing = match self.query(topo, credentials, seed).await? {
            Some(views) => Some(views),
            None => self.observe_topology(topo, credentials, &nodes[1..]).await?,
        };

        let (anchor, known) = match existing {
            Some(views) => {
                let anchor = anchor_ordinal(&views).ok_or_else(|| {
                    Error::membership(topo.name(), "anchor", "group exists but no member is ONLINE")
                })?;
                info!(
                    cluster = topo.name(),
                    anchor,
                    members = views.len(),
                    "replication group already exists, skipping creation"
                );
                (topo.node(anchor), membership_map(&views))
            }
            None if creation == GroupCreation::Forbidden => {
                return Err(Error::membership(
                    topo.name(),
                    "create-group",
                    "group was bootstrapped before but no node reports it",
                ));
            }
            None => {
                info!(cluster = topo.name(), seed = %seed, "creating replication group");
                self.run_step(
                    topo,
                    credentials,
                    seed,
                    AdminOperation::CreateGroup {
                        name: group_name(topo.name()),
                    },
                )
                .await?;
                (seed.clone(), BTreeMap::from([(seed.ordinal, true)]))
            }
        };

        self.join_nodes(topo, credentials, &anchor, &known, &nodes)
            .await?;

        info!(cluster = topo.name(), anchor = %anchor, "rescanning group metadata");
        self.run_step(topo, credentials, &anchor, AdminOperation::Rescan)
            .await?;

        self.query(topo, credentials, &anchor)
            .await?
            .ok_or_else(|| Error::membership(topo.name(), "status", "group vanished after bootstrap"))
    }

    /// Join `new_nodes` to an existing group without re-creating it
    pub async fn join_only(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        current: &[NodeView],
        new_nodes: &[NodeAddress],
    ) -> Result<Vec<NodeView>, Error> {
        if new_nodes.is_empty() {
            return Ok(current.to_vec());
        }
        let anchor = anchor_ordinal(current).ok_or_else(|| {
            Error::membership(topo.name(), "anchor", "no ONLINE member to anchor the join")
        })?;
        let anchor = topo.node(anchor);

        self.join_nodes(
            topo,
            credentials,
            &anchor,
            &membership_map(current),
            &ascending(new_nodes),
        )
        .await?;

        self.query(topo, credentials, &anchor)
            .await?
            .ok_or_else(|| Error::membership(topo.name(), "status", "group vanished after join"))
    }

    /// Remove `departing` nodes, highest ordinal first
    ///
    /// A departing node that does not answer its probe is removed with
    /// `force`. Nodes the group reports as not belonging count as removed; an
    /// anchor that is itself outside the group fails the step. Returns the
    /// topology with the departed ordinals dropped.
    pub async fn remove(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        current: &[NodeView],
        departing: &[NodeAddress],
    ) -> Result<Vec<NodeView>, Error> {
        let leaving: BTreeSet<u32> = departing.iter().map(|n| n.ordinal).collect();
        let staying: Vec<NodeView> = current
            .iter()
            .filter(|v| !leaving.contains(&v.ordinal))
            .cloned()
            .collect();
        if leaving.is_empty() {
            return Ok(staying);
        }

        let anchor = leader_ordinal(&staying)
            .or_else(|| anchor_ordinal(&staying))
            .ok_or_else(|| {
                Error::membership(topo.name(), "anchor", "no remaining ONLINE member to anchor removal")
            })?;
        let anchor = topo.node(anchor);

        let mut order = departing.to_vec();
        order.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        order.dedup_by_key(|n| n.ordinal);

        for node in &order {
            let force = self
                .prober
                .probe(node, credentials, self.probe_budget)
                .await
                == ProbeResult::Unready;
            if force {
                warn!(cluster = topo.name(), node = %node, "departing node unreachable, forcing removal");
            }
            info!(cluster = topo.name(), ordinal = node.ordinal, anchor = %anchor, "removing member");
            // An anchor outside the group removes nothing, so only the
            // member-level "does not belong" answer counts as already removed
            let outcome = self
                .run_step(
                    topo,
                    credentials,
                    &anchor,
                    AdminOperation::RemoveInstance {
                        instance: node.endpoint(),
                        force,
                    },
                )
                .await?;
            if !outcome.is_done() {
                debug!(cluster = topo.name(), ordinal = node.ordinal, "member already absent");
            }
        }

        Ok(staying)
    }

    /// Restart a group whose members were all stopped, then rejoin the rest
    pub async fn reboot(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        nodes: &[NodeAddress],
    ) -> Result<Vec<NodeView>, Error> {
        let nodes = ascending(nodes);
        let Some(seed) = nodes.first() else {
            return Err(Error::validation_for_field(
                topo.name(),
                "spec.replicas",
                "reboot needs at least one node",
            ));
        };

        self.ensure_ready(seed, credentials).await?;
        info!(cluster = topo.name(), seed = %seed, "rebooting replication group from complete outage");
        self.run_step(
            topo,
            credentials,
            seed,
            AdminOperation::RebootGroup {
                name: group_name(topo.name()),
            },
        )
        .await?;

        let views = self
            .query(topo, credentials, seed)
            .await?
            .ok_or_else(|| Error::membership(topo.name(), "status", "no group after reboot"))?;
        let anchor = anchor_ordinal(&views).ok_or_else(|| {
            Error::membership(topo.name(), "anchor", "no ONLINE member after reboot")
        })?;
        let anchor = topo.node(anchor);

        self.join_nodes(topo, credentials, &anchor, &membership_map(&views), &nodes)
            .await?;

        self.query(topo, credentials, &anchor)
            .await?
            .ok_or_else(|| Error::membership(topo.name(), "status", "group vanished after reboot"))
    }

    /// Read the group topology from the lowest-ordinal node that reports one
    ///
    /// Nodes that are unreachable or not in a group are skipped. `None` means
    /// no candidate reported a group.
    pub async fn observe_topology(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        candidates: &[NodeAddress],
    ) -> Result<Option<Vec<NodeView>>, Error> {
        for node in ascending(candidates) {
            match self
                .tool
                .invoke(&node, credentials, &AdminOperation::Status)
                .await
            {
                Outcome::Success(output) => return parse_status(&output, topo).map(Some),
                other => {
                    debug!(cluster = topo.name(), node = %node, outcome = ?other, "no topology from node");
                }
            }
        }
        Ok(None)
    }

    /// Ordered shutdown of the group, issued at the leader
    ///
    /// A group that no longer exists counts as dissolved.
    pub async fn dissolve(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        current: &[NodeView],
    ) -> Result<(), Error> {
        let Some(target) = leader_ordinal(current).or_else(|| anchor_ordinal(current)) else {
            info!(cluster = topo.name(), "no ONLINE member, nothing to dissolve");
            return Ok(());
        };
        let target = topo.node(target);
        info!(cluster = topo.name(), target = %target, "dissolving replication group");
        self.run(topo, credentials, &target, AdminOperation::Dissolve)
            .await
            .map(|_| ())
    }

    /// Join every node in `nodes` (ascending) that is not already an ONLINE member
    async fn join_nodes(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        anchor: &NodeAddress,
        known: &BTreeMap<u32, bool>,
        nodes: &[NodeAddress],
    ) -> Result<(), Error> {
        for node in nodes {
            let operation = match known.get(&node.ordinal) {
                Some(true) => {
                    debug!(cluster = topo.name(), ordinal = node.ordinal, "already a member");
                    continue;
                }
                Some(false) => AdminOperation::RejoinInstance {
                    instance: node.endpoint(),
                },
                None => AdminOperation::AddInstance {
                    instance: node.endpoint(),
                },
            };

            self.ensure_ready(node, credentials).await?;
            info!(
                cluster = topo.name(),
                ordinal = node.ordinal,
                anchor = %anchor,
                operation = %operation,
                "joining node"
            );
            self.run_step(topo, credentials, anchor, operation).await?;
        }
        Ok(())
    }

    /// Fail with `Unreachable` unless `node` answers within the probe budget
    async fn ensure_ready(&self, node: &NodeAddress, credentials: &Credentials) -> Result<(), Error> {
        match self
            .prober
            .probe(node, credentials, self.probe_budget)
            .await
        {
            ProbeResult::Ready => Ok(()),
            ProbeResult::Unready => Err(Error::unreachable(
                node.endpoint(),
                format!("not ready within {:?}", self.probe_budget),
            )),
        }
    }

    /// Status query; `None` when the target is not in a group
    async fn query(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        target: &NodeAddress,
    ) -> Result<Option<Vec<NodeView>>, Error> {
        match self
            .run(topo, credentials, target, AdminOperation::Status)
            .await?
        {
            Outcome::Success(output) => parse_status(&output, topo).map(Some),
            _ => Ok(None),
        }
    }

    /// Run an operation that must take effect (Success or AlreadyDone)
    async fn run_step(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        target: &NodeAddress,
        operation: AdminOperation,
    ) -> Result<Outcome, Error> {
        let step = operation.name();
        let outcome = self.run(topo, credentials, target, operation).await?;
        if let Outcome::Absent(detail) = &outcome {
            return Err(Error::membership(
                topo.name(),
                step,
                format!("{} is not in a replication group: {}", target, detail),
            ));
        }
        Ok(outcome)
    }

    /// Invoke the tool, turning Transient and Fatal outcomes into errors
    async fn run(
        &self,
        topo: &ClusterTopology,
        credentials: &Credentials,
        target: &NodeAddress,
        operation: AdminOperation,
    ) -> Result<Outcome, Error> {
        let outcome = self.tool.invoke(target, credentials, &operation).await;
        match outcome {
            Outcome::Transient(detail) => Err(Error::membership(
                topo.name(),
                operation.name(),
                format!("{} on {}: {}", operation, target, detail),
            )),
            Outcome::Fatal(detail) => Err(Error::membership_permanent(
                topo.name(),
                operation.name(),
                format!("{} on {}: {}", operation, target, detail),
            )),
            Outcome::AlreadyDone(detail) => {
                debug!(cluster = topo.name(), target = %target, operation = %operation, %detail, "already done");
                Ok(Outcome::AlreadyDone(detail))
            }
            done => Ok(done),
        }
    }
}

fn ascending(nodes: &[NodeAddress]) -> Vec<NodeAddress> {
    let mut sorted = nodes.to_vec();
    sorted.sort_by_key(|n| n.ordinal);
    sorted.dedup_by_key(|n| n.ordinal);
    sorted
}

fn membership_map(views: &[NodeView]) -> BTreeMap<u32, bool> {
    views.iter().map(|v| (v.ordinal, v.replicating)).collect()
}
