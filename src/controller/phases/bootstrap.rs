//! Bootstrap and outage recovery.
//!
//! Creating the replication group is the one step that must never run twice,
//! so it is guarded by the persisted membership marker: a reconcile first
//! claims the marker with a compare-and-swap status write, and only the winner
//! talks to the group.

use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crate::crd::{ClusterState, MembershipMarker, MysqlCluster, NodeView};
use crate::events::{actions, reasons};
use crate::lifecycle::{can_claim, pod_group_size};
use crate::membership::{anchor_ordinal, GroupCreation};
use crate::Error;

use super::{fail_membership, record_membership, Step};
use crate::controller::cluster::{modify_status, Context};

/// Requeue interval while another reconcile holds the bootstrap claim
pub(crate) const CLAIM_HELD_REQUEUE: Duration = Duration::from_secs(15);

/// Claim the bootstrap for this reconcile
///
/// Returns the cluster as stored with the claim, or `None` if another
/// reconcile already holds a live claim or the group is installed.
pub async fn claim_bootstrap(
    cluster: &MysqlCluster,
    ctx: &Context,
) -> Result<Option<MysqlCluster>, Error> {
    let now = Utc::now();
    let mut won = false;

    let updated = modify_status(cluster, ctx, |s| {
        won = can_claim(s.membership, s.membership_claimed_at, now);
        if won {
            s.membership = MembershipMarker::Installing;
            s.membership_claimed_at = Some(now);
        }
        won
    })
    .await?;

    Ok(won.then_some(updated))
}

/// Claim the marker, then create the group or resume a partial bootstrap
///
/// A group that finished bootstrapping once is never created again: with no
/// ONLINE member it is rebooted, otherwise the remaining joins are resumed.
pub async fn handle_bootstrapping(step: &Step<'_>) -> Result<Action, Error> {
    let Some(claimed) = claim_bootstrap(step.cluster, step.ctx).await? else {
        info!("bootstrap claimed elsewhere, waiting");
        return Ok(Action::requeue(CLAIM_HELD_REQUEUE));
    };
    let step = step.with_cluster(&claimed);
    let desired = step.desired();
    let nodes = step.topo.nodes(0..desired);

    let bootstrapped_before = claimed.status_or_default().bootstrapped_at.is_some();
    let reboot = bootstrapped_before && !group_online(&step).await?;
    let result = if reboot {
        info!("group existed before and no member is ONLINE, rebooting");
        step.ctx
            .orchestrator
            .reboot(step.topo, step.credentials, &nodes)
            .await
    } else {
        let creation = if bootstrapped_before {
            GroupCreation::Forbidden
        } else {
            GroupCreation::Allowed
        };
        step.ctx
            .orchestrator
            .bootstrap(step.topo, step.credentials, &nodes, creation)
            .await
    };

    match result {
        Ok(views) => {
            let (reason, action, note) = if reboot {
                (reasons::GROUP_REBOOTED, actions::REBOOT, "replication group rebooted")
            } else {
                (reasons::GROUP_BOOTSTRAPPED, actions::BOOTSTRAP, "replication group bootstrapped")
            };
            let members = views.len();
            let next = record_membership(&step, views, ClusterState::Initializing).await?;
            step.publish(
                EventType::Normal,
                reason,
                action,
                format!("{note} with {members} members"),
            )
            .await;
            Ok(next)
        }
        Err(e) => fail_membership(&step, &e).await,
    }
}

/// Reboot an installed group whose members have all stopped
pub async fn handle_restarting(step: &Step<'_>) -> Result<Action, Error> {
    let nodes = step.topo.nodes(0..step.desired());
    info!(nodes = nodes.len(), "no member is ONLINE, rebooting group");

    match step
        .ctx
        .orchestrator
        .reboot(step.topo, step.credentials, &nodes)
        .await
    {
        Ok(views) => {
            let members = views.len();
            let next = record_membership(step, views, ClusterState::Updating).await?;
            step.publish(
                EventType::Normal,
                reasons::GROUP_REBOOTED,
                actions::REBOOT,
                format!("replication group rebooted with {members} members"),
            )
            .await;
            Ok(next)
        }
        Err(e) => fail_membership(step, &e).await,
    }
}

/// Whether any pod currently reports an ONLINE group member
async fn group_online(step: &Step<'_>) -> Result<bool, Error> {
    let status = step.cluster.status_or_default();
    let pods = pod_group_size(step.desired(), &status.topology);
    let views: Option<Vec<NodeView>> = step
        .ctx
        .orchestrator
        .observe_topology(step.topo, step.credentials, &step.topo.nodes(0..pods))
        .await?;
    let online = views.as_deref().and_then(anchor_ordinal).is_some();
    debug!(online, "checked for a running group");
    Ok(online)
}
