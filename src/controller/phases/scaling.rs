//! Scale-out and scale-in of an installed group.

use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::info;

use crate::crd::{ClusterState, MysqlCluster};
use crate::events::{actions, reasons};
use crate::topology::NodeAddress;
use crate::Error;

use super::{fail_membership, record_membership, Step};

/// Requeue after members left, so the pod group shrinks promptly
const SHRINK_REQUEUE: Duration = Duration::from_secs(1);

/// Join `ordinals` to the running group, lowest first
///
/// The group is never re-created here; members already ONLINE are skipped.
pub async fn handle_scaling_out(step: &Step<'_>, ordinals: &[u32]) -> Result<Action, Error> {
    let nodes: Vec<NodeAddress> = ordinals.iter().map(|o| step.topo.node(*o)).collect();
    info!(?ordinals, "joining members");
    let marked = mark_scaling(
        step,
        ClusterState::ScaleOut,
        format!("joining ordinals {ordinals:?}"),
    )
    .await?;
    let step = &step.with_cluster(&marked);

    match step
        .ctx
        .orchestrator
        .join_only(step.topo, step.credentials, step.observed, &nodes)
        .await
    {
        Ok(views) => {
            let next = record_membership(step, views, ClusterState::ScaleOut).await?;
            step.publish(
                EventType::Normal,
                reasons::MEMBERS_JOINED,
                actions::SCALE,
                format!("joined ordinals {ordinals:?}"),
            )
            .await;
            Ok(next)
        }
        Err(e) => fail_membership(step, &e).await,
    }
}

/// Remove `ordinals` from the group, highest first
///
/// Only the group membership changes here. The recorded topology drops the
/// departed ordinals, which lets the next pass shrink the pod group.
pub async fn handle_scaling_in(step: &Step<'_>, ordinals: &[u32]) -> Result<Action, Error> {
    let nodes: Vec<NodeAddress> = ordinals.iter().map(|o| step.topo.node(*o)).collect();
    info!(?ordinals, "removing members");
    let marked = mark_scaling(
        step,
        ClusterState::ScaleIn,
        format!("removing ordinals {ordinals:?}"),
    )
    .await?;
    let step = &step.with_cluster(&marked);

    match step
        .ctx
        .orchestrator
        .remove(step.topo, step.credentials, step.observed, &nodes)
        .await
    {
        Ok(staying) => {
            let desired = step.desired();
            step.update(|s| {
                *s = std::mem::take(s).observe_topology(staying.clone(), desired);
                s.state = ClusterState::ScaleIn;
                s.failed_attempts = 0;
                s.message = Some(format!("removed ordinals {ordinals:?}"));
                true
            })
            .await?;
            step.publish(
                EventType::Normal,
                reasons::MEMBERS_REMOVED,
                actions::SCALE,
                format!("removed ordinals {ordinals:?}"),
            )
            .await;
            Ok(Action::requeue(SHRINK_REQUEUE))
        }
        Err(e) => fail_membership(step, &e).await,
    }
}

async fn mark_scaling(
    step: &Step<'_>,
    state: ClusterState,
    message: String,
) -> Result<MysqlCluster, Error> {
    step.update(|s| {
        s.state = state;
        s.message = Some(message.clone());
        true
    })
    .await
}
