//! Steady states: a healthy group, or a data tier scaled to zero.

use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crate::crd::ClusterState;
use crate::events::{actions, reasons};
use crate::Error;

use super::{record_membership, Step};

/// Requeue interval for a closed cluster
const CLOSED_REQUEUE: Duration = Duration::from_secs(60);

/// Every desired member is replicating and nothing extra is in the group
pub async fn handle_ready(step: &Step<'_>) -> Result<Action, Error> {
    let was_ready = step.cluster.status_or_default().state == ClusterState::Ready;
    let next = record_membership(step, step.observed.to_vec(), ClusterState::Updating).await?;

    if !was_ready {
        info!(members = step.observed.len(), "cluster is ready");
        step.publish(
            EventType::Normal,
            reasons::CLUSTER_READY,
            actions::RECONCILE,
            format!("{} members replicating", step.observed.len()),
        )
        .await;
    } else {
        debug!("cluster remains ready");
    }
    Ok(next)
}

/// spec.replicas is zero and the pods are gone
///
/// The marker is left alone so scaling back up reboots the group.
pub async fn handle_closed(step: &Step<'_>) -> Result<Action, Error> {
    let was_closed = step.cluster.status_or_default().state == ClusterState::Closed;
    step.update(|s| {
        *s = std::mem::take(s)
            .clear_topology()
            .state(ClusterState::Closed)
            .message("data tier scaled to zero");
        s.observed_replicas = Some(0);
        true
    })
    .await?;

    if !was_closed {
        info!("cluster closed");
        step.publish(
            EventType::Normal,
            reasons::CLUSTER_CLOSED,
            actions::RECONCILE,
            "data tier scaled to zero".to_string(),
        )
        .await;
    }
    Ok(Action::requeue(CLOSED_REQUEUE))
}
