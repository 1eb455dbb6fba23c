//! Passes that wait on the pod group or on another reconcile.

use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::debug;

use crate::crd::{ClusterState, MembershipMarker};
use crate::lifecycle::RolloutStatus;
use crate::Error;

use super::bootstrap::CLAIM_HELD_REQUEUE;
use super::Step;

/// Requeue interval after child resources were written
const PROVISIONING_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue interval while pods come up
const ROLLOUT_REQUEUE: Duration = Duration::from_secs(10);

/// Child resources were just written
pub async fn handle_provisioning(step: &Step<'_>) -> Result<Action, Error> {
    set_waiting(step, "applying child resources".to_string()).await?;
    Ok(Action::requeue(PROVISIONING_REQUEUE))
}

/// Pods are still starting or rolling to a new revision
pub async fn handle_awaiting_rollout(
    step: &Step<'_>,
    rollout: Option<&RolloutStatus>,
) -> Result<Action, Error> {
    let message = match rollout {
        Some(r) => format!("{} of {} pods ready", r.ready_replicas, r.desired_replicas),
        None => "waiting for the pod group".to_string(),
    };
    debug!(%message, "rollout incomplete");
    set_waiting(step, message).await?;
    Ok(Action::requeue(ROLLOUT_REQUEUE))
}

/// Another reconcile is bootstrapping the group
pub async fn handle_awaiting_bootstrap(_step: &Step<'_>) -> Result<Action, Error> {
    debug!("bootstrap claim held elsewhere");
    Ok(Action::requeue(CLAIM_HELD_REQUEUE))
}

/// Record a waiting pass without hiding an earlier failure
///
/// `Error` stays until a membership step succeeds.
async fn set_waiting(step: &Step<'_>, message: String) -> Result<(), Error> {
    let installed = step.cluster.membership() == MembershipMarker::Installed;
    step.update(|s| {
        if s.state == ClusterState::Error {
            return false;
        }
        s.state = if installed {
            ClusterState::Updating
        } else {
            ClusterState::Initializing
        };
        s.message = Some(message.clone());
        true
    })
    .await?;
    Ok(())
}
