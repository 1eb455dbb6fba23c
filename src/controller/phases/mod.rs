//! Transition handlers for the MysqlCluster controller.
//!
//! Each [`Transition`](crate::lifecycle::Transition) the lifecycle picks is
//! carried out by one handler here. Handlers run at most one membership step,
//! persist what it produced, and tell the controller when to come back.

mod bootstrap;
mod ready;
mod scaling;
mod waiting;

pub use bootstrap::{handle_bootstrapping, handle_restarting};
pub use ready::{handle_closed, handle_ready};
pub use scaling::{handle_scaling_in, handle_scaling_out};
pub use waiting::{handle_awaiting_bootstrap, handle_awaiting_rollout, handle_provisioning};

#[cfg(test)]
pub(crate) use bootstrap::claim_bootstrap;

use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use crate::admin::Credentials;
use crate::crd::{
    ClusterState, Condition, ConditionStatus, MembershipMarker, MysqlCluster, MysqlClusterStatus,
    NodeView,
};
use crate::events::{actions, reasons};
use crate::retry::RetryConfig;
use crate::topology::ClusterTopology;
use crate::Error;

use super::cluster::{modify_status, Context};

/// Condition type summarizing whether the cluster serves traffic
pub const READY_CONDITION: &str = "Ready";

/// Requeue interval once the cluster has settled
const SETTLED_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue interval while members are still catching up
const CATCH_UP_REQUEUE: Duration = Duration::from_secs(5);

/// Everything a transition handler works with
#[derive(Clone, Copy)]
pub struct Step<'a> {
    /// The cluster as last read from the store
    pub cluster: &'a MysqlCluster,
    /// Controller context
    pub ctx: &'a Context,
    /// Stable node addresses for the cluster
    pub topo: &'a ClusterTopology,
    /// Admin credentials
    pub credentials: &'a Credentials,
    /// Live topology read this pass (empty when none was taken)
    pub observed: &'a [NodeView],
}

impl<'a> Step<'a> {
    /// The same step acting on a newer copy of the cluster
    pub fn with_cluster(self, cluster: &'a MysqlCluster) -> Self {
        Self { cluster, ..self }
    }

    /// spec.replicas
    pub fn desired(&self) -> u32 {
        self.cluster.spec.replicas
    }

    /// Read-modify-write this cluster's status
    pub async fn update<F>(&self, edit: F) -> Result<MysqlCluster, Error>
    where
        F: FnMut(&mut MysqlClusterStatus) -> bool + Send,
    {
        modify_status(self.cluster, self.ctx, edit).await
    }

    /// Publish an event on this cluster
    pub async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        publish(self.cluster, self.ctx, type_, reason, action, note).await;
    }
}

pub(crate) async fn publish(
    cluster: &MysqlCluster,
    ctx: &Context,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&cluster.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Backoff between attempts at a failing membership step
fn membership_backoff() -> RetryConfig {
    RetryConfig {
        max_attempts: 0,
        initial_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(300),
        backoff_multiplier: 2.0,
    }
}

/// Replace the Ready condition on `status`
fn set_ready_condition(
    status: &mut MysqlClusterStatus,
    ready: bool,
    reason: &str,
    message: &str,
) {
    let condition = Condition::new(
        READY_CONDITION,
        if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason,
        message,
    );
    *status = std::mem::take(status).condition(condition);
}

/// Whether `views` has exactly ordinals `0..desired`, all replicating
pub(crate) fn is_settled(views: &[NodeView], desired: u32) -> bool {
    (0..desired).all(|o| views.iter().any(|v| v.ordinal == o && v.replicating))
        && views.iter().all(|v| v.ordinal < desired)
}

/// Record a failed membership step and schedule the retry
///
/// The marker moves to `InstallFailed` and the state to `Error`; only a
/// later successful membership step clears them.
pub(crate) async fn fail_membership(step: &Step<'_>, error: &Error) -> Result<Action, Error> {
    warn!(error = %error, "membership step failed");
    let message = error.to_string();

    let updated = step
        .update(|s| {
            s.state = ClusterState::Error;
            s.membership = MembershipMarker::InstallFailed;
            s.membership_claimed_at = None;
            s.failed_attempts = s.failed_attempts.saturating_add(1);
            s.message = Some(message.clone());
            set_ready_condition(s, false, "MembershipFailed", &message);
            true
        })
        .await?;

    step.publish(
        EventType::Warning,
        reasons::MEMBERSHIP_FAILED,
        actions::RECONCILE,
        message,
    )
    .await;

    let backoff = membership_backoff();
    let delay = if error.is_retryable() {
        let attempts = updated.status.map_or(1, |s| s.failed_attempts);
        backoff.delay_for_attempt(attempts)
    } else {
        backoff.max_delay
    };
    Ok(Action::requeue(delay))
}

/// Persist the topology a successful membership step produced
///
/// The marker becomes `Installed`. The state is Ready when the group holds
/// exactly the desired members, `unsettled` otherwise.
pub(crate) async fn record_membership(
    step: &Step<'_>,
    views: Vec<NodeView>,
    unsettled: ClusterState,
) -> Result<Action, Error> {
    let desired = step.desired();
    let settled = is_settled(&views, desired);
    let now = Utc::now();

    step.update(|s| {
        *s = std::mem::take(s).observe_topology(views.clone(), desired);
        s.membership = MembershipMarker::Installed;
        s.membership_claimed_at = None;
        s.bootstrapped_at.get_or_insert(now);
        s.failed_attempts = 0;
        if settled {
            let message = format!("{desired} of {desired} members replicating");
            s.state = ClusterState::Ready;
            set_ready_condition(s, true, "AllMembersOnline", &message);
            s.message = Some(message);
        } else {
            let message = format!("{} of {desired} members replicating", s.ready_nodes);
            s.state = unsettled;
            set_ready_condition(s, false, "MembersCatchingUp", &message);
            s.message = Some(message);
        }
        true
    })
    .await?;

    info!(settled, members = views.len(), "membership recorded");
    Ok(Action::requeue(if settled {
        SETTLED_REQUEUE
    } else {
        CATCH_UP_REQUEUE
    }))
}

/// Surface a spec that failed validation
pub async fn record_validation_failure(
    cluster: &MysqlCluster,
    ctx: &Context,
    error: &Error,
) -> Result<(), Error> {
    let message = error.to_string();
    if cluster.status.as_ref().and_then(|s| s.message.as_deref()) == Some(message.as_str()) {
        return Ok(());
    }

    modify_status(cluster, ctx, |s| {
        s.state = ClusterState::Error;
        s.message = Some(message.clone());
        set_ready_condition(s, false, "ValidationFailed", &message);
        true
    })
    .await?;

    warn!(cluster = %cluster.name_any(), %message, "cluster spec rejected");
    publish(
        cluster,
        ctx,
        EventType::Warning,
        reasons::VALIDATION_FAILED,
        actions::RECONCILE,
        message,
    )
    .await;
    Ok(())
}
