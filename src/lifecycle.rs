//! Cluster lifecycle decisions
//!
//! [`decide`] maps one reconcile's observations to the single transition the
//! controller should act on. It is a pure function: nothing carries over from
//! earlier calls, so a restarted controller reaches the same decision from the
//! same inputs.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crd::{MembershipMarker, NodeView};
use crate::membership::anchor_ordinal;

/// How long an `Installing` claim protects a bootstrap from other reconciles
pub const BOOTSTRAP_LEASE: Duration = Duration::from_secs(600);

/// Rollout progress of the pod group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolloutStatus {
    /// Replicas the pod group is converging to
    pub desired_replicas: u32,
    /// Replicas passing their readiness checks
    pub ready_replicas: u32,
    /// Revision the running pods belong to
    pub current_revision: Option<String>,
    /// Revision the pod group is rolling to
    pub update_revision: Option<String>,
}

impl RolloutStatus {
    /// Every desired pod is ready and on the latest revision
    pub fn is_complete(&self) -> bool {
        self.ready_replicas == self.desired_replicas
            && self.current_revision == self.update_revision
    }
}

/// Everything one reconcile observed, evaluated fresh each call
#[derive(Clone, Debug)]
pub struct Observation<'a> {
    /// A deletion timestamp is set
    pub deleting: bool,
    /// Child resources needed a write this pass
    pub resources_changed: bool,
    /// Pod group rollout, `None` if the pod group does not exist yet
    pub rollout: Option<&'a RolloutStatus>,
    /// Replicas the spec asks for
    pub desired_replicas: u32,
    /// Persisted membership marker
    pub marker: MembershipMarker,
    /// When the marker last moved to `Installing`
    pub claimed_at: Option<DateTime<Utc>>,
    /// Live topology read, `None` when no node reported a group
    pub topology: Option<&'a [NodeView]>,
    /// Evaluation time
    pub now: DateTime<Utc>,
}

/// The single action a reconcile should take
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Run the teardown sequence
    Deleting,
    /// Child resources were just written; wait for them to settle
    Provisioning,
    /// Pods are not all ready on the latest revision
    AwaitingRollout,
    /// The data tier is scaled to zero
    Closed,
    /// Another reconcile holds a live bootstrap claim
    AwaitingBootstrap,
    /// Claim the marker and bootstrap (or resume bootstrapping) the group
    Bootstrapping,
    /// The group was installed but every member is stopped
    Restarting,
    /// Join these ordinals, lowest first
    ScalingOut {
        /// Ordinals to join
        ordinals: Vec<u32>,
    },
    /// Remove these ordinals, highest first, before the pod group shrinks
    ScalingIn {
        /// Ordinals to remove
        ordinals: Vec<u32>,
    },
    /// Nothing to do
    Ready,
}

impl Transition {
    /// Whether this transition invokes the membership orchestrator
    pub fn changes_membership(&self) -> bool {
        matches!(
            self,
            Self::Bootstrapping | Self::Restarting | Self::ScalingOut { .. } | Self::ScalingIn { .. }
        )
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleting => write!(f, "Deleting"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::AwaitingRollout => write!(f, "AwaitingRollout"),
            Self::Closed => write!(f, "Closed"),
            Self::AwaitingBootstrap => write!(f, "AwaitingBootstrap"),
            Self::Bootstrapping => write!(f, "Bootstrapping"),
            Self::Restarting => write!(f, "Restarting"),
            Self::ScalingOut { ordinals } => write!(f, "ScalingOut{:?}", ordinals),
            Self::ScalingIn { ordinals } => write!(f, "ScalingIn{:?}", ordinals),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Decide the next transition
pub fn decide(obs: &Observation<'_>) -> Transition {
    if obs.deleting {
        return Transition::Deleting;
    }

    let rollout = match obs.rollout {
        Some(rollout) if !obs.resources_changed => rollout,
        _ => return Transition::Provisioning,
    };

    if !rollout.is_complete() {
        return Transition::AwaitingRollout;
    }

    if obs.desired_replicas == 0 {
        return Transition::Closed;
    }

    match obs.marker {
        MembershipMarker::NotInstalled | MembershipMarker::InstallFailed => Transition::Bootstrapping,
        MembershipMarker::Installing => {
            if claim_is_live(obs.claimed_at, obs.now) {
                Transition::AwaitingBootstrap
            } else {
                Transition::Bootstrapping
            }
        }
        MembershipMarker::Installed => installed(obs.topology, obs.desired_replicas),
    }
}

fn installed(topology: Option<&[NodeView]>, desired: u32) -> Transition {
    let Some(views) = topology else {
        return Transition::Restarting;
    };
    if anchor_ordinal(views).is_none() {
        return Transition::Restarting;
    }

    let missing: Vec<u32> = (0..desired)
        .filter(|ordinal| !views.iter().any(|v| v.ordinal == *ordinal && v.replicating))
        .collect();
    if !missing.is_empty() {
        return Transition::ScalingOut { ordinals: missing };
    }

    let mut extra: Vec<u32> = views
        .iter()
        .map(|v| v.ordinal)
        .filter(|ordinal| *ordinal >= desired)
        .collect();
    if !extra.is_empty() {
        extra.sort_unstable_by(|a, b| b.cmp(a));
        return Transition::ScalingIn { ordinals: extra };
    }

    Transition::Ready
}

/// Whether an `Installing` claim made at `claimed_at` still blocks others
pub fn claim_is_live(claimed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match claimed_at {
        Some(at) => (now - at).num_seconds() < BOOTSTRAP_LEASE.as_secs() as i64,
        None => false,
    }
}

/// Whether a reconcile may move `marker` to `Installing`
pub fn can_claim(
    marker: MembershipMarker,
    claimed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    marker.is_claimable()
        || (marker == MembershipMarker::Installing && !claim_is_live(claimed_at, now))
}

/// Size the pod group should converge to
///
/// While the recorded topology still lists ordinals at or above `desired`,
/// the pod group keeps them so they can leave the group before their pods go
/// away. Scaling to zero stops everything at once.
pub fn pod_group_size(desired: u32, recorded: &[NodeView]) -> u32 {
    if desired == 0 {
        return 0;
    }
    recorded
        .iter()
        .map(|v| v.ordinal + 1)
        .max()
        .map_or(desired, |held| held.max(desired))
}
