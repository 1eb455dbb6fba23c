//! Deletion of a MysqlCluster.
//!
//! The replication group is shut down first (best effort, bounded), then the
//! child resources are released, and only then is the finalizer removed. The
//! group is never left running after the cluster object disappears.

use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use crate::admin::Credentials;
use crate::crd::{MembershipMarker, MysqlCluster, NodeView};
use crate::events::{actions, reasons};
use crate::lifecycle::pod_group_size;
use crate::topology::ClusterTopology;
use crate::{Error, FINALIZER};

use super::cluster::{has_finalizer, Context};
use super::phases::publish;

/// Requeue interval while deletion waits for an in-flight bootstrap
const BLOCKED_REQUEUE: Duration = Duration::from_secs(30);

/// Handle a cluster with a deletion timestamp
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn handle_deletion(cluster: &MysqlCluster, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(cluster) {
        return Ok(Action::await_change());
    }
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let marker = cluster.membership();

    // Releasing storage mid-bootstrap would strand a half-built group
    if marker == MembershipMarker::Installing && !cluster.force_delete_requested() {
        info!("deletion waiting for in-flight bootstrap");
        publish(
            cluster,
            ctx,
            EventType::Warning,
            reasons::DELETION_BLOCKED,
            actions::DELETE,
            format!(
                "bootstrap in progress; annotate with {}=true to delete anyway",
                crate::crd::FORCE_DELETE_ANNOTATION
            ),
        )
        .await;
        return Ok(Action::requeue(BLOCKED_REQUEUE));
    }

    info!(%marker, "deleting cluster");
    publish(
        cluster,
        ctx,
        EventType::Normal,
        reasons::DELETION_STARTED,
        actions::DELETE,
        "deleting cluster".to_string(),
    )
    .await;

    if matches!(
        marker,
        MembershipMarker::Installed | MembershipMarker::Installing
    ) {
        shut_down_group(cluster, ctx).await;
    }

    ctx.resources.release(cluster).await?;
    ctx.kube.remove_finalizer(&name, &namespace, FINALIZER).await?;
    info!("finalizer removed");
    Ok(Action::await_change())
}

async fn dissolve_group(
    ctx: &Context,
    topo: &ClusterTopology,
    credentials: &Credentials,
    recorded: Vec<NodeView>,
    pods: u32,
) -> Result<(), Error> {
    let live = ctx
        .orchestrator
        .observe_topology(topo, credentials, &topo.nodes(0..pods))
        .await?;
    let current = live.unwrap_or(recorded);
    ctx.orchestrator.dissolve(topo, credentials, &current).await
}

/// Ordered group shutdown within the teardown timeout
///
/// Failures are logged and reported but never block deletion.
async fn shut_down_group(cluster: &MysqlCluster, ctx: &Context) {
    let topo = ctx.topology(cluster);
    let credentials = Credentials::root(&cluster.spec.mysql.root_password);
    let recorded = cluster.status_or_default().topology;
    let pods = pod_group_size(cluster.spec.replicas, &recorded);

    let shutdown = dissolve_group(ctx, &topo, &credentials, recorded, pods);

    let failure = match tokio::time::timeout(ctx.config.teardown_timeout, shutdown).await {
        Ok(Ok(())) => {
            info!("replication group dissolved");
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", ctx.config.teardown_timeout),
    };

    warn!(error = %failure, "graceful group shutdown failed, continuing deletion");
    publish(
        cluster,
        ctx,
        EventType::Warning,
        reasons::DISSOLVE_DEGRADED,
        actions::DELETE,
        format!("group shutdown skipped: {failure}"),
    )
    .await;
}
