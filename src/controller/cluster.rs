//! MysqlCluster controller implementation
//!
//! Every reconcile re-reads the cluster, converges its child resources, asks
//! [`lifecycle::decide`](crate::lifecycle::decide) for the one transition due
//! now, runs it, and persists the outcome in status. Nothing is carried over
//! between calls, so a restarted controller picks up exactly where the
//! persisted status says the cluster is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::admin::{AdminTool, Credentials, MysqlShell};
use crate::config::OperatorConfig;
use crate::crd::{MembershipMarker, MysqlCluster, MysqlClusterStatus, NodeView};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::lifecycle::{decide, pod_group_size, Observation, Transition};
use crate::membership::MembershipOrchestrator;
use crate::probe::{AdminProber, NodeProber};
use crate::resources::{self, KubeResourceSynchronizer, ResourceSynchronizer};
use crate::topology::ClusterTopology;
use crate::{Error, FIELD_MANAGER, FINALIZER};

use super::{phases, teardown};

/// Status writes give up after this many lost optimistic-concurrency races
const MAX_STATUS_WRITE_ATTEMPTS: u32 = 5;

/// Name events are reported under
const CONTROLLER_NAME: &str = "lattice-mysql-controller";

/// Trait abstracting Kubernetes client operations for MysqlCluster
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a MysqlCluster, `None` if it no longer exists
    async fn get_cluster(&self, name: &str, namespace: &str)
        -> Result<Option<MysqlCluster>, Error>;

    /// Write `status` on top of `cluster`
    ///
    /// The write carries `cluster`'s resourceVersion; if the stored object
    /// has moved on, this fails with a conflict and nothing is written.
    /// Returns the updated object.
    async fn replace_status(
        &self,
        cluster: &MysqlCluster,
        status: &MysqlClusterStatus,
    ) -> Result<MysqlCluster, Error>;

    /// Add a finalizer to a MysqlCluster (no-op if present)
    async fn add_finalizer(&self, name: &str, namespace: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a MysqlCluster (no-op if absent or gone)
    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<MysqlCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        edit: impl FnOnce(&mut Vec<String>) -> bool,
    ) -> Result<(), Error> {
        let api = self.api(namespace);
        let Some(cluster) = api.get_opt(name).await? else {
            return Ok(());
        };
        let mut finalizers = cluster.metadata.finalizers.unwrap_or_default();
        if !edit(&mut finalizers) {
            return Ok(());
        }

        // resourceVersion makes the merge patch fail instead of clobbering a
        // concurrent finalizer edit
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": cluster.metadata.resource_version,
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| conflict_or(name, e))?;
        Ok(())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<MysqlCluster>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn replace_status(
        &self,
        cluster: &MysqlCluster,
        status: &MysqlClusterStatus,
    ) -> Result<MysqlCluster, Error> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let patch = status_patch(cluster, status)?;

        self.api(&namespace)
            .patch_status(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| conflict_or(&name, e))
    }

    async fn add_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(name, namespace, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.patch_finalizers(name, namespace, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }
}

/// Merge patch replacing the status of `cluster` with `status`
///
/// Fields present in the old status but absent from the new one are sent as
/// `null` so the merge removes them. The resourceVersion turns the patch into
/// a compare-and-swap.
fn status_patch(cluster: &MysqlCluster, status: &MysqlClusterStatus) -> Result<Value, Error> {
    let mut next = serde_json::to_value(status)?;
    let previous = serde_json::to_value(cluster.status_or_default())?;
    if let (Some(next), Value::Object(previous)) = (next.as_object_mut(), previous) {
        for key in previous.keys() {
            if !next.contains_key(key) {
                next.insert(key.clone(), Value::Null);
            }
        }
    }
    Ok(serde_json::json!({
        "metadata": { "resourceVersion": cluster.metadata.resource_version },
        "status": next
    }))
}

fn conflict_or(name: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(name, ae.message),
        other => other.into(),
    }
}

/// Controller context containing shared state and clients
///
/// Use [`Context::builder`] to construct instances.
pub struct Context {
    /// Kubernetes client for MysqlCluster operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Child resource synchronizer
    pub resources: Arc<dyn ResourceSynchronizer>,
    /// Membership orchestrator wired to the admin tool
    pub orchestrator: Arc<MembershipOrchestrator>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Operator settings
    pub config: OperatorConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with in-memory collaborators
    ///
    /// This method is primarily for unit tests where a real Kubernetes
    /// client is not available. For production code, use [`Context::builder`].
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        resources: Arc<dyn ResourceSynchronizer>,
        tool: Arc<dyn AdminTool>,
        prober: Arc<dyn NodeProber>,
    ) -> Self {
        Self {
            kube,
            resources,
            orchestrator: Arc::new(MembershipOrchestrator::new(tool, prober)),
            events: Arc::new(crate::events::NoopEventPublisher),
            config: OperatorConfig::default(),
        }
    }

    /// Topology resolver for `cluster` under this operator's cluster domain
    pub fn topology(&self, cluster: &MysqlCluster) -> ClusterTopology {
        ClusterTopology::new(cluster.name_any(), cluster.namespace().unwrap_or_default())
            .with_domain(&self.config.cluster_domain)
    }
}

/// Builder for constructing [`Context`] instances
///
/// Production:
/// ```ignore
/// let ctx = Context::builder(client).config(config).build();
/// ```
///
/// Testing with a scripted admin tool:
/// ```ignore
/// let ctx = Context::builder(client)
///     .admin_tool(fake.clone())
///     .prober(fake)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    kube: Option<Arc<dyn KubeClient>>,
    resources: Option<Arc<dyn ResourceSynchronizer>>,
    tool: Option<Arc<dyn AdminTool>>,
    prober: Option<Arc<dyn NodeProber>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: OperatorConfig::default(),
            kube: None,
            resources: None,
            tool: None,
            prober: None,
            events: None,
        }
    }

    /// Set operator settings
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the resource synchronizer
    pub fn resources(mut self, resources: Arc<dyn ResourceSynchronizer>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Override the admin tool (defaults to `mysqlsh`)
    pub fn admin_tool(mut self, tool: Arc<dyn AdminTool>) -> Self {
        self.tool = Some(tool);
        self
    }

    /// Override the node prober (defaults to probing through the admin tool)
    pub fn prober(mut self, prober: Arc<dyn NodeProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let config = self.config;
        let tool = self.tool.unwrap_or_else(|| {
            Arc::new(MysqlShell::new(
                config.mysqlsh_path.clone(),
                config.admin_timeout,
            ))
        });
        let prober = self
            .prober
            .unwrap_or_else(|| Arc::new(AdminProber::new(tool.clone())));
        let orchestrator =
            MembershipOrchestrator::new(tool, prober).with_probe_budget(config.probe_budget);

        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            resources: self
                .resources
                .unwrap_or_else(|| Arc::new(KubeResourceSynchronizer::new(self.client.clone()))),
            orchestrator: Arc::new(orchestrator),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            config,
        }
    }
}

/// Reconcile a MysqlCluster resource
///
/// Side effects happen in a fixed order: finalizer registration, then either
/// teardown or child-resource convergence, then at most one membership
/// transition, then status persistence.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<MysqlCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().ok_or_else(|| {
        Error::validation_for_field(&name, "metadata.namespace", "cluster must be namespaced")
    })?;
    debug!("reconciling cluster");

    // The watch cache may lag; act on what the store holds now
    let Some(cluster) = ctx.kube.get_cluster(&name, &namespace).await? else {
        debug!("cluster no longer exists");
        return Ok(Action::await_change());
    };

    if cluster.metadata.deletion_timestamp.is_some() {
        return teardown::handle_deletion(&cluster, &ctx).await;
    }

    if !has_finalizer(&cluster) {
        info!("adding finalizer");
        ctx.kube.add_finalizer(&name, &namespace, FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if let Err(e) = cluster.spec.validate(&name) {
        warn!(error = %e, "cluster validation failed");
        phases::record_validation_failure(&cluster, &ctx, &e).await?;
        // Don't requeue for validation errors - they require spec changes
        return Ok(Action::await_change());
    }

    let status = cluster.status_or_default();
    let desired = cluster.spec.replicas;
    let pod_group = pod_group_size(desired, &status.topology);
    if pod_group > desired {
        debug!(desired, pod_group, "holding departing pods until they leave the group");
    }

    let set = resources::desired(&cluster, pod_group, &ctx.config.cluster_domain)?;
    let converged = ctx.resources.converge(&cluster, &set).await?;
    let rollout = ctx.resources.rollout_status(&name, &namespace).await?;

    let topo = ctx.topology(&cluster);
    let credentials = Credentials::root(&cluster.spec.mysql.root_password);

    let rollout_settled = !converged.changed && rollout.as_ref().is_some_and(|r| r.is_complete());
    let observed: Option<Vec<NodeView>> = if rollout_settled
        && desired > 0
        && cluster.membership() == MembershipMarker::Installed
    {
        ctx.orchestrator
            .observe_topology(&topo, &credentials, &topo.nodes(0..pod_group))
            .await?
    } else {
        None
    };

    let transition = decide(&Observation {
        deleting: false,
        resources_changed: converged.changed,
        rollout: rollout.as_ref(),
        desired_replicas: desired,
        marker: cluster.membership(),
        claimed_at: status.membership_claimed_at,
        topology: observed.as_deref(),
        now: Utc::now(),
    });
    if transition.changes_membership() {
        info!(%transition, marker = %cluster.membership(), "membership transition");
    } else {
        debug!(%transition, marker = %cluster.membership(), "lifecycle decision");
    }

    let step = phases::Step {
        cluster: &cluster,
        ctx: &ctx,
        topo: &topo,
        credentials: &credentials,
        observed: observed.as_deref().unwrap_or_default(),
    };

    match transition {
        Transition::Deleting => teardown::handle_deletion(&cluster, &ctx).await,
        Transition::Provisioning => phases::handle_provisioning(&step).await,
        Transition::AwaitingRollout => {
            phases::handle_awaiting_rollout(&step, rollout.as_ref()).await
        }
        Transition::Closed => phases::handle_closed(&step).await,
        Transition::AwaitingBootstrap => phases::handle_awaiting_bootstrap(&step).await,
        Transition::Bootstrapping => phases::handle_bootstrapping(&step).await,
        Transition::Restarting => phases::handle_restarting(&step).await,
        Transition::ScalingOut { ordinals } => phases::handle_scaling_out(&step, &ordinals).await,
        Transition::ScalingIn { ordinals } => phases::handle_scaling_in(&step, &ordinals).await,
        Transition::Ready => phases::handle_ready(&step).await,
    }
}

/// Error policy for the controller
///
/// Errors that need a spec change back off for longer than those that clear
/// up on their own.
pub fn error_policy(cluster: Arc<MysqlCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}

/// Check if a cluster carries the controller's finalizer
pub(crate) fn has_finalizer(cluster: &MysqlCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

/// Read-modify-write the status of `cluster`
///
/// `edit` is applied to the freshest status; returning `false` from it means
/// "nothing to write". A lost optimistic-concurrency race re-reads the cluster
/// and applies `edit` again. An unchanged status is not written. Returns the
/// cluster as stored afterwards.
pub(crate) async fn modify_status<F>(
    cluster: &MysqlCluster,
    ctx: &Context,
    mut edit: F,
) -> Result<MysqlCluster, Error>
where
    F: FnMut(&mut MysqlClusterStatus) -> bool + Send,
{
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let mut current = cluster.clone();

    for attempt in 1..=MAX_STATUS_WRITE_ATTEMPTS {
        let before = current.status_or_default();
        let mut next = before.clone();
        if !edit(&mut next) {
            return Ok(current);
        }
        next.observed_generation = current.metadata.generation;
        if next == before {
            debug!("cluster status unchanged, skipping update");
            return Ok(current);
        }

        match ctx.kube.replace_status(&current, &next).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() => {
                debug!(attempt, error = %e, "status write lost a race, re-reading");
                current = ctx
                    .kube
                    .get_cluster(&name, &namespace)
                    .await?
                    .ok_or_else(|| Error::conflict(&name, "cluster deleted during status write"))?;
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::conflict(
        &name,
        format!("status write lost {MAX_STATUS_WRITE_ATTEMPTS} races in a row"),
    ))
}
