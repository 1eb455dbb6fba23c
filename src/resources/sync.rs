//! Kubernetes-backed [`ResourceSynchronizer`]

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{
    config_name, router_name, secret_name, spec_hash, ConvergeOutcome, DesiredResourceSet,
    ResourceSynchronizer,
};
use crate::crd::MysqlCluster;
use crate::lifecycle::RolloutStatus;
use crate::{Error, FIELD_MANAGER};

/// Applies child resources with server-side apply
pub struct KubeResourceSynchronizer {
    client: Client,
}

impl KubeResourceSynchronizer {
    /// Create a synchronizer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Apply `obj` unless the live object already carries the same spec hash
    ///
    /// Returns whether a write happened.
    async fn apply<K>(&self, namespace: &str, obj: &K) -> Result<bool, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let kind = K::kind(&());
        let name = obj.meta().name.clone().ok_or_else(|| {
            Error::internal_with_context("resources", format!("{kind} without a name"))
        })?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        if let Some(live) = api.get_opt(&name).await? {
            if spec_hash(&live).is_some() && spec_hash(&live) == spec_hash(obj) {
                debug!(%kind, %name, "unchanged, skipping apply");
                return Ok(false);
            }
        }

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await?;
        info!(%kind, %name, namespace, "applied");
        Ok(true)
    }

    /// Delete `name` if it exists; returns whether anything was deleted
    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<bool, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => {
                let kind = K::kind(&());
                info!(%kind, %name, namespace, "deleted");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ResourceSynchronizer for KubeResourceSynchronizer {
    async fn converge(
        &self,
        cluster: &MysqlCluster,
        desired: &DesiredResourceSet,
    ) -> Result<ConvergeOutcome, Error> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().ok_or_else(|| {
            Error::validation_for_field(&name, "metadata.namespace", "cluster must be namespaced")
        })?;

        // Dependencies first: the pods mount the Secret and ConfigMap and
        // resolve each other through the Service
        let mut changed = self.apply(&namespace, &desired.secret).await?;
        changed |= self.apply(&namespace, &desired.config).await?;
        changed |= self.apply(&namespace, &desired.service).await?;
        changed |= self.apply(&namespace, &desired.statefulset).await?;

        match (&desired.router_deployment, &desired.router_service) {
            (Some(deployment), Some(service)) => {
                changed |= self.apply(&namespace, deployment).await?;
                changed |= self.apply(&namespace, service).await?;
            }
            _ => {
                let router = router_name(&name);
                changed |= self.delete::<Deployment>(&namespace, &router).await?;
                changed |= self.delete::<Service>(&namespace, &router).await?;
            }
        }

        Ok(ConvergeOutcome { changed })
    }

    async fn rollout_status(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<RolloutStatus>, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let Some(sts) = api.get_opt(name).await? else {
            return Ok(None);
        };
        Ok(Some(rollout_of(&sts)))
    }

    async fn release(&self, cluster: &MysqlCluster) -> Result<(), Error> {
        let name = cluster.name_any();
        let Some(namespace) = cluster.namespace() else {
            return Ok(());
        };
        let router = router_name(&name);

        // Reverse of creation order
        self.delete::<Deployment>(&namespace, &router).await?;
        self.delete::<Service>(&namespace, &router).await?;
        self.delete::<StatefulSet>(&namespace, &name).await?;
        self.delete::<Service>(&namespace, &name).await?;
        self.delete::<ConfigMap>(&namespace, &config_name(&name)).await?;
        self.delete::<Secret>(&namespace, &secret_name(&name)).await?;
        Ok(())
    }
}

/// Read rollout progress from a StatefulSet
///
/// A status that has not caught up with the latest spec generation reports no
/// ready replicas, so nothing acts on it.
pub(super) fn rollout_of(sts: &StatefulSet) -> RolloutStatus {
    let desired = sts
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
        .max(0) as u32;
    let status = sts.status.clone().unwrap_or_default();
    let current = match (status.observed_generation, sts.metadata.generation) {
        (Some(observed), Some(generation)) => observed >= generation,
        (_, None) => true,
        (None, Some(_)) => false,
    };

    RolloutStatus {
        desired_replicas: desired,
        ready_replicas: if current {
            status.ready_replicas.unwrap_or(0).max(0) as u32
        } else {
            0
        },
        current_revision: status.current_revision,
        update_revision: status.update_revision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};

    fn sts(replicas: i32, ready: i32, generation: i64, observed: i64) -> StatefulSet {
        let mut sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                replicas,
                ready_replicas: Some(ready),
                observed_generation: Some(observed),
                current_revision: Some("orders-abc".to_string()),
                update_revision: Some("orders-abc".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        sts.metadata.generation = Some(generation);
        sts
    }

    #[test]
    fn rollout_reports_ready_pods() {
        let rollout = rollout_of(&sts(3, 2, 4, 4));
        assert_eq!(rollout.desired_replicas, 3);
        assert_eq!(rollout.ready_replicas, 2);
        assert!(!rollout.is_complete());

        assert!(rollout_of(&sts(3, 3, 4, 4)).is_complete());
    }

    /// Story: A freshly scaled StatefulSet is not trusted until its status catches up
    #[test]
    fn story_stale_status_is_not_complete() {
        let rollout = rollout_of(&sts(4, 3, 5, 4));
        assert_eq!(rollout.ready_replicas, 0);
        assert!(!rollout.is_complete());
    }

    #[test]
    fn revision_split_is_not_complete() {
        let mut s = sts(3, 3, 1, 1);
        s.status.as_mut().unwrap().update_revision = Some("orders-def".to_string());
        assert!(!rollout_of(&s).is_complete());
    }
}
