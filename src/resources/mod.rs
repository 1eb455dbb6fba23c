//! Child resources owned by a MysqlCluster
//!
//! [`desired`] renders the full set of Kubernetes objects for one cluster at a
//! given pod-group size. Every object carries an owner reference back to the
//! cluster and a [`SPEC_HASH_ANNOTATION`] computed from its rendered form, so
//! the synchronizer can skip writes when nothing changed.

mod mysql;
mod router;
mod sync;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::crd::MysqlCluster;
use crate::lifecycle::RolloutStatus;
use crate::Error;

pub use sync::KubeResourceSynchronizer;

/// Annotation holding the hash of an object's rendered spec
pub const SPEC_HASH_ANNOTATION: &str = "lattice.dev/spec-hash";

/// Key of the root password inside the credentials Secret
pub const ROOT_PASSWORD_KEY: &str = "rootPassword";

/// Key of the application password inside the credentials Secret
pub const USER_PASSWORD_KEY: &str = "password";

/// Value of `app.kubernetes.io/managed-by` on every child object
pub const MANAGED_BY: &str = "lattice-mysql";

/// Objects rendered for one cluster
#[derive(Clone, Debug)]
pub struct DesiredResourceSet {
    /// Root (and application) credentials
    pub secret: Secret,
    /// `my.cnf` fragments mounted into every server
    pub config: ConfigMap,
    /// Headless Service giving each pod its stable DNS name
    pub service: Service,
    /// The pod group
    pub statefulset: StatefulSet,
    /// Router Deployment, when the router is enabled
    pub router_deployment: Option<Deployment>,
    /// Router Service, when the router is enabled
    pub router_service: Option<Service>,
}

/// Result of converging the desired set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConvergeOutcome {
    /// At least one object was created, updated or deleted
    pub changed: bool,
}

/// Converges child resources and reports on the pod group
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceSynchronizer: Send + Sync {
    /// Create or update every object in `desired`; objects whose spec hash
    /// already matches are left alone
    async fn converge(
        &self,
        cluster: &MysqlCluster,
        desired: &DesiredResourceSet,
    ) -> Result<ConvergeOutcome, Error>;

    /// Rollout status of the pod group, `None` if it does not exist
    async fn rollout_status(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<RolloutStatus>, Error>;

    /// Delete every object owned by `cluster` (missing objects are fine)
    async fn release(&self, cluster: &MysqlCluster) -> Result<(), Error>;
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable across toolchains and can be
/// persisted in annotations.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Name of the credentials Secret
pub fn secret_name(cluster: &str) -> String {
    format!("{cluster}-credentials")
}

/// Name of the configuration ConfigMap
pub fn config_name(cluster: &str) -> String {
    format!("{cluster}-config")
}

/// Name of the router Deployment and Service
pub fn router_name(cluster: &str) -> String {
    format!("{cluster}-router")
}

/// Render every child object for `cluster` with `replicas` pods
///
/// `replicas` is the pod-group size, which can exceed the spec while departing
/// members are still leaving the group.
pub fn desired(
    cluster: &MysqlCluster,
    replicas: u32,
    domain: &str,
) -> Result<DesiredResourceSet, Error> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::validation_for_field(&name, "metadata.namespace", "cluster must be namespaced"))?;
    let owner = cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("resources", format!("{name} has no uid yet"))
    })?;
    let ctx = RenderContext {
        cluster,
        name: &name,
        namespace: &namespace,
        domain,
        owner,
    };

    let router_enabled = cluster.spec.router.replicas > 0;
    Ok(DesiredResourceSet {
        secret: stamp(mysql::secret(&ctx))?,
        config: stamp(mysql::config(&ctx))?,
        service: stamp(mysql::headless_service(&ctx))?,
        statefulset: stamp(mysql::statefulset(&ctx, replicas))?,
        router_deployment: router_enabled
            .then(|| stamp(router::deployment(&ctx)))
            .transpose()?,
        router_service: router_enabled
            .then(|| stamp(router::service(&ctx)))
            .transpose()?,
    })
}

/// Inputs shared by the individual object builders
struct RenderContext<'a> {
    cluster: &'a MysqlCluster,
    name: &'a str,
    namespace: &'a str,
    domain: &'a str,
    owner: OwnerReference,
}

impl RenderContext<'_> {
    fn labels(&self, component: &str) -> BTreeMap<String, String> {
        let mut labels = self.selector(component);
        labels.insert("app.kubernetes.io/name".to_string(), "mysql".to_string());
        labels.insert("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string());
        labels
    }

    fn selector(&self, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/instance".to_string(), self.name.to_string()),
            ("app.kubernetes.io/component".to_string(), component.to_string()),
        ])
    }

    fn metadata(&self, name: String, component: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.to_string()),
            labels: Some(self.labels(component)),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    /// Headless service DNS name
    fn service_host(&self) -> String {
        format!("{}.{}.svc.{}", self.name, self.namespace, self.domain)
    }
}

/// Add the spec-hash annotation computed over the rendered object
fn stamp<K>(mut obj: K) -> Result<K, Error>
where
    K: Resource + Serialize,
{
    let rendered = serde_json::to_string(&obj)?;
    let hash = deterministic_hash(&rendered);
    obj.meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
    Ok(obj)
}

/// Spec hash carried by an object, if any
pub fn spec_hash<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_cluster;

    #[test]
    fn hash_is_stable_and_compact() {
        assert_eq!(deterministic_hash("abc"), deterministic_hash("abc"));
        assert_ne!(deterministic_hash("abc"), deterministic_hash("abd"));
        assert_eq!(deterministic_hash("abc").len(), 16);
    }

    /// Story: Re-rendering an unchanged cluster produces identical hashes
    ///
    /// The synchronizer relies on this to avoid rewriting objects (and
    /// rolling pods) on every reconcile.
    #[test]
    fn story_unchanged_cluster_renders_identical_hashes() {
        let cluster = sample_cluster(3);
        let a = desired(&cluster, 3, "cluster.local").unwrap();
        let b = desired(&cluster, 3, "cluster.local").unwrap();

        assert!(spec_hash(&a.statefulset).is_some());
        assert_eq!(spec_hash(&a.statefulset), spec_hash(&b.statefulset));
        assert_eq!(spec_hash(&a.config), spec_hash(&b.config));

        let c = desired(&cluster, 4, "cluster.local").unwrap();
        assert_ne!(spec_hash(&a.statefulset), spec_hash(&c.statefulset));
        assert_eq!(spec_hash(&a.service), spec_hash(&c.service));
    }

    #[test]
    fn every_object_is_owned_by_the_cluster() {
        let set = desired(&sample_cluster(3), 3, "cluster.local").unwrap();
        let owners = [
            set.secret.metadata.owner_references.clone(),
            set.config.metadata.owner_references.clone(),
            set.service.metadata.owner_references.clone(),
            set.statefulset.metadata.owner_references.clone(),
            set.router_deployment.unwrap().metadata.owner_references,
        ];
        for refs in owners {
            let refs = refs.unwrap();
            assert_eq!(refs.len(), 1);
            assert_eq!(refs[0].kind, "MysqlCluster");
            assert_eq!(refs[0].name, "orders");
            assert_eq!(refs[0].controller, Some(true));
        }
    }

    #[test]
    fn router_is_omitted_when_disabled() {
        let mut cluster = sample_cluster(3);
        cluster.spec.router.replicas = 0;
        let set = desired(&cluster, 3, "cluster.local").unwrap();
        assert!(set.router_deployment.is_none());
        assert!(set.router_service.is_none());
    }

    #[test]
    fn unsaved_cluster_cannot_be_rendered() {
        let mut cluster = sample_cluster(3);
        cluster.metadata.uid = None;
        assert!(desired(&cluster, 3, "cluster.local").is_err());

        let mut cluster = sample_cluster(3);
        cluster.metadata.namespace = None;
        assert!(matches!(
            desired(&cluster, 3, "cluster.local"),
            Err(Error::Validation { .. })
        ));
    }
}
