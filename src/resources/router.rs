//! MySQL Router Deployment and Service

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, Probe,
    SecretKeySelector, Service, ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{router_name, secret_name, RenderContext, ROOT_PASSWORD_KEY};
use crate::topology::MYSQL_PORT;

const COMPONENT: &str = "router";

/// Read-write classic protocol port
pub const ROUTER_RW_PORT: u16 = 6446;

/// Read-only classic protocol port
pub const ROUTER_RO_PORT: u16 = 6447;

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn container(ctx: &RenderContext<'_>) -> Container {
    let spec = &ctx.cluster.spec;
    Container {
        name: "router".to_string(),
        image: Some(spec.router.image.clone()),
        image_pull_policy: spec.pod_policy.image_pull_policy.clone(),
        ports: Some(vec![
            ContainerPort {
                name: Some("rw".to_string()),
                container_port: i32::from(ROUTER_RW_PORT),
                ..Default::default()
            },
            ContainerPort {
                name: Some("ro".to_string()),
                container_port: i32::from(ROUTER_RO_PORT),
                ..Default::default()
            },
        ]),
        env: Some(vec![
            env("MYSQL_HOST", ctx.service_host()),
            env("MYSQL_PORT", MYSQL_PORT.to_string()),
            env("MYSQL_USER", "root"),
            EnvVar {
                name: "MYSQL_PASSWORD".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret_name(ctx.name),
                        key: ROOT_PASSWORD_KEY.to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            env("MYSQL_INNODB_CLUSTER_MEMBERS", spec.replicas.to_string()),
            env("MYSQL_CREATE_ROUTER_USER", "0"),
        ]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(i32::from(ROUTER_RW_PORT)),
                ..Default::default()
            }),
            period_seconds: Some(5),
            ..Default::default()
        }),
        resources: spec.router.resources.clone(),
        ..Default::default()
    }
}

pub(super) fn deployment(ctx: &RenderContext<'_>) -> Deployment {
    Deployment {
        metadata: ctx.metadata(router_name(ctx.name), COMPONENT),
        spec: Some(DeploymentSpec {
            replicas: Some(ctx.cluster.spec.router.replicas as i32),
            selector: LabelSelector {
                match_labels: Some(ctx.selector(COMPONENT)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ctx.labels(COMPONENT)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container(ctx)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn service(ctx: &RenderContext<'_>) -> Service {
    let port = |name: &str, number: u16| ServicePort {
        name: Some(name.to_string()),
        port: i32::from(number),
        target_port: Some(IntOrString::Int(i32::from(number))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };
    Service {
        metadata: ctx.metadata(router_name(ctx.name), COMPONENT),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(ctx.selector(COMPONENT)),
            ports: Some(vec![
                port("mysql-rw", ROUTER_RW_PORT),
                port("mysql-ro", ROUTER_RO_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::desired;
    use crate::testing::sample_cluster;

    #[test]
    fn router_bootstraps_against_headless_service() {
        let set = desired(&sample_cluster(3), 3, "cluster.local").unwrap();
        let deployment = set.router_deployment.unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("orders-router"));

        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        let host = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "MYSQL_HOST")
            .and_then(|e| e.value.clone());
        assert_eq!(host.as_deref(), Some("orders.db.svc.cluster.local"));
    }

    #[test]
    fn router_service_exposes_rw_and_ro() {
        let set = desired(&sample_cluster(3), 3, "cluster.local").unwrap();
        let ports: Vec<i32> = set
            .router_service
            .unwrap()
            .spec
            .unwrap()
            .ports
            .unwrap()
            .iter()
            .map(|p| p.port)
            .collect();
        assert_eq!(
            ports,
            vec![i32::from(ROUTER_RW_PORT), i32::from(ROUTER_RO_PORT)]
        );
    }

    #[test]
    fn router_selector_does_not_match_database_pods() {
        let set = desired(&sample_cluster(3), 3, "cluster.local").unwrap();
        let router = set.router_service.unwrap().spec.unwrap().selector.unwrap();
        let db = set.service.spec.unwrap().selector.unwrap();
        assert_ne!(router, db);
    }
}
