//! Secret, configuration, headless Service and StatefulSet for the servers

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ExecAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, Secret, SecretKeySelector,
    Service, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{config_name, secret_name, RenderContext, ROOT_PASSWORD_KEY, USER_PASSWORD_KEY};
use crate::topology::{GROUP_REPLICATION_PORT, MYSQLX_PORT, MYSQL_PORT};

const COMPONENT: &str = "database";
const DATA_VOLUME: &str = "data";
const CONFIG_VOLUME: &str = "config";
const CONF_D_VOLUME: &str = "conf-d";

/// Baseline server settings; `spec.mysql.conf` is appended after these
const BASE_CONFIG: &str = "[mysqld]
user = mysql
port = 3306
character-set-server = utf8mb4
skip_name_resolve = 1
max_connections = 1024
binlog_format = ROW
sync_binlog = 1
binlog_checksum = NONE
gtid_mode = ON
enforce_gtid_consistency = ON
log_replica_updates = ON
innodb_flush_log_at_trx_commit = 1
";

/// Plugins and start-on-boot so a restarted pod rejoins its group by itself
const GROUP_REPLICATION_CONFIG: &str = "[mysqld]
loose-plugin_load_add = 'mysql_clone.so'
loose-plugin_load_add = 'group_replication.so'
loose-group_replication_start_on_boot = ON
loose-group_replication_bootstrap_group = OFF
loose-group_replication_exit_state_action = READ_ONLY
";

/// Writes a per-ordinal server-id and the stable report_host, then links the
/// shared configuration into conf.d
const INIT_SCRIPT: &str = r#"set -e
ORDINAL="${HOSTNAME##*-}"
{
  echo "[mysqld]"
  echo "server-id=$((100 + ORDINAL))"
  echo "report_host=${HOSTNAME}.${SERVICE_NAME}.${NAMESPACE}.svc.${CLUSTER_DOMAIN}"
} > /etc/mysql/conf.d/server-id.cnf
cp /mnt/config/*.cnf /etc/mysql/conf.d/
"#;

pub(super) fn secret(ctx: &RenderContext<'_>) -> Secret {
    let spec = &ctx.cluster.spec.mysql;
    let mut data = BTreeMap::from([(ROOT_PASSWORD_KEY.to_string(), spec.root_password.clone())]);
    if let Some(password) = &spec.password {
        data.insert(USER_PASSWORD_KEY.to_string(), password.clone());
    }
    Secret {
        metadata: ctx.metadata(secret_name(ctx.name), COMPONENT),
        type_: Some("Opaque".to_string()),
        string_data: Some(data),
        ..Default::default()
    }
}

/// Render `my.cnf`: baseline settings followed by user overrides
pub(super) fn render_my_cnf(overrides: &BTreeMap<String, String>) -> String {
    let mut cnf = BASE_CONFIG.to_string();
    for (key, value) in overrides {
        cnf.push_str(&format!("{key} = {value}\n"));
    }
    cnf
}

pub(super) fn config(ctx: &RenderContext<'_>) -> ConfigMap {
    ConfigMap {
        metadata: ctx.metadata(config_name(ctx.name), COMPONENT),
        data: Some(BTreeMap::from([
            ("my.cnf".to_string(), render_my_cnf(&ctx.cluster.spec.mysql.conf)),
            (
                "group-replication.cnf".to_string(),
                GROUP_REPLICATION_CONFIG.to_string(),
            ),
        ])),
        ..Default::default()
    }
}

fn port(name: &str, number: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: i32::from(number),
        target_port: Some(IntOrString::Int(i32::from(number))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

pub(super) fn headless_service(ctx: &RenderContext<'_>) -> Service {
    Service {
        metadata: ctx.metadata(ctx.name.to_string(), COMPONENT),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            // Pods must resolve each other before they pass readiness
            publish_not_ready_addresses: Some(true),
            selector: Some(ctx.selector(COMPONENT)),
            ports: Some(vec![
                port("mysql", MYSQL_PORT),
                port("mysqlx", MYSQLX_PORT),
                port("gr-xcom", GROUP_REPLICATION_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn container_port(name: &str, number: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: i32::from(number),
        ..Default::default()
    }
}

fn init_container(ctx: &RenderContext<'_>) -> Container {
    Container {
        name: "init-mysql".to_string(),
        image: Some(ctx.cluster.spec.mysql.image.clone()),
        image_pull_policy: ctx.cluster.spec.pod_policy.image_pull_policy.clone(),
        command: Some(vec!["sh".to_string(), "-c".to_string(), INIT_SCRIPT.to_string()]),
        env: Some(vec![
            plain_env("SERVICE_NAME", ctx.name),
            EnvVar {
                name: "NAMESPACE".to_string(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.namespace".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            plain_env("CLUSTER_DOMAIN", ctx.domain),
        ]),
        volume_mounts: Some(vec![
            mount(CONF_D_VOLUME, "/etc/mysql/conf.d"),
            mount(CONFIG_VOLUME, "/mnt/config"),
        ]),
        ..Default::default()
    }
}

fn mysql_container(ctx: &RenderContext<'_>) -> Container {
    let spec = &ctx.cluster.spec.mysql;
    let secret = secret_name(ctx.name);

    let mut env = vec![
        secret_env("MYSQL_ROOT_PASSWORD", &secret, ROOT_PASSWORD_KEY),
        plain_env("MYSQL_ROOT_HOST", "%"),
    ];
    if let Some(user) = &spec.user {
        env.push(plain_env("MYSQL_USER", user.clone()));
        env.push(secret_env("MYSQL_PASSWORD", &secret, USER_PASSWORD_KEY));
    }

    Container {
        name: "mysql".to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: ctx.cluster.spec.pod_policy.image_pull_policy.clone(),
        ports: Some(vec![
            container_port("mysql", MYSQL_PORT),
            container_port("mysqlx", MYSQLX_PORT),
            container_port("gr-xcom", GROUP_REPLICATION_PORT),
        ]),
        env: Some(env),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    r#"mysqladmin -uroot -p"$MYSQL_ROOT_PASSWORD" ping"#.to_string(),
                ]),
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(5),
            timeout_seconds: Some(3),
            ..Default::default()
        }),
        liveness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(i32::from(MYSQL_PORT)),
                ..Default::default()
            }),
            initial_delay_seconds: Some(60),
            period_seconds: Some(10),
            failure_threshold: Some(6),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount(CONF_D_VOLUME, "/etc/mysql/conf.d"),
            mount(DATA_VOLUME, "/var/lib/mysql"),
        ]),
        resources: spec.resources.clone(),
        ..Default::default()
    }
}

fn claim_template(ctx: &RenderContext<'_>) -> PersistentVolumeClaim {
    let persistence = &ctx.cluster.spec.persistence;
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            labels: Some(ctx.selector(COMPONENT)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(persistence.access_modes.clone()),
            storage_class_name: persistence.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(persistence.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn statefulset(ctx: &RenderContext<'_>, replicas: u32) -> StatefulSet {
    let policy = &ctx.cluster.spec.pod_policy;
    let persistent = ctx.cluster.spec.persistence.enabled;

    let mut pod_labels = policy.labels.clone();
    pod_labels.extend(ctx.labels(COMPONENT));

    let mut volumes = vec![
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_name(ctx.name),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: CONF_D_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    if !persistent {
        volumes.push(Volume {
            name: DATA_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }

    StatefulSet {
        metadata: ctx.metadata(ctx.name.to_string(), COMPONENT),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas as i32),
            service_name: ctx.name.to_string(),
            selector: LabelSelector {
                match_labels: Some(ctx.selector(COMPONENT)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: (!policy.annotations.is_empty())
                        .then(|| policy.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![init_container(ctx)]),
                    containers: vec![mysql_container(ctx)],
                    volumes: Some(volumes),
                    priority_class_name: policy.priority_class_name.clone(),
                    termination_grace_period_seconds: Some(60),
                    ..Default::default()
                }),
            },
            volume_claim_templates: persistent.then(|| vec![claim_template(ctx)]),
            persistent_volume_claim_retention_policy: persistent.then(|| {
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Delete".to_string()),
                    when_scaled: Some("Retain".to_string()),
                }
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
