//! Lattice MySQL operator - runs MySQL group-replication clusters on Kubernetes

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use lattice_mysql::config::{ControllerArgs, OperatorConfig};
use lattice_mysql::controller::{error_policy, reconcile, Context};
use lattice_mysql::crd::MysqlCluster;
use lattice_mysql::retry::{retry_with_backoff, RetryConfig};
use lattice_mysql::telemetry::{init_telemetry, TelemetryConfig};
use lattice_mysql::FIELD_MANAGER;

/// Lattice MySQL - CRD-driven operator for MySQL group-replication clusters
#[derive(Parser, Debug)]
#[command(name = "lattice-mysql", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches MysqlCluster resources and the StatefulSets they own, and
    /// reconciles each cluster's pods and group membership.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MysqlCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller.into()).await,
    }
}

/// Install or update the MysqlCluster CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let name = MysqlCluster::crd_name();

    let crd = MysqlCluster::crd();
    let patch = Patch::Apply(&crd);

    // The API server may still be coming up when the operator pod starts
    tracing::info!(crd = %name, "Installing MysqlCluster CRD...");
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install-crd", || {
        crds.patch(&name, &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MysqlCluster CRD: {}", e))?;
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        mysqlsh = %config.mysqlsh_path.display(),
        "Lattice MySQL controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Operator installs its own CRD on startup
    ensure_crd_installed(&client).await?;

    let (clusters, statefulsets): (Api<MysqlCluster>, Api<StatefulSet>) =
        match config.watch_namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

    let ctx = Arc::new(Context::builder(client).config(config).build());

    Controller::new(clusters, WatcherConfig::default())
        .owns(statefulsets, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Cluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Cluster reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Lattice MySQL controller shutting down");
    Ok(())
}
