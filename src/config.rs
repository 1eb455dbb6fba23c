//! Operator configuration
//!
//! Every setting can come from a flag or an environment variable. The
//! [`ControllerArgs`] parsed by `main` are folded into an [`OperatorConfig`],
//! which is what the rest of the crate reads.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::admin::mysqlsh::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_MYSQLSH_PATH};
use crate::probe::DEFAULT_PROBE_BUDGET;
use crate::DEFAULT_CLUSTER_DOMAIN;

/// Default bound on the graceful group shutdown during teardown
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Controller-mode arguments
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Path to the mysqlsh binary
    #[arg(long, env = "MYSQLSH_PATH", default_value = DEFAULT_MYSQLSH_PATH)]
    pub mysqlsh_path: PathBuf,

    /// DNS suffix of the Kubernetes cluster
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub cluster_domain: String,

    /// Only watch MysqlClusters in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Wall-clock budget for each node health probe, in seconds
    #[arg(long, env = "PROBE_BUDGET_SECS", default_value_t = DEFAULT_PROBE_BUDGET.as_secs())]
    pub probe_budget_secs: u64,

    /// Timeout for a single admin tool invocation, in seconds
    #[arg(long, env = "ADMIN_TIMEOUT_SECS", default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    pub admin_timeout_secs: u64,

    /// Bound on the graceful group shutdown during deletion, in seconds
    #[arg(long, env = "TEARDOWN_TIMEOUT_SECS", default_value_t = DEFAULT_TEARDOWN_TIMEOUT.as_secs())]
    pub teardown_timeout_secs: u64,
}

/// Resolved operator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Path to the mysqlsh binary
    pub mysqlsh_path: PathBuf,
    /// DNS suffix of the Kubernetes cluster
    pub cluster_domain: String,
    /// Namespace to watch, `None` for all
    pub watch_namespace: Option<String>,
    /// Per-node probe budget
    pub probe_budget: Duration,
    /// Per-invocation admin tool timeout
    pub admin_timeout: Duration,
    /// Bound on graceful shutdown during teardown
    pub teardown_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            mysqlsh_path: PathBuf::from(DEFAULT_MYSQLSH_PATH),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            watch_namespace: None,
            probe_budget: DEFAULT_PROBE_BUDGET,
            admin_timeout: DEFAULT_COMMAND_TIMEOUT,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

impl From<ControllerArgs> for OperatorConfig {
    fn from(args: ControllerArgs) -> Self {
        Self {
            mysqlsh_path: args.mysqlsh_path,
            cluster_domain: args.cluster_domain,
            watch_namespace: args.watch_namespace.filter(|ns| !ns.is_empty()),
            probe_budget: Duration::from_secs(args.probe_budget_secs),
            admin_timeout: Duration::from_secs(args.admin_timeout_secs),
            teardown_timeout: Duration::from_secs(args.teardown_timeout_secs),
        }
    }
}
