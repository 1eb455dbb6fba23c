//! MySQL Shell implementation of [`AdminTool`]
//!
//! Each invocation spawns `mysqlsh` in JavaScript mode against one node, hands
//! the password over stdin and runs a single AdminAPI statement. Every call is
//! bounded by a timeout; a call that outlives it is reported as transient.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AdminOperation, AdminTool, Credentials, Outcome};
use crate::topology::NodeAddress;

/// Default location of the mysqlsh binary
pub const DEFAULT_MYSQLSH_PATH: &str = "/usr/bin/mysqlsh";

/// Default timeout for one admin tool call
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Output fragments meaning the credentials are wrong; checked before anything else
const ACCESS_DENIED: &[&str] = &["access denied", "error 1045"];

/// Output fragments meaning the target belongs to no group
const ABSENT: &[&str] = &[
    "standalone instance",
    "metadata schema not found",
    "metadata not found",
    "not part of any",
    "does not belong to a cluster",
    "not a member of an innodb cluster",
];

/// Output fragments meaning a retry can succeed
const TRANSIENT: &[&str] = &[
    "can't connect",
    "cannot connect",
    "connection refused",
    "lost connection",
    "timed out",
    "timeout",
    "unknown mysql server host",
    "no route to host",
    "temporarily unavailable",
    "error 2003",
    "error 2005",
    "error 2013",
    "is not reachable",
    "unreachable",
    "quorum",
    "recovering",
];

/// Runs admin operations through the `mysqlsh` binary
#[derive(Clone, Debug)]
pub struct MysqlShell {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for MysqlShell {
    fn default() -> Self {
        Self::new(DEFAULT_MYSQLSH_PATH, DEFAULT_COMMAND_TIMEOUT)
    }
}

impl MysqlShell {
    /// Create a shell runner using `binary`, bounding each call by `timeout`
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Command-line arguments for one invocation
    fn args(target: &NodeAddress, credentials: &Credentials, script: &str) -> Vec<String> {
        vec![
            "--uri".to_string(),
            format!("{}@{}", credentials.user, target.endpoint()),
            "--passwords-from-stdin".to_string(),
            "--js".to_string(),
            "--quiet-start=2".to_string(),
            "--execute".to_string(),
            script.to_string(),
        ]
    }
}

/// JavaScript literal for `value` (a JSON string is a valid JS string)
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// The AdminAPI statement that performs `operation`
pub fn script(operation: &AdminOperation, credentials: &Credentials) -> String {
    let uri = |instance: &str| js_string(&format!("{}@{}", credentials.user, instance));
    match operation {
        AdminOperation::Ping => "session.runSql('SELECT 1'); print('ok')".to_string(),
        AdminOperation::Status => "print(JSON.stringify(dba.getCluster().status()))".to_string(),
        AdminOperation::CreateGroup { name } => {
            format!("dba.createCluster({}); print('ok')", js_string(name))
        }
        AdminOperation::AddInstance { instance } => format!(
            "dba.getCluster().addInstance({}, {{recoveryMethod: 'clone'}}); print('ok')",
            uri(instance)
        ),
        AdminOperation::RejoinInstance { instance } => format!(
            "dba.getCluster().rejoinInstance({}); print('ok')",
            uri(instance)
        ),
        AdminOperation::RemoveInstance { instance, force } => format!(
            "dba.getCluster().removeInstance({}, {{force: {}}}); print('ok')",
            uri(instance),
            force
        ),
        AdminOperation::Rescan => {
            "dba.getCluster().rescan({addInstances: 'auto', removeInstances: 'auto'}); print('ok')"
                .to_string()
        }
        AdminOperation::RebootGroup { name } => format!(
            "dba.rebootClusterFromCompleteOutage({}); print('ok')",
            js_string(name)
        ),
        AdminOperation::Dissolve => "dba.getCluster().dissolve({force: true}); print('ok')".to_string(),
    }
}

/// Fragments that mean `operation` had already taken effect
fn already_done_markers(operation: &AdminOperation) -> &'static [&'static str] {
    match operation {
        AdminOperation::CreateGroup { .. } => &[
            "already belongs to an innodb cluster",
            "already in an innodb cluster",
            "already part of an innodb cluster",
        ],
        AdminOperation::AddInstance { .. } => &[
            "is already a member",
            "already part of this innodb cluster",
            "already belongs to",
        ],
        AdminOperation::RejoinInstance { .. } => &[
            "is already an active",
            "already a member",
            "is online",
        ],
        AdminOperation::RemoveInstance { .. } => &[
            "does not belong to the cluster",
            "is not a member",
            "not part of the cluster",
        ],
        AdminOperation::RebootGroup { .. } => &["is online", "already online"],
        _ => &[],
    }
}

/// Classify a finished invocation into an [`Outcome`]
///
/// The order matters: rejected credentials are fatal whatever else the output
/// says, per-operation "already" messages beat generic connection wording,
/// and unknown failures are fatal so they surface instead of looping.
pub fn classify(operation: &AdminOperation, succeeded: bool, stdout: &str, stderr: &str) -> Outcome {
    if succeeded {
        return Outcome::Success(stdout.trim().to_string());
    }

    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    let text = format!("{stdout}\n{stderr}").to_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if mentions(ACCESS_DENIED) {
        return Outcome::Fatal(detail);
    }
    // Metadata left over from a stopped group must be rebooted, not recreated
    if matches!(operation, AdminOperation::CreateGroup { .. })
        && text.contains("rebootclusterfromcompleteoutage")
    {
        return Outcome::Fatal(detail);
    }
    if mentions(already_done_markers(operation)) {
        return Outcome::AlreadyDone(detail);
    }
    if mentions(ABSENT) {
        return Outcome::Absent(detail);
    }
    if mentions(TRANSIENT) {
        return Outcome::Transient(detail);
    }
    Outcome::Fatal(detail)
}

#[async_trait]
impl AdminTool for MysqlShell {
    async fn invoke(
        &self,
        target: &NodeAddress,
        credentials: &Credentials,
        operation: &AdminOperation,
    ) -> Outcome {
        let script = script(operation, credentials);
        debug!(target = %target, operation = %operation, "invoking mysqlsh");

        let mut cmd = Command::new(&self.binary);
        cmd.args(Self::args(target, credentials, &script))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(binary = %self.binary.display(), error = %e, "mysqlsh spawn failed");
                return Outcome::Fatal(format!(
                    "failed to execute {}: {}",
                    self.binary.display(),
                    e
                ));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let password = format!("{}\n", credentials.password());
            if let Err(e) = stdin.write_all(password.as_bytes()).await {
                return Outcome::Transient(format!("failed to pass credentials: {}", e));
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Outcome::Transient(format!("failed to wait for mysqlsh: {}", e)),
            Err(_) => {
                warn!(target = %target, operation = %operation, timeout = ?self.timeout, "mysqlsh timed out");
                return Outcome::Transient(format!("timed out after {:?}", self.timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let outcome = classify(operation, output.status.success(), &stdout, &stderr);
        debug!(target = %target, operation = %operation, ?outcome, "mysqlsh finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::node_address;

    fn add(instance: &str) -> AdminOperation {
        AdminOperation::AddInstance {
            instance: instance.to_string(),
        }
    }

    fn create() -> AdminOperation {
        AdminOperation::CreateGroup {
            name: "orders".to_string(),
        }
    }

    mod scripts {
        use super::*;

        #[test]
        fn arguments_never_contain_the_password() {
            let target = node_address("orders", "db", "cluster.local", 0);
            let creds = Credentials::root("hunter2");
            let args = MysqlShell::args(&target, &creds, &script(&create(), &creds));
            assert!(args.iter().all(|a| !a.contains("hunter2")));
            assert!(args.contains(&"--passwords-from-stdin".to_string()));
            assert!(args.contains(&"root@orders-0.orders.db.svc.cluster.local:3306".to_string()));
        }

        #[test]
        fn arguments_are_quoted_as_js_strings() {
            let creds = Credentials::root("pw");
            let s = script(&add("orders-1.orders.db.svc.cluster.local:3306"), &creds);
            assert!(s.contains(r#"addInstance("root@orders-1.orders.db.svc.cluster.local:3306""#));

            let s = script(
                &AdminOperation::CreateGroup {
                    name: "it's".to_string(),
                },
                &creds,
            );
            assert!(s.contains(r#"createCluster("it's")"#));
        }

        #[test]
        fn remove_carries_force_flag() {
            let creds = Credentials::root("pw");
            let op = AdminOperation::RemoveInstance {
                instance: "orders-3:3306".to_string(),
                force: true,
            };
            assert!(script(&op, &creds).contains("{force: true}"));
        }
    }

    mod classification {
        use super::*;

        #[test]
        fn zero_exit_is_success_with_stdout() {
            let outcome = classify(&AdminOperation::Status, true, "  {\"a\":1}\n", "warning");
            assert_eq!(outcome, Outcome::Success("{\"a\":1}".to_string()));
        }

        #[test]
        fn access_denied_is_fatal_even_when_connection_words_appear() {
            let outcome = classify(
                &add("h:3306"),
                false,
                "",
                "MySQL Error 1045 (28000): Access denied for user 'root' (Can't connect)",
            );
            assert!(matches!(outcome, Outcome::Fatal(_)));
        }

        #[test]
        fn existing_group_makes_create_already_done() {
            let outcome = classify(
                &create(),
                false,
                "",
                "Dba.createCluster: The MySQL instance 'orders-0:3306' already belongs to an InnoDB Cluster",
            );
            assert!(matches!(outcome, Outcome::AlreadyDone(_)));
        }

        #[test]
        fn leftover_metadata_makes_create_fatal() {
            let outcome = classify(
                &create(),
                false,
                "",
                "Dba.createCluster: Unable to create cluster. The instance has a populated Metadata schema and belongs to that Metadata. Use dba.rebootClusterFromCompleteOutage() to reboot the cluster",
            );
            assert!(matches!(outcome, Outcome::Fatal(_)));
        }

        #[test]
        fn existing_member_makes_add_already_done() {
            let outcome = classify(
                &add("orders-1:3306"),
                false,
                "",
                "Cluster.addInstance: The instance 'orders-1:3306' is already a member of this cluster.",
            );
            assert!(matches!(outcome, Outcome::AlreadyDone(_)));
        }

        #[test]
        fn missing_member_makes_remove_already_done() {
            let op = AdminOperation::RemoveInstance {
                instance: "orders-3:3306".to_string(),
                force: false,
            };
            let outcome = classify(
                &op,
                false,
                "",
                "Cluster.removeInstance: The instance 'orders-3:3306' does not belong to the cluster.",
            );
            assert!(matches!(outcome, Outcome::AlreadyDone(_)));
        }

        #[test]
        fn standalone_status_is_absent() {
            let outcome = classify(
                &AdminOperation::Status,
                false,
                "",
                "Dba.getCluster: This function is not available through a session to a standalone instance (MYSQLSH 51300)",
            );
            assert!(matches!(outcome, Outcome::Absent(_)));
        }

        #[test]
        fn connection_failures_are_transient() {
            for stderr in [
                "MySQL Error 2003 (HY000): Can't connect to MySQL server on 'orders-1:3306' (111)",
                "MySQL Error 2005: Unknown MySQL server host 'orders-1.orders.db.svc'",
                "Lost connection to MySQL server during query",
            ] {
                let outcome = classify(&add("orders-1:3306"), false, "", stderr);
                assert!(matches!(outcome, Outcome::Transient(_)), "{stderr}");
            }
        }

        #[test]
        fn unknown_failures_are_fatal() {
            let outcome = classify(&AdminOperation::Rescan, false, "", "SyntaxError: unexpected");
            assert_eq!(outcome, Outcome::Fatal("SyntaxError: unexpected".to_string()));
        }

        #[test]
        fn stdout_used_as_detail_when_stderr_empty() {
            let outcome = classify(&AdminOperation::Rescan, false, "boom", "");
            assert_eq!(outcome.detail(), "boom");
        }
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let shell = MysqlShell::new("/nonexistent/mysqlsh", Duration::from_secs(1));
        let target = node_address("orders", "db", "cluster.local", 0);
        let outcome = shell
            .invoke(&target, &Credentials::root("pw"), &AdminOperation::Ping)
            .await;
        assert!(matches!(outcome, Outcome::Fatal(ref m) if m.contains("failed to execute")));
    }
}
