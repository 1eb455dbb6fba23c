//! Typed interface to the external cluster-admin tool
//!
//! Group-replication bootstrap, join, rescan and removal are performed by an
//! external tool (MySQL Shell). The operator never builds ad hoc command lines
//! at call sites: every call names an [`AdminOperation`] and gets back one of
//! a closed set of [`Outcome`]s. Textual interpretation of the tool's output
//! happens in exactly one place, [`mysqlsh::classify`].

pub mod mysqlsh;
pub mod report;

use std::fmt;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::topology::NodeAddress;

pub use mysqlsh::MysqlShell;
pub use report::parse_status;

/// Account used by the admin tool
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account name (normally root)
    pub user: String,
    password: String,
}

impl Credentials {
    /// Create credentials for `user`
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Root account with the given password
    pub fn root(password: impl Into<String>) -> Self {
        Self::new("root", password)
    }

    /// The password, for handing to the tool over stdin
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Operations the admin tool can perform against a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminOperation {
    /// Authenticated round-trip to the server
    Ping,
    /// Group status report as seen from the target
    Status,
    /// Create a new group with the target as its first member
    CreateGroup {
        /// Group name
        name: String,
    },
    /// Add `instance` to the group the target belongs to
    AddInstance {
        /// `host:port` of the joining node
        instance: String,
    },
    /// Bring a known but offline member back into the group
    RejoinInstance {
        /// `host:port` of the returning node
        instance: String,
    },
    /// Remove `instance` from the group
    RemoveInstance {
        /// `host:port` of the departing node
        instance: String,
        /// Remove even if the instance cannot be contacted
        force: bool,
    },
    /// Align group metadata with the reachable members
    Rescan,
    /// Restart a group whose members are all stopped
    RebootGroup {
        /// Group name
        name: String,
    },
    /// Ordered shutdown of the whole group
    Dissolve,
}

impl AdminOperation {
    /// Short name for logs, events and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Status => "status",
            Self::CreateGroup { .. } => "create-group",
            Self::AddInstance { .. } => "add-instance",
            Self::RejoinInstance { .. } => "rejoin-instance",
            Self::RemoveInstance { .. } => "remove-instance",
            Self::Rescan => "rescan",
            Self::RebootGroup { .. } => "reboot-group",
            Self::Dissolve => "dissolve",
        }
    }
}

impl fmt::Display for AdminOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classified result of one admin tool invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The operation ran; carries the tool's standard output
    Success(String),
    /// The desired end state already held (e.g., already a member)
    AlreadyDone(String),
    /// The target does not belong to any group
    Absent(String),
    /// The call failed in a way a later retry can fix (unreachable, timeout)
    Transient(String),
    /// The tool gave a definitive failure (e.g., access denied)
    Fatal(String),
}

impl Outcome {
    /// Success or AlreadyDone
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Success(_) | Self::AlreadyDone(_))
    }

    /// Detail text carried by any variant
    pub fn detail(&self) -> &str {
        match self {
            Self::Success(s)
            | Self::AlreadyDone(s)
            | Self::Absent(s)
            | Self::Transient(s)
            | Self::Fatal(s) => s,
        }
    }
}

/// Capability to run admin operations against a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdminTool: Send + Sync {
    /// Run `operation` on `target` and classify the result
    ///
    /// Never returns an error: spawn failures and timeouts are folded into
    /// [`Outcome::Fatal`] and [`Outcome::Transient`].
    async fn invoke(
        &self,
        target: &NodeAddress,
        credentials: &Credentials,
        operation: &AdminOperation,
    ) -> Outcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::root("s3cret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("root"));
        assert!(!debug.contains("s3cret"));
        assert_eq!(creds.password(), "s3cret");
    }

    #[test]
    fn operation_names_are_kebab_case() {
        let ops = [
            AdminOperation::Ping,
            AdminOperation::Status,
            AdminOperation::CreateGroup {
                name: "g".to_string(),
            },
            AdminOperation::AddInstance {
                instance: "h:1".to_string(),
            },
            AdminOperation::RemoveInstance {
                instance: "h:1".to_string(),
                force: false,
            },
            AdminOperation::Rescan,
            AdminOperation::Dissolve,
        ];
        for op in ops {
            let name = op.to_string();
            assert!(!name.is_empty());
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '-'));
        }
    }

    #[test]
    fn done_outcomes() {
        assert!(Outcome::Success(String::new()).is_done());
        assert!(Outcome::AlreadyDone("member".to_string()).is_done());
        assert!(!Outcome::Absent(String::new()).is_done());
        assert!(!Outcome::Transient("timeout".to_string()).is_done());
        assert_eq!(Outcome::Fatal("denied".to_string()).detail(), "denied");
    }
}
