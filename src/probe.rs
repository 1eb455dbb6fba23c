//! Node health probing
//!
//! A probe answers one question, "can the admin tool talk to this node right
//! now?", within a wall-clock budget. It never fails with an error; callers
//! get [`ProbeResult::Unready`] and decide what that means for their step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::admin::{AdminOperation, AdminTool, Credentials, Outcome};
use crate::retry::{retry_within, RetryConfig};
use crate::topology::NodeAddress;

/// Default time a single probe may spend retrying
pub const DEFAULT_PROBE_BUDGET: Duration = Duration::from_secs(60);

/// Bound on one TCP connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of probing one node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    /// The node accepted an authenticated round-trip
    Ready,
    /// The budget ran out before the node answered
    Unready,
}

/// Bounded readiness check against one node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeProber: Send + Sync {
    /// Probe `node`, retrying with backoff until `budget` is spent
    async fn probe(
        &self,
        node: &NodeAddress,
        credentials: &Credentials,
        budget: Duration,
    ) -> ProbeResult;
}

/// Probes with a TCP connect followed by an admin-tool ping
pub struct AdminProber {
    tool: Arc<dyn AdminTool>,
    backoff: RetryConfig,
    tcp_precheck: bool,
}

impl AdminProber {
    /// Create a prober that pings through `tool`
    pub fn new(tool: Arc<dyn AdminTool>) -> Self {
        Self {
            tool,
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(8),
                backoff_multiplier: 2.0,
            },
            tcp_precheck: true,
        }
    }

    /// Override the backoff curve between attempts
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Skip the TCP connect and go straight to the ping
    pub fn without_tcp_precheck(mut self) -> Self {
        self.tcp_precheck = false;
        self
    }

    async fn attempt(&self, node: &NodeAddress, credentials: &Credentials) -> Result<(), String> {
        if self.tcp_precheck {
            tokio::time::timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((node.host.as_str(), node.port)),
            )
            .await
            .map_err(|_| format!("connect timed out after {:?}", CONNECT_TIMEOUT))?
            .map_err(|e| format!("connect failed: {}", e))?;
        }

        match self
            .tool
            .invoke(node, credentials, &AdminOperation::Ping)
            .await
        {
            Outcome::Success(_) | Outcome::AlreadyDone(_) => Ok(()),
            other => Err(other.detail().to_string()),
        }
    }
}

#[async_trait]
impl NodeProber for AdminProber {
    async fn probe(
        &self,
        node: &NodeAddress,
        credentials: &Credentials,
        budget: Duration,
    ) -> ProbeResult {
        let operation = format!("probe {}", node);
        match retry_within(&self.backoff, budget, &operation, || {
            self.attempt(node, credentials)
        })
        .await
        {
            Ok(()) => {
                debug!(node = %node, "node ready");
                ProbeResult::Ready
            }
            Err(last_error) => {
                warn!(node = %node, budget = ?budget, error = %last_error, "node not ready within budget");
                ProbeResult::Unready
            }
        }
    }
}
