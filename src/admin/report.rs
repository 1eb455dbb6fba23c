//! Decoding of group status reports into [`NodeView`]s

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::crd::{NodeRole, NodeView};
use crate::topology::ClusterTopology;
use crate::Error;

/// Applier delay above which a member is reported as lagged
pub const LAG_THRESHOLD: Duration = Duration::from_secs(1);

/// Lag value meaning the applier queue is drained
const LAG_APPLIED: &str = "applier_queue_applied";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    default_replica_set: ReplicaSetReport,
}

#[derive(Debug, Deserialize)]
struct ReplicaSetReport {
    #[serde(default)]
    primary: Option<String>,
    #[serde(default)]
    topology: BTreeMap<String, MemberReport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberReport {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    member_role: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    replication_lag: Option<serde_json::Value>,
}

/// Parse the tool's status output into views ordered by ordinal
///
/// Anything printed before the JSON document (shell warnings) is skipped.
/// Members whose address does not belong to `topology` are dropped.
pub fn parse_status(output: &str, topology: &ClusterTopology) -> Result<Vec<NodeView>, Error> {
    let start = output
        .find('{')
        .ok_or_else(|| Error::serialization_for_kind("StatusReport", "no JSON document in output"))?;
    let report = serde_json::Deserializer::from_str(&output[start..])
        .into_iter::<StatusReport>()
        .next()
        .ok_or_else(|| Error::serialization_for_kind("StatusReport", "empty status output"))?
        .map_err(|e| Error::serialization_for_kind("StatusReport", e.to_string()))?;

    let primary = report.default_replica_set.primary;
    let mut views: Vec<NodeView> = report
        .default_replica_set
        .topology
        .into_iter()
        .filter_map(|(key, member)| {
            let address = member.address.unwrap_or(key);
            let Some(ordinal) = topology.ordinal_of(&address) else {
                warn!(%address, cluster = topology.name(), "ignoring member outside this cluster");
                return None;
            };
            let role = match member.member_role.as_deref() {
                Some("PRIMARY") => NodeRole::Leader,
                Some("SECONDARY") => NodeRole::Secondary,
                _ if primary.as_deref() == Some(address.as_str()) => NodeRole::Leader,
                _ => NodeRole::Unknown,
            };
            Some(NodeView {
                ordinal,
                role,
                replicating: member.status.as_deref() == Some("ONLINE"),
                read_only: member.mode.as_deref() != Some("R/W"),
                lagged: member
                    .replication_lag
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .is_some_and(is_lagged),
                address,
            })
        })
        .collect();

    views.sort_by_key(|v| v.ordinal);
    views.dedup_by_key(|v| v.ordinal);
    Ok(views)
}

/// Whether a reported lag string exceeds [`LAG_THRESHOLD`]
fn is_lagged(lag: &str) -> bool {
    if lag == LAG_APPLIED {
        return false;
    }
    parse_lag(lag).is_some_and(|d| d > LAG_THRESHOLD)
}

/// Parse `HH:MM:SS[.ffffff]`
fn parse_lag(lag: &str) -> Option<Duration> {
    let mut parts = lag.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}
