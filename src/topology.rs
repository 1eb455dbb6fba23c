//! Deterministic node addressing
//!
//! Every MySQL server is a StatefulSet pod behind a headless Service, so its
//! DNS name is a pure function of the cluster name, namespace and ordinal:
//! `<name>-<ordinal>.<name>.<namespace>.svc.<domain>`.

use std::fmt;
use std::ops::Range;

use crate::DEFAULT_CLUSTER_DOMAIN;

/// Port the MySQL classic protocol and the admin tool listen on
pub const MYSQL_PORT: u16 = 3306;

/// Port for the X protocol
pub const MYSQLX_PORT: u16 = 33060;

/// Port group replication uses for its own communication
pub const GROUP_REPLICATION_PORT: u16 = 33061;

/// Network address of one node in the pod group
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    /// Pod ordinal
    pub ordinal: u32,
    /// Stable DNS name
    pub host: String,
    /// MySQL port
    pub port: u16,
}

impl NodeAddress {
    /// `host:port` form used by the admin tool and the group metadata
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Address of `ordinal` in cluster `name` within `namespace`
pub fn node_address(name: &str, namespace: &str, domain: &str, ordinal: u32) -> NodeAddress {
    NodeAddress {
        ordinal,
        host: format!("{name}-{ordinal}.{name}.{namespace}.svc.{domain}"),
        port: MYSQL_PORT,
    }
}

/// Resolves ordinals to addresses (and back) for one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTopology {
    name: String,
    namespace: String,
    domain: String,
}

impl ClusterTopology {
    /// Create a resolver for cluster `name` in `namespace`
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
        }
    }

    /// Override the cluster DNS domain (default "cluster.local")
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Address of one ordinal
    pub fn node(&self, ordinal: u32) -> NodeAddress {
        node_address(&self.name, &self.namespace, &self.domain, ordinal)
    }

    /// Addresses of a range of ordinals, in increasing order
    pub fn nodes(&self, ordinals: Range<u32>) -> Vec<NodeAddress> {
        ordinals.map(|o| self.node(o)).collect()
    }

    /// Recover the ordinal from an address reported by the group
    ///
    /// Accepts the full DNS name, the short pod name, with or without a port.
    /// Addresses that belong to another cluster yield `None`.
    pub fn ordinal_of(&self, address: &str) -> Option<u32> {
        let host = match address.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => address,
        };
        let pod = host.split('.').next()?;
        let ordinal = pod.strip_prefix(self.name.as_str())?.strip_prefix('-')?;
        if ordinal.is_empty() || !ordinal.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        // Short pod names are unambiguous; qualified ones must name our service
        if let Some(rest) = host.strip_prefix(pod) {
            if !rest.is_empty() {
                let service = rest.trim_start_matches('.').split('.').next()?;
                if service != self.name {
                    return None;
                }
            }
        }
        ordinal.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_stable_dns_name() {
        let addr = node_address("orders", "db", "cluster.local", 2);
        assert_eq!(addr.host, "orders-2.orders.db.svc.cluster.local");
        assert_eq!(addr.port, MYSQL_PORT);
        assert_eq!(addr.endpoint(), "orders-2.orders.db.svc.cluster.local:3306");
        assert_eq!(addr.to_string(), addr.endpoint());
    }

    #[test]
    fn nodes_are_in_ordinal_order() {
        let topo = ClusterTopology::new("orders", "db");
        let nodes = topo.nodes(0..3);
        let ordinals: Vec<u32> = nodes.iter().map(|n| n.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert!(topo.nodes(3..3).is_empty());
    }

    #[test]
    fn custom_domain_is_used() {
        let topo = ClusterTopology::new("orders", "db").with_domain("corp.internal");
        assert_eq!(topo.node(0).host, "orders-0.orders.db.svc.corp.internal");
    }

    mod ordinal_parsing {
        use super::*;

        fn topo() -> ClusterTopology {
            ClusterTopology::new("orders", "db")
        }

        #[test]
        fn parses_what_it_generates() {
            let topo = topo();
            for ordinal in [0, 1, 7, 12] {
                assert_eq!(topo.ordinal_of(&topo.node(ordinal).endpoint()), Some(ordinal));
                assert_eq!(topo.ordinal_of(&topo.node(ordinal).host), Some(ordinal));
            }
        }

        #[test]
        fn accepts_short_pod_names() {
            assert_eq!(topo().ordinal_of("orders-4:3306"), Some(4));
            assert_eq!(topo().ordinal_of("orders-4"), Some(4));
        }

        #[test]
        fn rejects_other_clusters() {
            assert_eq!(topo().ordinal_of("orders-archive-1:3306"), None);
            assert_eq!(topo().ordinal_of("billing-1.billing.db.svc:3306"), None);
            assert_eq!(topo().ordinal_of("orders-1.other.db.svc:3306"), None);
        }

        #[test]
        fn rejects_malformed_addresses() {
            assert_eq!(topo().ordinal_of("orders"), None);
            assert_eq!(topo().ordinal_of("orders-:3306"), None);
            assert_eq!(topo().ordinal_of("orders-x1:3306"), None);
            assert_eq!(topo().ordinal_of(""), None);
        }

        #[test]
        fn hyphenated_cluster_names_work() {
            let topo = ClusterTopology::new("orders-eu", "db");
            assert_eq!(topo.ordinal_of(&topo.node(3).endpoint()), Some(3));
            assert_eq!(topo.ordinal_of("orders-1:3306"), None);
        }
    }
}
