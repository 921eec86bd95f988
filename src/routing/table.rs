//! Immutable routing-table snapshots.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::error::ProxyError;

/// One denormalised row of the cluster's routing procedure output.
#[derive(Debug, Clone)]
pub struct RouteRow {
    pub db: String,
    pub ttl: i64,
    pub role: String,
    pub address: String,
}

/// A point-in-time snapshot of the cluster's routing table.
///
/// Snapshots are never mutated after construction; the monitor publishes a
/// fresh one per refresh. Every host in a reader or writer list is also in
/// `hosts`, and the default database is a key of both role maps.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub default_db: String,
    pub readers: HashMap<String, Vec<String>>,
    pub writers: HashMap<String, Vec<String>>,
    pub hosts: HashSet<String>,
    pub ttl: Duration,
    pub created_at: Instant,
}

impl RoutingTable {
    /// Builds a snapshot from the online database names (default first) and
    /// the routing rows. `ROUTE` addresses are discarded.
    pub fn from_rows(names: Vec<String>, rows: Vec<RouteRow>) -> Result<Self, ProxyError> {
        let default_db = names
            .first()
            .cloned()
            .ok_or_else(|| ProxyError::Routing("no online databases".into()))?;

        let mut readers: HashMap<String, Vec<String>> =
            names.iter().map(|n| (n.clone(), Vec::new())).collect();
        let mut writers = readers.clone();
        let mut hosts = HashSet::new();
        let mut ttl = None;

        for row in rows {
            if row.ttl <= 0 {
                return Err(ProxyError::Routing(format!(
                    "non-positive ttl {} for database {}",
                    row.ttl, row.db
                )));
            }
            ttl = Some(Duration::from_secs(row.ttl as u64));

            match row.role.as_str() {
                "READ" => {
                    readers.entry(row.db).or_default().push(row.address.clone());
                    hosts.insert(row.address);
                }
                "WRITE" => {
                    writers.entry(row.db).or_default().push(row.address.clone());
                    hosts.insert(row.address);
                }
                "ROUTE" => continue,
                other => {
                    return Err(ProxyError::Routing(format!("invalid role {other:?}")));
                }
            }
        }

        let ttl = ttl.ok_or_else(|| ProxyError::Routing("routing query returned no rows".into()))?;

        Ok(Self {
            default_db,
            readers,
            writers,
            hosts,
            ttl,
            created_at: Instant::now(),
        })
    }

    /// Hosts able to serve reads for `db`.
    pub fn readers_for(&self, db: &str) -> &[String] {
        self.readers.get(db).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hosts able to serve writes for `db`.
    pub fn writers_for(&self, db: &str) -> &[String] {
        self.writers.get(db).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the snapshot has outlived its server-declared TTL.
    pub fn expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

impl std::fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "default db {:?}, {} databases, {} hosts, ttl {:?}",
            self.default_db,
            self.readers.len(),
            self.hosts.len(),
            self.ttl,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(db: &str, role: &str, address: &str) -> RouteRow {
        RouteRow {
            db: db.into(),
            ttl: 300,
            role: role.into(),
            address: address.into(),
        }
    }

    fn names() -> Vec<String> {
        vec!["neo4j".into(), "system".into()]
    }

    #[test]
    fn hosts_is_union_of_roles() {
        let rt = RoutingTable::from_rows(
            names(),
            vec![
                row("neo4j", "WRITE", "w1:7687"),
                row("neo4j", "READ", "r1:7687"),
                row("neo4j", "READ", "r2:7687"),
                row("system", "WRITE", "w1:7687"),
            ],
        )
        .unwrap();

        let mut expected = HashSet::new();
        for list in rt.readers.values().chain(rt.writers.values()) {
            expected.extend(list.iter().cloned());
        }
        assert_eq!(rt.hosts, expected);
        assert_eq!(rt.hosts.len(), 3);
    }

    #[test]
    fn default_db_keyed_in_both_maps() {
        let rt = RoutingTable::from_rows(names(), vec![row("neo4j", "WRITE", "w1:7687")]).unwrap();
        assert_eq!(rt.default_db, "neo4j");
        assert!(rt.readers.contains_key("neo4j"));
        assert!(rt.writers.contains_key("neo4j"));
        // Databases without routing rows still appear, with empty lists.
        assert!(rt.readers.contains_key("system"));
        assert!(rt.readers_for("system").is_empty());
    }

    #[test]
    fn route_addresses_discarded() {
        let rt = RoutingTable::from_rows(
            names(),
            vec![
                row("neo4j", "WRITE", "w1:7687"),
                row("neo4j", "ROUTE", "router:7687"),
            ],
        )
        .unwrap();
        assert!(!rt.hosts.contains("router:7687"));
    }

    #[test]
    fn non_positive_ttl_rejected() {
        let mut bad = row("neo4j", "WRITE", "w1:7687");
        bad.ttl = 0;
        assert!(RoutingTable::from_rows(names(), vec![bad]).is_err());
    }

    #[test]
    fn unknown_role_rejected() {
        assert!(RoutingTable::from_rows(names(), vec![row("neo4j", "LEADER", "w1:7687")]).is_err());
    }

    #[test]
    fn empty_inputs_rejected() {
        assert!(RoutingTable::from_rows(vec![], vec![]).is_err());
        assert!(RoutingTable::from_rows(names(), vec![]).is_err());
    }

    #[test]
    fn expiry_follows_ttl() {
        let mut rt =
            RoutingTable::from_rows(names(), vec![row("neo4j", "WRITE", "w1:7687")]).unwrap();
        assert!(!rt.expired());

        rt.created_at = Instant::now() - Duration::from_secs(301);
        assert!(rt.expired());
    }
}
