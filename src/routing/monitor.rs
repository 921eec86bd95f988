//! Background routing-table monitor.
//!
//! Owns the single driver connection to the cluster. Publishes fresh
//! snapshots through a last-value register (`tokio::sync::watch`): slow
//! consumers always observe the latest snapshot and never an older one, and
//! dropped intermediates are intentional — a routing table is only ever made
//! less stale by a refresh. Consumers must still re-check `expired()` after
//! reading.
//!
//! Routing is load-bearing for every session, so refresh failures are not
//! survivable: a failed query round or a silent 5×TTL window terminates the
//! process and lets the supervisor restart from a clean state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;

use super::table::{RouteRow, RoutingTable};
use crate::client::{Credentials, QueryConnection};
use crate::error::ProxyError;
use crate::packstream::Value;

/// Dump the list of databases with the first result being the default db.
const SHOW_DATABASES: &str = "\
SHOW DATABASES YIELD name, default, currentStatus WHERE currentStatus = 'online' \
RETURN name, default, currentStatus ORDER BY default DESC";

/// Denormalize the routing table.
const ROUTING_QUERY: &str = "\
UNWIND $names AS name \
CALL dbms.routing.getRoutingTable({}, name) \
  YIELD ttl, servers \
WITH name, ttl, servers \
UNWIND servers AS server \
WITH name, ttl, server \
UNWIND server[\"addresses\"] AS address \
RETURN name, ttl, server[\"role\"] AS role, address";

/// Watchdog multiple: a refresh must land within this many TTLs.
const WATCHDOG_TTLS: u32 = 5;

/// Keeps tabs on the cluster routing table behind the scenes, re-timing
/// itself to the server's declared TTL.
pub struct Monitor {
    halt: mpsc::Sender<()>,
    rx: watch::Receiver<Arc<RoutingTable>>,
}

impl Monitor {
    /// Connects to the cluster, fetches the first snapshot synchronously
    /// (construction fails if it cannot) and spawns the refresh task.
    ///
    /// `targets` is the static resolver list; when empty the cluster address
    /// is used as given.
    pub async fn start(
        auth: Credentials,
        targets: Vec<String>,
        tls: Option<TlsConnector>,
    ) -> Result<Monitor, ProxyError> {
        let mut conn = connect_any(&targets, tls.as_ref(), &auth).await?;

        let table = Arc::new(fetch_routing_table(&mut conn).await?);
        tracing::info!(table = %table, "initial routing table");

        let (tx, rx) = watch::channel(table.clone());
        let (halt_tx, halt_rx) = mpsc::channel(1);

        tokio::spawn(refresh_loop(conn, table.ttl, tx, halt_rx));

        Ok(Monitor { halt: halt_tx, rx })
    }

    /// A receiver over the published snapshots. `borrow()` yields the most
    /// recent one.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RoutingTable>> {
        self.rx.clone()
    }

    /// Signals the refresh task to stop. Best-effort and non-blocking;
    /// repeated calls are harmless.
    pub fn stop(&self) {
        let _ = self.halt.try_send(());
    }
}

async fn refresh_loop(
    mut conn: QueryConnection,
    mut ttl: Duration,
    tx: watch::Sender<Arc<RoutingTable>>,
    mut halt: mpsc::Receiver<()>,
) {
    let mut watchdog = Box::pin(sleep(ttl * WATCHDOG_TTLS));

    loop {
        let tick = sleep(ttl);
        tokio::pin!(tick);

        tokio::select! {
            () = &mut tick => {
                let table = match timeout(ttl * WATCHDOG_TTLS, fetch_routing_table(&mut conn)).await {
                    Err(_) => {
                        tracing::error!(
                            "no routing table refresh within {WATCHDOG_TTLS} x {ttl:?}"
                        );
                        std::process::exit(1);
                    }
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "routing table refresh failed");
                        std::process::exit(1);
                    }
                    Ok(Ok(table)) => Arc::new(table),
                };

                ttl = table.ttl;
                watchdog = Box::pin(sleep(ttl * WATCHDOG_TTLS));
                tracing::debug!(table = %table, "updated routing table");

                if tx.send(table).is_err() {
                    // Every subscriber is gone while the loop still runs.
                    panic!("monitor output channel closed");
                }
            }
            _ = halt.recv() => {
                tracing::info!("monitor stopped");
                return;
            }
            () = &mut watchdog => {
                tracing::error!("monitor watchdog: no refresh within {WATCHDOG_TTLS} x {ttl:?}");
                std::process::exit(1);
            }
        }
    }
}

/// Dials the resolver targets in order, returning the first connection that
/// authenticates.
async fn connect_any(
    targets: &[String],
    tls: Option<&TlsConnector>,
    auth: &Credentials,
) -> Result<QueryConnection, ProxyError> {
    let mut last_err = ProxyError::Routing("no cluster address to connect to".into());
    for target in targets {
        match QueryConnection::connect(target, tls, auth).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                tracing::warn!(%target, error = %e, "cluster connection failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Runs both cluster queries and assembles a fresh snapshot.
pub(crate) async fn fetch_routing_table(
    conn: &mut QueryConnection,
) -> Result<RoutingTable, ProxyError> {
    let names = query_db_names(conn).await?;
    let rows = query_routing_rows(conn, &names).await?;
    RoutingTable::from_rows(names, rows)
}

/// The current online databases, default first.
async fn query_db_names(conn: &mut QueryConnection) -> Result<Vec<String>, ProxyError> {
    let extra = HashMap::from([("db".to_string(), Value::String("system".into()))]);
    conn.run(SHOW_DATABASES, HashMap::new(), extra).await?;
    let (records, _) = conn.pull_all().await?;

    let mut names = Vec::with_capacity(records.len());
    for row in records {
        match row.first() {
            Some(Value::String(name)) => names.push(name.clone()),
            _ => {
                return Err(ProxyError::Routing(
                    "couldn't find name field in result".into(),
                ));
            }
        }
    }
    Ok(names)
}

/// Per-database `(name, ttl, role, address)` rows from the routing
/// procedure.
async fn query_routing_rows(
    conn: &mut QueryConnection,
    names: &[String],
) -> Result<Vec<RouteRow>, ProxyError> {
    let params = HashMap::from([(
        "names".to_string(),
        Value::List(names.iter().cloned().map(Value::String).collect()),
    )]);
    conn.run(ROUTING_QUERY, params, HashMap::new()).await?;
    let (records, _) = conn.pull_all().await?;

    let mut rows = Vec::with_capacity(records.len());
    for row in records {
        let field = |i: usize, what: &str| {
            row.get(i)
                .ok_or_else(|| ProxyError::Routing(format!("missing {what} field in result")))
        };
        let string = |i: usize, what: &str| -> Result<String, ProxyError> {
            field(i, what)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ProxyError::Routing(format!("{what} isn't a string")))
        };

        rows.push(RouteRow {
            db: string(0, "name")?,
            ttl: field(1, "ttl")?
                .as_int()
                .ok_or_else(|| ProxyError::Routing("ttl isn't an integer".into()))?,
            role: string(2, "role")?,
            address: string(3, "address")?,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::wire;
    use crate::message::sig;
    use crate::packstream::encode;
    use crate::version::CHOSEN_VERSION;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn send_reply(stream: &mut TcpStream, signature: u8, fields: &[Value]) {
        let mut buf = BytesMut::new();
        encode::encode_struct_header(&mut buf, signature, fields.len());
        for f in fields {
            encode::encode_value(&mut buf, f);
        }
        wire::write_payload(stream, &buf).await.unwrap();
    }

    fn str_val(s: &str) -> Value {
        Value::String(s.into())
    }

    fn route_record(db: &str, role: &str, addr: &str) -> Value {
        Value::List(vec![str_val(db), Value::Int(300), str_val(role), str_val(addr)])
    }

    /// A loopback stub that answers the handshake, HELLO, and the two
    /// monitor queries with canned results.
    async fn spawn_cluster_stub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut handshake = [0u8; 20];
            stream.read_exact(&mut handshake).await.unwrap();
            stream.write_all(&CHOSEN_VERSION).await.unwrap();

            let mut runs = 0;
            loop {
                let payload = match wire::read_payload(&mut stream).await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let signature = payload[1];

                match signature {
                    sig::HELLO => {
                        send_reply(&mut stream, sig::SUCCESS, &[Value::Map(HashMap::new())]).await;
                    }
                    sig::RUN => {
                        runs += 1;
                        send_reply(&mut stream, sig::SUCCESS, &[Value::Map(HashMap::new())]).await;
                    }
                    sig::PULL => {
                        let records: Vec<Value> = if runs == 1 {
                            vec![
                                Value::List(vec![
                                    str_val("neo4j"),
                                    Value::Bool(true),
                                    str_val("online"),
                                ]),
                                Value::List(vec![
                                    str_val("system"),
                                    Value::Bool(false),
                                    str_val("online"),
                                ]),
                            ]
                        } else {
                            vec![
                                route_record("neo4j", "WRITE", "w1:7687"),
                                route_record("neo4j", "READ", "r1:7687"),
                                route_record("neo4j", "ROUTE", "router:7687"),
                                route_record("system", "WRITE", "w1:7687"),
                                route_record("system", "READ", "r1:7687"),
                            ]
                        };
                        for record in records {
                            send_reply(&mut stream, sig::RECORD, &[record]).await;
                        }
                        send_reply(&mut stream, sig::SUCCESS, &[Value::Map(HashMap::new())]).await;
                    }
                    _ => return,
                }
            }
        });

        addr
    }

    fn auth() -> Credentials {
        Credentials {
            principal: "neo4j".into(),
            credentials: "password".into(),
        }
    }

    #[tokio::test]
    async fn fetch_assembles_snapshot_from_cluster_queries() {
        let addr = spawn_cluster_stub().await;
        let mut conn = QueryConnection::connect(&addr, None, &auth()).await.unwrap();

        let table = fetch_routing_table(&mut conn).await.unwrap();
        assert_eq!(table.default_db, "neo4j");
        assert_eq!(table.writers_for("neo4j"), ["w1:7687".to_string()]);
        assert_eq!(table.readers_for("neo4j"), ["r1:7687".to_string()]);
        assert_eq!(table.ttl, Duration::from_secs(300));
        assert_eq!(table.hosts.len(), 2);
        assert!(!table.hosts.contains("router:7687"));
    }

    #[tokio::test]
    async fn monitor_publishes_first_snapshot() {
        let addr = spawn_cluster_stub().await;
        let monitor = Monitor::start(auth(), vec![addr], None).await.unwrap();

        let rx = monitor.subscribe();
        let table = rx.borrow().clone();
        assert_eq!(table.default_db, "neo4j");
        assert!(!table.expired());

        monitor.stop();
    }

    #[tokio::test]
    async fn connect_any_skips_dead_targets() {
        let addr = spawn_cluster_stub().await;
        // First target refuses; second serves.
        let targets = vec!["127.0.0.1:1".to_string(), addr];
        assert!(connect_any(&targets, None, &auth()).await.is_ok());
    }
}
