//! Backend cluster access: configuration, routing-table lookups and
//! fan-out authentication.

pub mod tls;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::client::{wire, Credentials};
use crate::conn::Conn;
use crate::error::ProxyError;
use crate::message::{inspect, sig, Message, MessageType};
use crate::routing::{Monitor, RoutingTable};
use crate::version::{backend_proposals, BOLT_MAGIC, CHOSEN_VERSION};

/// How long a consumer will wait for a fresh snapshot once the published one
/// has expired before declaring the routing subsystem dead.
const STALE_TABLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Parsed cluster-side configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub user: String,
    pub password: String,
    pub scheme: String,
    pub host: String,
    pub resolve: Vec<String>,
}

impl ClusterConfig {
    /// Parses the cluster entry point (`host:port` or `scheme://host:port`)
    /// and validates the static resolver list.
    pub fn parse(
        uri: &str,
        user: &str,
        password: &str,
        resolve: Vec<String>,
    ) -> Result<Self, ProxyError> {
        let (scheme, host) = match uri.split_once("://") {
            Some((scheme, host)) => (scheme.to_string(), host.to_string()),
            None => ("bolt".to_string(), uri.to_string()),
        };

        for entry in &resolve {
            if entry.chars().filter(|c| *c == ':').count() != 1 {
                return Err(ProxyError::Routing(format!(
                    "invalid resolver host {entry:?}, expected host:port"
                )));
            }
        }

        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
            scheme,
            host,
            resolve,
        })
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            principal: self.user.clone(),
            credentials: self.password.clone(),
        }
    }
}

/// The proxy's view of the cluster: the routing monitor plus everything
/// needed to open authenticated backend connections.
pub struct Backend {
    monitor: Monitor,
    table: Mutex<watch::Receiver<Arc<RoutingTable>>>,
    tls: Option<TlsConnector>,
}

impl Backend {
    /// Starts the routing monitor (which connects and fetches the first
    /// snapshot before returning) and prepares the TLS connector the URI
    /// scheme calls for.
    pub async fn new(config: ClusterConfig) -> Result<Self, ProxyError> {
        let tls = tls::requires_tls(&config.scheme)
            .then(|| tls::connector(tls::trust_any_cert(&config.scheme)));

        let targets = if config.resolve.is_empty() {
            vec![config.host.clone()]
        } else {
            config.resolve.clone()
        };

        let monitor = Monitor::start(config.credentials(), targets, tls.clone()).await?;
        let table = Mutex::new(monitor.subscribe());

        Ok(Self {
            monitor,
            table,
            tls,
        })
    }

    /// The latest routing-table snapshot, waiting for a refresh when the
    /// published one has expired. An expired table that stays expired past
    /// the grace period means the monitor is dead, which is fatal.
    pub async fn routing_table(&self) -> Result<Arc<RoutingTable>, ProxyError> {
        let mut rx = self.table.lock().await;

        let table = rx.borrow().clone();
        if !table.expired() {
            return Ok(table);
        }

        tracing::debug!("routing table expired, waiting for refresh");
        match timeout(STALE_TABLE_TIMEOUT, rx.changed()).await {
            Ok(Ok(())) => Ok(rx.borrow().clone()),
            Ok(Err(_)) => Err(ProxyError::Routing("monitor stopped".into())),
            Err(_) => {
                tracing::error!("timeout waiting for new routing table");
                std::process::exit(1);
            }
        }
    }

    /// Authenticates a client's HELLO against the cluster (see
    /// [`authenticate_pool`]).
    pub async fn authenticate(
        &self,
        hello: &Message,
    ) -> Result<HashMap<String, Conn>, ProxyError> {
        let table = self.routing_table().await?;
        authenticate_pool(&table, self.tls.as_ref(), hello).await
    }

    /// Stops the routing monitor.
    pub fn shutdown(&self) {
        self.monitor.stop();
    }
}

/// Authenticates to every host in the routing table by replaying the
/// client's HELLO bytes.
///
/// The first writer of the default database is probed serially first so a
/// bad credential is exposed to exactly one node. Only on probe success does
/// the HELLO fan out to the remaining hosts concurrently; per-host fan-out
/// failures are logged and the host is omitted from the returned map.
pub async fn authenticate_pool(
    table: &RoutingTable,
    tls: Option<&TlsConnector>,
    hello: &Message,
) -> Result<HashMap<String, Conn>, ProxyError> {
    if hello.kind != MessageType::Hello {
        return Err(ProxyError::BadHello(format!(
            "authenticate requires a HELLO, got {}",
            hello.kind
        )));
    }
    let principal = inspect::principal(&hello.data)?;

    let probe_host = table
        .writers_for(&table.default_db)
        .first()
        .cloned()
        .ok_or_else(|| {
            ProxyError::Routing(format!("no writer for default db {:?}", table.default_db))
        })?;

    tracing::debug!(%principal, host = %probe_host, "probing credentials");
    let probe_conn = auth_host(&probe_host, tls, &hello.data)
        .await
        .map_err(|e| ProxyError::AuthProbeFailed(format!("{probe_host}: {e}")))?;

    let mut conns = HashMap::with_capacity(table.hosts.len());
    conns.insert(probe_host.clone(), probe_conn);

    let fan_out = table
        .hosts
        .iter()
        .filter(|host| **host != probe_host)
        .map(|host| async move { (host.clone(), auth_host(host, tls, &hello.data).await) });

    for (host, result) in futures::future::join_all(fan_out).await {
        match result {
            Ok(conn) => {
                conns.insert(host, conn);
            }
            Err(e) => {
                tracing::warn!(%principal, %host, error = %e, "fan-out authentication failed");
            }
        }
    }

    tracing::info!(%principal, hosts = conns.len(), "authenticated to cluster");
    Ok(conns)
}

/// Opens one backend connection: dial (TLS per scheme), replay the pinned
/// handshake, forward the HELLO bytes verbatim, require SUCCESS.
async fn auth_host(
    host: &str,
    tls: Option<&TlsConnector>,
    hello_raw: &[u8],
) -> Result<Conn, ProxyError> {
    let stream = TcpStream::connect(host).await?;
    match tls {
        Some(connector) => {
            let stream = connector.connect(tls::server_name(host)?, stream).await?;
            bolt_auth(stream, hello_raw).await
        }
        None => bolt_auth(stream, hello_raw).await,
    }
}

async fn bolt_auth<S>(mut stream: S, hello_raw: &[u8]) -> Result<Conn, ProxyError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    stream.write_all(&BOLT_MAGIC).await?;
    stream.write_all(&backend_proposals()).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply != CHOSEN_VERSION {
        return Err(ProxyError::Protocol(format!(
            "backend negotiated unexpected version {reply:02X?}"
        )));
    }

    stream.write_all(hello_raw).await?;
    stream.flush().await?;

    // The backend's own SUCCESS is consumed here; the session sends its
    // synthetic one to the client instead.
    let payload = wire::read_payload(&mut stream).await?;
    match payload.get(1) {
        Some(&sig::SUCCESS) => Ok(Conn::direct(stream)),
        Some(&sig::FAILURE) => Err(ProxyError::Authentication("backend rejected HELLO".into())),
        _ => Err(ProxyError::Protocol(
            "unexpected reply to backend HELLO".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn hello_message() -> Message {
        let mut payload = vec![0xB1, 0x01, 0xA2];
        payload.push(0x89);
        payload.extend_from_slice(b"principal");
        payload.push(0x85);
        payload.extend_from_slice(b"neo4j");
        payload.push(0x8B);
        payload.extend_from_slice(b"credentials");
        payload.push(0x84);
        payload.extend_from_slice(b"pass");

        let mut frame = BytesMut::new();
        frame.put_u16(payload.len() as u16);
        frame.put_slice(&payload);
        frame.put_slice(&[0x00, 0x00]);
        Message::new(Bytes::from(frame.to_vec()))
    }

    /// A stub backend that accepts or rejects the replayed HELLO, counting
    /// how many times it was asked.
    async fn spawn_backend_stub(accept: bool) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hellos = Arc::new(AtomicUsize::new(0));
        let counter = hellos.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut handshake = [0u8; 20];
                    if stream.read_exact(&mut handshake).await.is_err() {
                        return;
                    }
                    stream.write_all(&CHOSEN_VERSION).await.unwrap();

                    if wire::read_payload(&mut stream).await.is_err() {
                        return;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);

                    let reply: &[u8] = if accept {
                        &[0x00, 0x03, 0xB1, 0x70, 0xA0, 0x00, 0x00]
                    } else {
                        &[0x00, 0x03, 0xB1, 0x7F, 0xA0, 0x00, 0x00]
                    };
                    stream.write_all(reply).await.unwrap();

                    // Hold the connection open like a real server would.
                    let mut sink = [0u8; 64];
                    while stream.read(&mut sink).await.unwrap_or(0) > 0 {}
                });
            }
        });

        (addr, hellos)
    }

    fn table_for(writer: &str, readers: &[&str]) -> RoutingTable {
        let mut hosts: HashSet<String> = readers.iter().map(|s| s.to_string()).collect();
        hosts.insert(writer.to_string());
        RoutingTable {
            default_db: "neo4j".into(),
            readers: HashMap::from([(
                "neo4j".to_string(),
                readers.iter().map(|s| s.to_string()).collect(),
            )]),
            writers: HashMap::from([("neo4j".to_string(), vec![writer.to_string()])]),
            hosts,
            ttl: Duration::from_secs(300),
            created_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn probe_failure_stops_before_fan_out() {
        let (writer, writer_hellos) = spawn_backend_stub(false).await;
        let (r1, r1_hellos) = spawn_backend_stub(true).await;
        let (r2, r2_hellos) = spawn_backend_stub(true).await;

        let table = table_for(&writer, &[&r1, &r2]);
        let result = authenticate_pool(&table, None, &hello_message()).await;

        assert!(matches!(result, Err(ProxyError::AuthProbeFailed(_))));
        assert_eq!(writer_hellos.load(Ordering::SeqCst), 1);
        assert_eq!(r1_hellos.load(Ordering::SeqCst), 0);
        assert_eq!(r2_hellos.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn partial_fan_out_omits_failed_host() {
        let (writer, _) = spawn_backend_stub(true).await;
        let (good, _) = spawn_backend_stub(true).await;
        let (bad, _) = spawn_backend_stub(false).await;

        let table = table_for(&writer, &[&good, &bad]);
        let conns = authenticate_pool(&table, None, &hello_message())
            .await
            .unwrap();

        assert_eq!(conns.len(), 2);
        assert!(conns.contains_key(&writer));
        assert!(conns.contains_key(&good));
        assert!(!conns.contains_key(&bad));
    }

    #[tokio::test]
    async fn non_hello_message_rejected() {
        let table = table_for("w:1", &[]);
        let reset = Message::new(Bytes::from_static(&[
            0x00, 0x03, 0xB1, 0x0F, 0xA0, 0x00, 0x00,
        ]));
        assert!(matches!(
            authenticate_pool(&table, None, &reset).await,
            Err(ProxyError::BadHello(_))
        ));
    }

    #[test]
    fn cluster_config_schemes() {
        let plain = ClusterConfig::parse("alpine:7687", "neo4j", "", vec![]).unwrap();
        assert_eq!(plain.scheme, "bolt");
        assert_eq!(plain.host, "alpine:7687");

        let tls = ClusterConfig::parse("neo4j+s://db.example.com:7687", "neo4j", "", vec![])
            .unwrap();
        assert_eq!(tls.scheme, "neo4j+s");
        assert_eq!(tls.host, "db.example.com:7687");
    }

    #[test]
    fn cluster_config_rejects_malformed_resolver_entry() {
        assert!(
            ClusterConfig::parse("alpine:7687", "neo4j", "", vec!["nodeport".into()]).is_err()
        );
        assert!(ClusterConfig::parse(
            "alpine:7687",
            "neo4j",
            "",
            vec!["node:7687:extra".into()]
        )
        .is_err());
    }
}
