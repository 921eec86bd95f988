//! Per-client session pipeline: sniff, handshake, authenticate, then a
//! transaction loop that splices the chosen backend to the client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::backend::Backend;
use crate::conn::{Conn, MessageReader, MessageWriter};
use crate::error::ProxyError;
use crate::message::{inspect, AccessMode, Message, MessageType};
use crate::routing::RoutingTable;
use crate::version::{validate_handshake, validate_magic, BOLT_MAGIC, CHOSEN_VERSION, HTTP_GET};

/// A session with no client activity for this long is torn down.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Entry point for one accepted client; never propagates errors past the
/// session boundary.
pub async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, backend: Arc<Backend>) {
    tracing::debug!(%peer_addr, "client connected");
    match run_session(stream, peer_addr, backend).await {
        Ok(()) => tracing::debug!(%peer_addr, "session closed"),
        Err(e) => tracing::debug!(%peer_addr, error = %e, "session failed"),
    }
}

async fn run_session(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    backend: Arc<Backend>,
) -> Result<(), ProxyError> {
    // Sniff the transport without consuming: the WebSocket upgrade needs
    // the full request, magic included. peek() returns whatever is
    // buffered, so a partial probe gets a short grace period to fill.
    let mut probe = [0u8; 4];
    let mut attempts = 0;
    loop {
        let n = stream.peek(&mut probe).await?;
        if n == 0 {
            return Err(ProxyError::Protocol(
                "connection closed before handshake".into(),
            ));
        }
        if n >= 4 {
            break;
        }
        attempts += 1;
        if attempts > 50 {
            return Err(ProxyError::Protocol(
                "client never sent 4 sniffable bytes".into(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = if probe == BOLT_MAGIC {
        direct_handshake(&mut stream).await?;
        tracing::debug!(%peer_addr, "bolt handshake complete");
        Conn::direct(stream)
    } else if probe == HTTP_GET {
        let ws = websocket_handshake(stream).await?;
        tracing::debug!(%peer_addr, "websocket bolt handshake complete");
        Conn::websocket(ws)
    } else {
        tracing::warn!(%peer_addr, bytes = ?probe, "unrecognized protocol");
        return Ok(());
    };
    let (mut client_rx, mut client_wx) = client.into_split();

    // One message, which must be the HELLO.
    let hello = client_rx
        .recv()
        .await
        .ok_or_else(|| ProxyError::Protocol("client hung up before HELLO".into()))?;
    if hello.kind != MessageType::Hello {
        return Err(ProxyError::Protocol(format!(
            "expected HELLO, got {}",
            hello.kind
        )));
    }

    let mut conns = backend.authenticate(&hello).await?;
    drop(hello);
    client_wx.write(&Message::post_hello_success()).await?;

    // Transaction loop. Between transactions the session only talks to the
    // client; during one, the splice task owns the client writer and the
    // session forwards client messages to the backend.
    loop {
        let msg = match timeout(IDLE_TIMEOUT, client_rx.recv()).await {
            Err(_) => {
                tracing::info!(%peer_addr, "no data received in 5 minutes");
                break;
            }
            Ok(None) => break,
            Ok(Some(msg)) => msg,
        };

        match msg.kind {
            MessageType::Nop => continue,
            MessageType::Goodbye => break,
            MessageType::Reset => {
                client_wx.write(&Message::empty_success()).await?;
            }
            MessageType::Run | MessageType::Begin => {
                let mode = inspect::transaction_mode(&msg.data);
                let table = backend.routing_table().await?;
                let host = pick_host(&table, &conns, mode).ok_or_else(|| {
                    ProxyError::Routing(format!(
                        "no authenticated {mode:?} host for db {:?}",
                        table.default_db
                    ))
                })?;
                tracing::debug!(%peer_addr, %host, ?mode, kind = %msg.kind, "transaction started");

                let bconn = conns.remove(&host).expect("picked host is authenticated");
                let (backend_rx, mut backend_wx) = bconn.into_split();
                backend_wx.write(&msg).await?;

                let mut pump = tokio::spawn(splice(backend_rx, client_wx));

                loop {
                    tokio::select! {
                        joined = &mut pump => {
                            let (backend_rx, wx) = joined.map_err(|e| {
                                ProxyError::Protocol(format!("splice task died: {e}"))
                            })?;
                            client_wx = wx;
                            conns.insert(host.clone(), Conn::from_parts(backend_rx, backend_wx));
                            break;
                        }
                        client_msg = client_rx.recv() => match client_msg {
                            None => {
                                pump.abort();
                                return Ok(());
                            }
                            Some(m) if m.kind == MessageType::Goodbye => {
                                let _ = backend_wx.write(&m).await;
                                pump.abort();
                                return Ok(());
                            }
                            Some(m) => {
                                if let Err(e) = backend_wx.write(&m).await {
                                    pump.abort();
                                    return Err(e);
                                }
                            }
                        }
                    }
                }
                tracing::debug!(%peer_addr, %host, "transaction finished");
            }
            other => {
                tracing::debug!(%peer_addr, kind = %other, "ignoring message outside transaction");
            }
        }
    }

    Ok(())
}

/// Relays complete messages from the backend to the client until the
/// transaction terminates: a GOODBYE, a SUCCESS carrying a bookmark, or
/// backend EOF. Returns both halves so the session can reassemble them.
async fn splice(mut from: MessageReader, mut to: MessageWriter) -> (MessageReader, MessageWriter) {
    while let Some(msg) = from.recv().await {
        tracing::trace!(kind = %msg.kind, len = msg.data.len(), "server message");
        if let Err(e) = to.write(&msg).await {
            tracing::warn!(error = %e, "client write failed during splice");
            break;
        }
        match msg.kind {
            MessageType::Goodbye => break,
            MessageType::Success if inspect::has_bookmark(&msg.data) => break,
            _ => {}
        }
    }
    (from, to)
}

/// Picks the backend host for a transaction: first writer of the default
/// database for WRITE, first reader for READ (falling back to a writer),
/// restricted to hosts the session actually authenticated to.
fn pick_host(
    table: &RoutingTable,
    conns: &HashMap<String, Conn>,
    mode: AccessMode,
) -> Option<String> {
    let db = &table.default_db;
    let pick = |hosts: &[String]| hosts.iter().find(|h| conns.contains_key(*h)).cloned();

    match mode {
        AccessMode::Write => pick(table.writers_for(db)),
        AccessMode::Read => pick(table.readers_for(db)).or_else(|| pick(table.writers_for(db))),
    }
}

/// Reads the 20-byte magic + proposals off the raw stream and replies with
/// the pinned version.
async fn direct_handshake(stream: &mut TcpStream) -> Result<(), ProxyError> {
    let mut buf = [0u8; 20];
    stream.read_exact(&mut buf).await?;

    validate_magic(&buf[..4])?;
    let proposals: [u8; 16] = buf[4..].try_into().expect("fixed-size split");
    let reply = validate_handshake(&proposals, &CHOSEN_VERSION)?;

    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Runs the WebSocket upgrade, then the Bolt handshake inside binary
/// frames.
async fn websocket_handshake(
    stream: TcpStream,
) -> Result<WebSocketStream<TcpStream>, ProxyError> {
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, echo_subprotocol).await?;

    let frame = ws
        .next()
        .await
        .ok_or_else(|| ProxyError::Protocol("websocket closed before bolt handshake".into()))??;
    let data = match frame {
        WsMessage::Binary(data) => data,
        other => {
            return Err(ProxyError::UnsupportedFrame(format!(
                "non-binary frame during handshake: {other:?}"
            )));
        }
    };
    if data.len() != 20 {
        return Err(ProxyError::Protocol(format!(
            "expected 20-byte bolt handshake frame, got {}",
            data.len()
        )));
    }

    validate_magic(&data[..4])?;
    let proposals: [u8; 16] = data[4..].try_into().expect("fixed-size split");
    let reply = validate_handshake(&proposals, &CHOSEN_VERSION)?;
    ws.send(WsMessage::Binary(reply.to_vec())).await?;

    Ok(ws)
}

/// Grants whatever Bolt sub-protocol the browser asked for; clients drop
/// the connection when a requested protocol is not echoed back.
fn echo_subprotocol(req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    if let Some(protocol) = req.headers().get("Sec-WebSocket-Protocol") {
        resp.headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol.clone());
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::message_channel;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::time::Instant;

    fn framed(payload: &[u8]) -> Message {
        let mut buf = BytesMut::new();
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
        buf.put_slice(&[0x00, 0x00]);
        Message::new(Bytes::from(buf.to_vec()))
    }

    fn success_with_bookmark() -> Message {
        let mut payload = vec![0xB1, 0x70, 0xA1, 0x88];
        payload.extend_from_slice(b"bookmark");
        payload.push(0x84);
        payload.extend_from_slice(b"FB:x");
        framed(&payload)
    }

    #[tokio::test]
    async fn splice_forwards_until_bookmark_success() {
        let (tx, backend_rx) = message_channel();
        let (observer_io, splice_io) = tokio::io::duplex(4096);
        let writer = MessageWriter::Direct(Box::new(splice_io));

        let record = framed(&[0xB1, 0x71, 0x91, 0x01]);
        tx.send(record.clone()).unwrap();
        tx.send(success_with_bookmark()).unwrap();
        // Anything after the bookmark belongs to the next transaction and
        // must stay queued.
        tx.send(framed(&[0xB1, 0x70, 0xA0])).unwrap();

        let (mut backend_rx, _writer) = splice(backend_rx, writer).await;

        let mut observer = Conn::direct(observer_io);
        let first = observer.recv().await.unwrap();
        assert_eq!(first.kind, MessageType::Record);
        assert_eq!(first.data, record.data);
        let second = observer.recv().await.unwrap();
        assert!(inspect::has_bookmark(&second.data));

        // The queued post-transaction message is still deliverable.
        let queued = backend_rx.recv().await.unwrap();
        assert_eq!(queued.kind, MessageType::Success);
    }

    #[tokio::test]
    async fn splice_ends_on_backend_eof() {
        let (tx, backend_rx) = message_channel();
        let (_observer_io, splice_io) = tokio::io::duplex(4096);
        let writer = MessageWriter::Direct(Box::new(splice_io));
        drop(tx);

        let _ = splice(backend_rx, writer).await;
    }

    fn dummy_conn() -> Conn {
        let (_tx, reader) = message_channel();
        Conn::from_parts(reader, MessageWriter::Direct(Box::new(tokio::io::sink())))
    }

    fn table() -> RoutingTable {
        RoutingTable {
            default_db: "neo4j".into(),
            readers: HashMap::from([(
                "neo4j".to_string(),
                vec!["r1:7687".to_string(), "r2:7687".to_string()],
            )]),
            writers: HashMap::from([("neo4j".to_string(), vec!["w1:7687".to_string()])]),
            hosts: ["w1:7687", "r1:7687", "r2:7687"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ttl: Duration::from_secs(300),
            created_at: Instant::now(),
        }
    }

    #[test]
    fn write_mode_picks_default_writer() {
        let conns: HashMap<String, Conn> = ["w1:7687", "r1:7687"]
            .iter()
            .map(|h| (h.to_string(), dummy_conn()))
            .collect();
        assert_eq!(
            pick_host(&table(), &conns, AccessMode::Write).as_deref(),
            Some("w1:7687")
        );
    }

    #[test]
    fn read_mode_prefers_authenticated_reader() {
        // r1 failed fan-out auth; r2 is the first authenticated reader.
        let conns: HashMap<String, Conn> = ["w1:7687", "r2:7687"]
            .iter()
            .map(|h| (h.to_string(), dummy_conn()))
            .collect();
        assert_eq!(
            pick_host(&table(), &conns, AccessMode::Read).as_deref(),
            Some("r2:7687")
        );
    }

    #[test]
    fn read_mode_falls_back_to_writer() {
        let conns: HashMap<String, Conn> =
            HashMap::from([("w1:7687".to_string(), dummy_conn())]);
        assert_eq!(
            pick_host(&table(), &conns, AccessMode::Read).as_deref(),
            Some("w1:7687")
        );
    }

    #[test]
    fn no_authenticated_host_is_none() {
        let conns = HashMap::new();
        assert!(pick_host(&table(), &conns, AccessMode::Write).is_none());
    }
}
