//! WebSocket Bolt connections.
//!
//! Browser clients speak Bolt inside binary WebSocket frames. A single frame
//! may carry several complete Bolt messages back to back (RUN + PULL is
//! common), and an oversized message arrives as chunk fragments. Fragments
//! are tagged `Chunked` and forwarded verbatim; chunks are never reassembled
//! across frame boundaries.

use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use super::{message_channel, Conn, MessageWriter};
use crate::message::{identify, Message, MessageType};

impl Conn {
    /// Wraps an upgraded WebSocket stream in a message-oriented connection,
    /// spawning the background frame reader. The Bolt-level handshake must
    /// already have been exchanged on the stream.
    pub fn websocket(stream: WebSocketStream<TcpStream>) -> Conn {
        let (sink, mut frames) = stream.split();
        let (tx, reader) = message_channel();

        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(WsMessage::Binary(data)) => {
                        for msg in split_frame(&data) {
                            if tx.send(msg).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        tracing::debug!("bolt ws connection hung up");
                        return;
                    }
                    Ok(other) => {
                        // Ping/Pong/Text/Continuation: outside the contract,
                        // fail the session by closing the sequence.
                        tracing::error!(
                            frame = kind_of(&other),
                            "unsupported websocket frame"
                        );
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ws bolt connection error");
                        return;
                    }
                }
            }
        });

        Conn::from_parts(reader, MessageWriter::WebSocket(sink))
    }
}

fn kind_of(msg: &WsMessage) -> &'static str {
    match msg {
        WsMessage::Text(_) => "text",
        WsMessage::Ping(_) => "ping",
        WsMessage::Pong(_) => "pong",
        WsMessage::Frame(_) => "raw frame",
        WsMessage::Binary(_) | WsMessage::Close(_) => "",
    }
}

/// Walks a binary frame holding one or more Bolt messages.
///
/// After each prospective message length the walker peeks for the `00 00`
/// terminator to decide whether it is looking at a complete message or a
/// chunk fragment. Fragments (and a terminal chunk of an unknown message
/// type) are tagged `Chunked` so the upstream can pass them through without
/// reinterpreting.
pub(crate) fn split_frame(buf: &[u8]) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut pos = 0;

    while pos + 2 <= buf.len() {
        let msglen = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        let terminal = buf.get(pos + msglen + 2..pos + msglen + 4) == Some(&[0x00, 0x00][..]);

        if terminal {
            let data = &buf[pos..pos + msglen + 4];
            let mut kind = identify(data);
            if kind == MessageType::Unknown {
                kind = MessageType::Chunked;
            }
            messages.push(Message {
                kind,
                data: Bytes::copy_from_slice(data),
            });
            pos += msglen + 4;
        } else {
            // Mid-chunk: forward the header plus payload as-is.
            let end = (pos + msglen + 2).min(buf.len());
            messages.push(Message {
                kind: MessageType::Chunked,
                data: Bytes::copy_from_slice(&buf[pos..end]),
            });
            pos = end;
        }
    }

    messages
}
