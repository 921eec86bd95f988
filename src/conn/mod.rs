//! Message-oriented Bolt connections.
//!
//! A `Conn` is a full-duplex channel of `Message`s over some byte transport.
//! Incoming frames are decoded by a background producer task and delivered
//! through an unbounded receiver; outgoing messages are written verbatim.
//! The two halves can be split so a transaction splice task can own one
//! direction while the session loop keeps the other.

pub mod direct;
pub mod ws;

use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::ProxyError;
use crate::message::Message;

/// The receiving half of a connection: a lazy sequence of incoming messages.
pub struct MessageReader {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageReader {
    /// Receives the next message; `None` means the peer hung up (or the
    /// producer task failed and closed the sequence).
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// The sending half of a connection.
pub enum MessageWriter {
    Direct(Box<dyn AsyncWrite + Send + Unpin>),
    WebSocket(SplitSink<WebSocketStream<TcpStream>, WsMessage>),
}

impl MessageWriter {
    /// Writes one message to the transport: raw frame bytes on a direct
    /// stream, a single binary frame on a WebSocket.
    pub async fn write(&mut self, msg: &Message) -> Result<(), ProxyError> {
        match self {
            Self::Direct(w) => {
                w.write_all(&msg.data).await?;
                w.flush().await?;
                Ok(())
            }
            Self::WebSocket(sink) => {
                sink.send(WsMessage::Binary(msg.data.to_vec())).await?;
                Ok(())
            }
        }
    }

    /// Shuts the transport down gracefully.
    pub async fn close(&mut self) -> Result<(), ProxyError> {
        match self {
            Self::Direct(w) => {
                w.shutdown().await?;
                Ok(())
            }
            Self::WebSocket(sink) => {
                sink.close().await?;
                Ok(())
            }
        }
    }
}

/// A full-duplex Bolt message channel.
pub struct Conn {
    pub reader: MessageReader,
    pub writer: MessageWriter,
}

impl Conn {
    pub(crate) fn from_parts(reader: MessageReader, writer: MessageWriter) -> Self {
        Self { reader, writer }
    }

    /// Receives the next incoming message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.reader.recv().await
    }

    /// Sends one message.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ProxyError> {
        self.writer.write(msg).await
    }

    /// Splits the connection into its two independently owned halves.
    pub fn into_split(self) -> (MessageReader, MessageWriter) {
        (self.reader, self.writer)
    }
}

pub(crate) fn message_channel() -> (mpsc::UnboundedSender<Message>, MessageReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, MessageReader { rx })
}
