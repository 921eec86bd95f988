//! Direct (plain byte stream) Bolt connections.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;

use super::{message_channel, Conn, MessageWriter};
use crate::error::ProxyError;
use crate::message::Message;

/// Scratch buffer size for the framed-message reader.
const READ_BUF_SIZE: usize = 128 * 1024;

/// How many short reads of a chunk header to tolerate before giving up.
const MAX_UNDER_READS: usize = 5;

impl Conn {
    /// Wraps a raw byte stream (TCP or TLS) in a message-oriented
    /// connection, spawning the background frame reader.
    pub fn direct<S>(stream: S) -> Conn
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, reader) = message_channel();
        tokio::spawn(read_loop(read_half, tx));
        Conn::from_parts(reader, MessageWriter::Direct(Box::new(write_half)))
    }
}

async fn read_loop<R>(mut reader: R, tx: mpsc::UnboundedSender<Message>)
where
    R: AsyncRead + Send + Unpin,
{
    // Pre-filled with 0xFF so credential bytes never linger after a frame
    // has been handed off.
    let mut buf = vec![0xFFu8; READ_BUF_SIZE];

    loop {
        match read_framed(&mut reader, &mut buf).await {
            Ok(Some(len)) => {
                let msg = Message::new(bytes::Bytes::copy_from_slice(&buf[..len]));
                buf[..len].fill(0xFF);
                if tx.send(msg).is_err() {
                    // Consumer gone; nothing left to do.
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("direct bolt connection hung up");
                return;
            }
            Err(ProxyError::ReadStall(msg)) => {
                // Repeated short reads of a 2-byte header mean the transport
                // is wedged; take the reader task down with it.
                panic!("{msg}");
            }
            Err(e) => {
                tracing::warn!(error = %e, "direct bolt connection error");
                return;
            }
        }
    }
}

/// Reads one complete framed message (all chunks plus the terminator) into
/// `buf`, returning its total length. `None` is a clean end-of-stream
/// between messages.
async fn read_framed<R>(reader: &mut R, buf: &mut [u8]) -> Result<Option<usize>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut pos = 0;

    loop {
        // Chunk header, tolerating a bounded number of 1-byte reads.
        let mut have = 0;
        let mut under_reads = 0;
        while have < 2 {
            let n = reader.read(&mut buf[pos + have..pos + 2]).await?;
            if n == 0 {
                if pos == 0 && have == 0 {
                    return Ok(None);
                }
                return Err(ProxyError::MalformedFrame(
                    "stream ended inside a frame".into(),
                ));
            }
            if n < 2 - have {
                under_reads += 1;
                if under_reads > MAX_UNDER_READS {
                    return Err(ProxyError::ReadStall(format!(
                        "{under_reads} short reads on chunk header"
                    )));
                }
            }
            have += n;
        }

        let msglen = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;

        if msglen < 1 {
            // 0x0000 terminator: message complete.
            break;
        }

        let end = pos + msglen;
        if end > buf.len() {
            return Err(ProxyError::MalformedFrame(format!(
                "message exceeds {READ_BUF_SIZE}-byte buffer"
            )));
        }
        while pos < end {
            let n = reader.read(&mut buf[pos..end]).await?;
            if n == 0 {
                return Err(ProxyError::MalformedFrame(
                    "stream ended inside a chunk".into(),
                ));
            }
            pos += n;
        }
    }

    Ok(Some(pos))
}
