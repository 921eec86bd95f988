//! Wire framing for the query client.
//!
//! The monitor's traffic is tiny and strictly request/reply, so this is not
//! a general-purpose chunker: a request is always written as exactly one
//! chunk, while a reply is reassembled from however many chunks the server
//! sends before the `0x0000` terminator.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Reads one reply payload, stripped of framing.
pub(crate) async fn read_payload<R>(reader: &mut R) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = Vec::new();

    loop {
        let mut header = [0u8; 2];
        reader.read_exact(&mut header).await?;
        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            return Ok(payload);
        }

        let start = payload.len();
        payload.resize(start + len, 0);
        reader.read_exact(&mut payload[start..]).await?;
    }
}

/// Writes one request payload as a single chunk plus terminator.
///
/// Every request this client sends (HELLO, the two routing queries, PULL)
/// is far below the chunk ceiling; anything larger is a logic error, not a
/// case to split.
pub(crate) async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(payload.len()).map_err(|_| {
        ProxyError::Protocol(format!(
            "query payload of {} bytes exceeds one chunk",
            payload.len()
        ))
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.write_all(&[0x00, 0x00]).await?;
    writer.flush().await?;
    Ok(())
}
