//! Low-level Bolt query connection: TCP connect, handshake, HELLO, RUN/PULL.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::wire;
use crate::backend::tls::server_name;
use crate::error::ProxyError;
use crate::message::sig;
use crate::packstream::{decode_value, encode, Value};
use crate::version::{backend_proposals, CHOSEN_VERSION, BOLT_MAGIC};

/// The user agent reported to the cluster.
pub const USER_AGENT: &str = "bolt-proxy/v0";

/// Basic-auth credentials for the monitor's driver connection.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub principal: String,
    pub credentials: String,
}

/// A Bolt 4.2 connection for running auto-commit queries.
pub struct QueryConnection {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl QueryConnection {
    /// Connects to `host`, performs the handshake and authenticates.
    pub async fn connect(
        host: &str,
        tls: Option<&TlsConnector>,
        auth: &Credentials,
    ) -> Result<Self, ProxyError> {
        let stream = TcpStream::connect(host).await?;
        match tls {
            Some(connector) => {
                let stream = connector.connect(server_name(host)?, stream).await?;
                Self::establish(stream, auth).await
            }
            None => Self::establish(stream, auth).await,
        }
    }

    async fn establish<S>(mut stream: S, auth: &Credentials) -> Result<Self, ProxyError>
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
                "server negotiated unexpected version {reply:02X?}"
            )));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn = Self {
            reader: Box::new(read_half),
            writer: Box::new(write_half),
        };
        conn.hello(auth).await?;
        Ok(conn)
    }

    /// Sends HELLO with basic auth and expects SUCCESS.
    async fn hello(&mut self, auth: &Credentials) -> Result<(), ProxyError> {
        let extra = HashMap::from([
            ("user_agent".to_string(), Value::String(USER_AGENT.into())),
            ("scheme".to_string(), Value::String("basic".into())),
            (
                "principal".to_string(),
                Value::String(auth.principal.clone()),
            ),
            (
                "credentials".to_string(),
                Value::String(auth.credentials.clone()),
            ),
        ]);
        self.send_struct(sig::HELLO, &[Value::Map(extra)]).await?;

        match self.recv_reply().await? {
            (sig::SUCCESS, _) => Ok(()),
            (sig::FAILURE, fields) => Err(ProxyError::Authentication(failure_message(&fields))),
            (other, _) => Err(ProxyError::Protocol(format!(
                "expected SUCCESS after HELLO, got signature 0x{other:02X}"
            ))),
        }
    }

    /// Runs an auto-commit query and returns the RUN metadata.
    pub async fn run(
        &mut self,
        query: &str,
        parameters: HashMap<String, Value>,
        extra: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, ProxyError> {
        self.send_struct(
            sig::RUN,
            &[
                Value::String(query.to_string()),
                Value::Map(parameters),
                Value::Map(extra),
            ],
        )
        .await?;

        match self.recv_reply().await? {
            (sig::SUCCESS, fields) => Ok(require_map(fields)?),
            (sig::FAILURE, fields) => Err(ProxyError::Routing(failure_message(&fields))),
            (other, _) => Err(ProxyError::Protocol(format!(
                "expected SUCCESS after RUN, got signature 0x{other:02X}"
            ))),
        }
    }

    /// Sends PULL for all records and collects them until the SUCCESS
    /// summary.
    pub async fn pull_all(
        &mut self,
    ) -> Result<(Vec<Vec<Value>>, HashMap<String, Value>), ProxyError> {
        let extra = HashMap::from([("n".to_string(), Value::Int(-1))]);
        self.send_struct(sig::PULL, &[Value::Map(extra)]).await?;

        let mut records = Vec::new();
        loop {
            match self.recv_reply().await? {
                (sig::RECORD, mut fields) => {
                    let row = match fields.pop() {
                        Some(Value::List(values)) => values,
                        other => {
                            return Err(ProxyError::Protocol(format!(
                                "RECORD without value list: {other:?}"
                            )));
                        }
                    };
                    records.push(row);
                }
                (sig::SUCCESS, fields) => return Ok((records, require_map(fields)?)),
                (sig::FAILURE, fields) => {
                    return Err(ProxyError::Routing(failure_message(&fields)));
                }
                (other, _) => {
                    return Err(ProxyError::Protocol(format!(
                        "unexpected signature 0x{other:02X} during PULL"
                    )));
                }
            }
        }
    }

    async fn send_struct(&mut self, signature: u8, fields: &[Value]) -> Result<(), ProxyError> {
        let mut buf = BytesMut::new();
        encode::encode_struct_header(&mut buf, signature, fields.len());
        for field in fields {
            encode::encode_value(&mut buf, field);
        }
        wire::write_payload(&mut self.writer, &buf).await
    }

    async fn recv_reply(&mut self) -> Result<(u8, Vec<Value>), ProxyError> {
        let payload = wire::read_payload(&mut self.reader).await?;
        decode_message(&payload)
    }
}

/// Decodes a chunk-stripped message payload into its signature and fields.
fn decode_message(payload: &[u8]) -> Result<(u8, Vec<Value>), ProxyError> {
    if payload.len() < 2 || payload[0] >> 4 != 0x0B {
        return Err(ProxyError::MalformedFrame(format!(
            "not a message struct: {:02X?}",
            payload.get(..2)
        )));
    }
    let field_count = (payload[0] & 0x0F) as usize;
    let signature = payload[1];

    let mut fields = Vec::with_capacity(field_count);
    let mut pos = 2;
    for _ in 0..field_count {
        let (value, n) = decode_value(&payload[pos..])?;
        fields.push(value);
        pos += n;
    }
    Ok((signature, fields))
}

fn require_map(mut fields: Vec<Value>) -> Result<HashMap<String, Value>, ProxyError> {
    match fields.pop() {
        Some(Value::Map(map)) => Ok(map),
        other => Err(ProxyError::Protocol(format!(
            "expected metadata map, got {other:?}"
        ))),
    }
}

fn failure_message(fields: &[Value]) -> String {
    let meta = fields.first().and_then(|v| match v {
        Value::Map(m) => Some(m),
        _ => None,
    });
    let get = |key: &str| {
        meta.and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    };
    format!("{}: {}", get("code"), get("message"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_success_payload() {
        // SUCCESS {fields: ["name"]}
        let payload = [
            0xB1, 0x70, 0xA1, //
            0x86, b'f', b'i', b'e', b'l', b'd', b's', //
            0x91, 0x84, b'n', b'a', b'm', b'e',
        ];
        let (signature, fields) = decode_message(&payload).unwrap();
        assert_eq!(signature, sig::SUCCESS);
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn decode_record_payload() {
        // RECORD [1]
        let payload = [0xB1, 0x71, 0x91, 0x01];
        let (signature, fields) = decode_message(&payload).unwrap();
        assert_eq!(signature, sig::RECORD);
        assert_eq!(fields, vec![Value::List(vec![Value::Int(1)])]);
    }

    #[test]
    fn reject_non_struct_payload() {
        assert!(decode_message(&[0xA0]).is_err());
        assert!(decode_message(&[]).is_err());
    }

    #[test]
    fn failure_message_formats_code_and_text() {
        let meta = HashMap::from([
            (
                "code".to_string(),
                Value::String("Neo.ClientError.Security.Unauthorized".into()),
            ),
            (
                "message".to_string(),
                Value::String("The client is unauthorized".into()),
            ),
        ]);
        let text = failure_message(&[Value::Map(meta)]);
        assert!(text.contains("Unauthorized"));
    }
}
