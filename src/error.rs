//! Error types for the proxy.

use tokio_tungstenite::tungstenite;

/// Errors that can occur while proxying Bolt traffic.
///
/// Per-session kinds (frame, encoding, hello, auth) close the affected
/// session. Routing-subsystem failures are escalated to process termination
/// by the monitor because the proxy cannot route without a live table.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("unsupported websocket frame: {0}")]
    UnsupportedFrame(String),

    #[error("bad HELLO: {0}")]
    BadHello(String),

    #[error("authentication probe failed: {0}")]
    AuthProbeFailed(String),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("read stalled: {0}")]
    ReadStall(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}
