//! Proxy front end: the TCP accept loop.

pub mod session;

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::backend::Backend;
use crate::error::ProxyError;

/// Binds the listening socket and serves clients until the process exits.
/// Both raw Bolt and Bolt-over-WebSocket clients share the port.
pub async fn serve(bind: &str, backend: Arc<Backend>) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(%bind, "bolt proxy listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let backend = backend.clone();
                tokio::spawn(session::handle_client(stream, peer_addr, backend));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
}
