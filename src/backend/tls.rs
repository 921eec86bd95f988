//! TLS connector construction for backend connections.
//!
//! Only scheme-driven behavior lives here: `+s` schemes verify against the
//! system roots, `+ssc` schemes accept self-signed certificates.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::ProxyError;

/// Whether a cluster URI scheme calls for TLS to the backend.
pub fn requires_tls(scheme: &str) -> bool {
    matches!(scheme, "bolt+s" | "bolt+ssc" | "neo4j+s" | "neo4j+ssc")
}

/// Whether the scheme accepts self-signed certificates.
pub fn trust_any_cert(scheme: &str) -> bool {
    matches!(scheme, "bolt+ssc" | "neo4j+ssc")
}

/// Builds the connector used for every TLS backend connection.
pub fn connector(trust_any: bool) -> TlsConnector {
    let config = if trust_any {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Extracts the SNI name from a `host:port` pair.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    let name = host.split(':').next().unwrap_or(host);
    ServerName::try_from(name.to_string())
        .map_err(|e| ProxyError::Protocol(format!("invalid server name {name:?}: {e}")))
}

/// Certificate verifier for the `+ssc` (self-signed certificate) schemes.
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl AcceptAnyCert {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_detection() {
        for scheme in ["bolt+s", "bolt+ssc", "neo4j+s", "neo4j+ssc"] {
            assert!(requires_tls(scheme), "{scheme}");
        }
        for scheme in ["bolt", "neo4j", "http"] {
            assert!(!requires_tls(scheme), "{scheme}");
        }
        assert!(trust_any_cert("neo4j+ssc"));
        assert!(!trust_any_cert("neo4j+s"));
    }

    #[test]
    fn server_name_strips_port() {
        assert!(server_name("db.example.com:7687").is_ok());
        assert!(server_name("db.example.com").is_ok());
    }
}
