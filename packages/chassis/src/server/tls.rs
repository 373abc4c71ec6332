//! TLS listener material.
//!
//! Certificates load once at server construction and are served from that
//! in-process cache on every handshake; there is no automatic reload.
//! Protocol floor is TLS 1.2, ceiling 1.3, with ALPN offering `h2` and
//! `http/1.1`. When mutual TLS is requested the client CA file must exist.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};

use super::config::HttpConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("read server certificate: {0}")]
    ReadCert(std::io::Error),
    #[error("read CA certificate: {0}")]
    ReadCa(std::io::Error),
    #[error("read TLS key: {0}")]
    ReadKey(std::io::Error),
    #[error("parse certificate chain: {0}")]
    ParseCert(std::io::Error),
    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error("read client CA certificate: {0}")]
    ReadClientCa(std::io::Error),
    #[error("parse client CA certificate")]
    ParseClientCa,
    #[error("build client verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),
    #[error("TLS config: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Server certificate bytes: the certificate file alone, or concatenated
/// with the CA file when that file exists and is readable.
pub(crate) fn cert_bundle(config: &HttpConfig) -> Result<Vec<u8>, TlsError> {
    let mut cert = std::fs::read(&config.tls_cert).map_err(TlsError::ReadCert)?;
    if config.tls_ca.as_os_str().is_empty() {
        return Ok(cert);
    }
    match std::fs::read(&config.tls_ca) {
        Ok(ca) => {
            cert.push(b'\n');
            cert.extend_from_slice(&ca);
            Ok(cert)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(cert),
        Err(err) => Err(TlsError::ReadCa(err)),
    }
}

/// Build the rustls server configuration from the HTTP config.
pub(crate) fn server_config(config: &HttpConfig) -> Result<ServerConfig, TlsError> {
    let cert_pem = cert_bundle(config)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(TlsError::ParseCert)?;

    let builder = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ]);

    let builder = if config.tls_use_client_cert {
        let ca_pem = std::fs::read(&config.tls_client_ca).map_err(TlsError::ReadClientCa)?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
            let cert = cert.map_err(|_| TlsError::ParseClientCa)?;
            roots.add(cert).map_err(|_| TlsError::ParseClientCa)?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let key_pem = std::fs::read(&config.tls_key).map_err(TlsError::ReadKey)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(TlsError::ReadKey)?
        .ok_or_else(|| TlsError::NoPrivateKey(config.tls_key.clone()))?;

    let mut tls_config = builder.with_single_cert(certs, key)?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(tls_config)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
