//! Mutual TLS configuration and peer identity.
//!
//! Both directions of the protocol are mutually authenticated: the server
//! requires a client certificate chaining to the configured CA, and the
//! client verifies the server against the same CA. rustls' default protocol
//! set (1.3 with 1.2 fallback) satisfies the minimum-version requirement.
//!
//! The authorization principal is the subject Common Name of the verified
//! leaf certificate. A peer without a CN authenticates but holds no
//! permissions.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Errors raised while assembling TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    /// No private key in the key file.
    #[error("no private key found in {0}")]
    MissingKey(std::path::PathBuf),

    /// The CA bundle contained no usable certificate.
    #[error("no usable CA certificate in {0}")]
    EmptyCaPool(std::path::PathBuf),

    /// rustls rejected the material.
    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("failed to build client verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),
}

/// Install the process-wide ring crypto provider.
///
/// Must run before any TLS configuration is built; calling it twice is
/// harmless (the error for an already-installed provider is ignored).
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Server-side mTLS configuration: present `cert`/`key`, require and verify
/// client certificates against the CA bundle at `ca`.
///
/// # Errors
///
/// Fails when any PEM file is unreadable or rustls rejects the material.
pub fn server_config(cert: &Path, key: &Path, ca: &Path) -> Result<ServerConfig, TlsError> {
    let roots = load_root_store(ca)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_key(key)?)?;
    Ok(config)
}

/// Client-side mTLS configuration: trust the CA bundle at `ca` and present
/// `cert`/`key` when the server asks.
///
/// # Errors
///
/// Fails when any PEM file is unreadable or rustls rejects the material.
pub fn client_config(cert: &Path, key: &Path, ca: &Path) -> Result<ClientConfig, TlsError> {
    let roots = load_root_store(ca)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(cert)?, load_key(key)?)?;
    Ok(config)
}

/// Subject CN of the peer's leaf certificate.
///
/// Returns `None` when the chain is empty, the leaf does not parse, or the
/// subject carries no CN; callers treat all of those as "no identity".
#[must_use]
pub fn peer_common_name(certs: &[CertificateDer<'_>]) -> Option<String> {
    let leaf = certs.first()?;
    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_owned)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::MissingKey(path.to_path_buf()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    if roots.is_empty() {
        return Err(TlsError::EmptyCaPool(path.to_path_buf()));
    }
    Ok(roots)
}
