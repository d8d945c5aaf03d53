//! Transport security builder
//!
//! Turns the configured [`TransportMode`] into a rustls client context for
//! the broker connection. PEM material is accepted either as file paths
//! (through [`client_config`]) or as in-memory bytes, so callers that already
//! hold the material never touch the filesystem.

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::TlsError;
use crate::types::TransportMode;

/// Build the TLS context for `mode`; `None` for plaintext
pub fn client_config(mode: &TransportMode) -> Result<Option<Arc<ClientConfig>>, TlsError> {
    let config = match mode {
        TransportMode::Plaintext => return Ok(None),
        TransportMode::Tls { ca_cert: Some(ca) } => server_auth_config(Some(&read_pem(ca)?))?,
        TransportMode::Tls { ca_cert: None } => server_auth_config(None)?,
        TransportMode::MutualTls {
            ca_cert,
            client_cert,
            private_key,
            verify_server,
        } => mutual_tls_config(
            &read_pem(ca_cert)?,
            &read_pem(client_cert)?,
            &read_pem(private_key)?,
            *verify_server,
        )?,
        TransportMode::Insecure => insecure_config(),
    };

    Ok(Some(Arc::new(config)))
}

/// Mutual TLS: trust `ca_pem`, authenticate with the client chain and key.
///
/// The client leaf certificate is parsed before use. With `verify_server`
/// unset the broker certificate is accepted without verification.
pub fn mutual_tls_config(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
    verify_server: bool,
) -> Result<ClientConfig, TlsError> {
    let roots = root_store(ca_pem, "CA certificate")?;
    let chain = certificate_chain(cert_pem, "client certificate")?;
    inspect_leaf(&chain[0])?;
    let key = private_key(key_pem, "private key")?;

    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?;

    if !verify_server {
        tracing::warn!("Broker certificate verification disabled for mutual TLS");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification));
    }

    Ok(config)
}

/// Server-authenticated TLS against `ca_pem`, or the platform roots
pub fn server_auth_config(ca_pem: Option<&[u8]>) -> Result<ClientConfig, TlsError> {
    let roots = match ca_pem {
        Some(pem) => root_store(pem, "CA certificate")?,
        None => native_root_store()?,
    };

    Ok(ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// TLS that accepts any broker certificate
pub fn insecure_config() -> ClientConfig {
    tracing::warn!("TLS certificate verification disabled");
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth()
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn certificate_chain(pem: &[u8], label: &str) -> Result<Vec<Certificate>, TlsError> {
    let ders = rustls_pemfile::certs(&mut &pem[..]).map_err(|source| TlsError::Pem {
        label: label.to_string(),
        source,
    })?;
    if ders.is_empty() {
        return Err(TlsError::NoCertificates(label.to_string()));
    }
    Ok(ders.into_iter().map(Certificate).collect())
}

fn root_store(pem: &[u8], label: &str) -> Result<RootCertStore, TlsError> {
    let certs = certificate_chain(pem, label)?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&certs);
    if added == 0 {
        return Err(TlsError::NoCertificates(label.to_string()));
    }
    if ignored > 0 {
        tracing::debug!("Ignored {} unparsable {} entries", ignored, label);
    }
    Ok(roots)
}

fn native_root_store() -> Result<RootCertStore, TlsError> {
    let native = rustls_native_certs::load_native_certs().map_err(TlsError::NativeRoots)?;
    let certs: Vec<Certificate> = native.into_iter().map(|c| Certificate(c.0)).collect();

    let mut roots = RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(&certs);
    if added == 0 {
        return Err(TlsError::NoCertificates("native root store".to_string()));
    }
    Ok(roots)
}

/// PKCS#8 first, then RSA, then SEC1
fn private_key(pem: &[u8], label: &str) -> Result<PrivateKey, TlsError> {
    let items = rustls_pemfile::read_all(&mut &pem[..]).map_err(|source| TlsError::Pem {
        label: label.to_string(),
        source,
    })?;

    let mut rsa = None;
    let mut ec = None;
    for item in items {
        match item {
            rustls_pemfile::Item::PKCS8Key(key) => return Ok(PrivateKey(key)),
            rustls_pemfile::Item::RSAKey(key) => rsa = rsa.or(Some(key)),
            rustls_pemfile::Item::ECKey(key) => ec = ec.or(Some(key)),
            _ => {}
        }
    }

    rsa.or(ec)
        .map(PrivateKey)
        .ok_or_else(|| TlsError::NoPrivateKey(label.to_string()))
}

/// Parse the client leaf and warn when it is outside its validity window
fn inspect_leaf(leaf: &Certificate) -> Result<(), TlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(&leaf.0)
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    let validity = cert.validity();
    if !validity.is_valid() {
        tracing::warn!(
            "Client certificate {} is outside its validity window ({} to {})",
            cert.subject(),
            validity.not_before,
            validity.not_after
        );
    } else {
        tracing::debug!("Client certificate subject: {}", cert.subject());
    }

    Ok(())
}

struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
