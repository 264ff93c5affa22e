//! TLS identity for the cluster channel
//!
//! Both cluster modes terminate mutual TLS. In `shared` mode the two sides
//! hold one well-known certificate and identity is established after the
//! handshake by pinning the peer leaf's SHA-256 fingerprint, so the rustls
//! verifiers accept any certificate here. In `pki` mode rustls performs
//! standard CA validation against the configured cluster CA.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, Error as RustlsError, RootCertStore,
    ServerConfig, SignatureScheme,
};

/// Server name a shared-mode data plane sends on connect.
pub const SHARED_SNI: &str = "kong_clustering";

/// TLS errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCerts(String),
    #[error("no private key found in {0}")]
    NoKey(String),
    #[error("TLS error: {0}")]
    Rustls(#[from] RustlsError),
    #[error("cannot build client verifier: {0}")]
    VerifierBuild(String),
    #[error("invalid TLS server name: {0:?}")]
    InvalidServerName(String),
    #[error("unknown cluster mTLS mode: {0:?} (expected \"shared\" or \"pki\")")]
    UnknownMode(String),
}

/// How cluster peers authenticate each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
    /// One well-known certificate, pinned by fingerprint.
    Shared,
    /// Standard CA validation.
    Pki,
}

impl std::str::FromStr for TlsMode {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "pki" => Ok(Self::Pki),
            other => Err(TlsError::UnknownMode(other.to_string())),
        }
    }
}

/// Load certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(Result::ok)
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCerts(path.display().to_string()));
    }
    Ok(certs)
}

/// Load a private key from a PEM file (PKCS#8, PKCS#1, or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut reader) {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => {}
        }
    }

    Err(TlsError::NoKey(path.display().to_string()))
}

/// SHA-256 fingerprint of a certificate in `AB:CD:..` form.
pub fn leaf_fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Compare two fingerprints, ignoring case and `:`/`-`/space separators.
pub fn fingerprints_match(expected: &str, actual: &str) -> bool {
    let normalize = |s: &str| {
        s.chars()
            .filter(|c| !matches!(c, ':' | '-' | ' '))
            .collect::<String>()
            .to_uppercase()
    };
    normalize(expected) == normalize(actual)
}

/// Build the server-side TLS config. A client certificate is always
/// required; who validates it depends on the mode.
pub fn server_config(
    mode: TlsMode,
    cert_path: &Path,
    key_path: &Path,
    ca_path: Option<&Path>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let verifier: Arc<dyn ClientCertVerifier> = match (mode, ca_path) {
        (TlsMode::Shared, _) => Arc::new(FingerprintGateVerifier),
        (TlsMode::Pki, Some(ca)) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::VerifierBuild(e.to_string()))?;
            }
            WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TlsError::VerifierBuild(e.to_string()))?
        }
        (TlsMode::Pki, None) => {
            return Err(TlsError::VerifierBuild(
                "pki mode requires a cluster CA certificate".to_string(),
            ))
        }
    };

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Build the client-side TLS config with the cluster client certificate.
pub fn client_config(
    mode: TlsMode,
    cert_path: &Path,
    key_path: &Path,
    ca_path: Option<&Path>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = match (mode, ca_path) {
        (TlsMode::Shared, _) => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintGateVerifier))
            .with_client_auth_cert(certs, key)?,
        (TlsMode::Pki, Some(ca)) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::VerifierBuild(e.to_string()))?;
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_client_auth_cert(certs, key)?
        }
        (TlsMode::Pki, None) => {
            return Err(TlsError::VerifierBuild(
                "pki mode requires a cluster CA certificate".to_string(),
            ))
        }
    };

    Ok(Arc::new(config))
}

/// Server name the data plane indicates. Shared mode always uses the
/// well-known name; pki mode prefers the configured override.
pub fn client_server_name(
    mode: TlsMode,
    server_name: Option<&str>,
    host: &str,
) -> Result<ServerName<'static>, TlsError> {
    let name = match mode {
        TlsMode::Shared => SHARED_SNI,
        TlsMode::Pki => server_name.unwrap_or(host),
    };
    ServerName::try_from(name.to_string()).map_err(|_| TlsError::InvalidServerName(name.to_string()))
}

/// Accepts any peer certificate during the handshake; identity in shared
/// mode is established afterwards by fingerprint pinning.
#[derive(Debug)]
struct FingerprintGateVerifier;

impl ServerCertVerifier for FingerprintGateVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

impl ClientCertVerifier for FingerprintGateVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, RustlsError> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

fn supported_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA512,
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::ECDSA_NISTP521_SHA512,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PSS_SHA512,
        SignatureScheme::ED25519,
    ]
}
