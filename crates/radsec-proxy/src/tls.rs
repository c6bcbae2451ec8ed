//! TLS contexts and peer identity checks
//!
//! Each named `TLS` block becomes a [`TlsContext`] holding a rustls server
//! config (for sessions we accept) and client config (for sessions we
//! open), both built from the block's CA trust set and certificate chain.
//! Contexts are immutable after startup and shared by reference.
//!
//! Peer identity is bound to the configured host name by comparing it
//! against the Common Name of the peer certificate, case-insensitively,
//! after the chain has been validated against the trust set. SubjectAltName
//! is not consulted; supporting it is an extension point in
//! [`peer_matches_host`]. Because the name check is CN-based, chain
//! validation delegates to the webpki verifiers for everything except the
//! name: a NotValidForName outcome is accepted there and the CN comparison
//! happens after the handshake.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::TlsEntry;
use crate::error::{ConfigError, ConfigResult};

/// Longest accepted certificate chain, end entity included.
pub const MAX_CERT_DEPTH: usize = 5;

pub struct TlsContext {
    pub name: String,
    pub server: Arc<rustls::ServerConfig>,
    pub client: Arc<rustls::ClientConfig>,
}

impl TlsContext {
    pub fn build(entry: &TlsEntry) -> ConfigResult<Arc<TlsContext>> {
        let fail = |message: String| ConfigError::Tls {
            name: entry.name.clone(),
            message,
        };

        let mut roots = RootCertStore::empty();
        let mut ca_count = 0;
        if let Some(file) = &entry.ca_cert_file {
            for cert in load_certs(file)? {
                roots.add(cert).map_err(|e| fail(format!("bad CA certificate: {e}")))?;
                ca_count += 1;
            }
        }
        if let Some(dir) = &entry.ca_cert_path {
            for dirent in fs::read_dir(dir).map_err(ConfigError::Io)? {
                let path = dirent.map_err(ConfigError::Io)?.path();
                if !matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("pem" | "crt")
                ) {
                    continue;
                }
                for cert in load_certs(&path)? {
                    roots.add(cert).map_err(|e| fail(format!("bad CA certificate: {e}")))?;
                    ca_count += 1;
                }
            }
        }
        if ca_count == 0 {
            return Err(fail("no CA certificates found".to_string()));
        }
        let roots = Arc::new(roots);

        let chain = load_certs(&entry.cert_file)?;
        if chain.is_empty() {
            return Err(fail(format!(
                "no certificate in {}",
                entry.cert_file.display()
            )));
        }
        let key = load_key(&entry.key_file, entry.key_password.as_deref())
            .map_err(|message| fail(message))?;

        let client_verifier = WebPkiClientVerifier::builder(roots.clone())
            .build()
            .map_err(|e| fail(format!("client verifier: {e}")))?;
        let server = rustls::ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain.clone(), key.clone_key())
            .map_err(|e| fail(format!("certificate/key mismatch: {e}")))?;

        let server_verifier = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| fail(format!("server verifier: {e}")))?;
        let client = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CnDeferredVerifier {
                inner: server_verifier,
            }))
            .with_client_auth_cert(chain, key)
            .map_err(|e| fail(format!("certificate/key mismatch: {e}")))?;

        debug!(name = %entry.name, "added TLS context");
        Ok(Arc::new(TlsContext {
            name: entry.name.clone(),
            server: Arc::new(server),
            client: Arc::new(client),
        }))
    }
}

/// Build all configured contexts. Lookup is by exact name; the
/// `defaultclient`/`defaultserver`/`default` fallbacks were already applied
/// when the configuration was parsed.
pub fn build_contexts(entries: &[TlsEntry]) -> ConfigResult<Vec<Arc<TlsContext>>> {
    entries.iter().map(|e| TlsContext::build(e)).collect()
}

pub fn get_context<'a>(
    contexts: &'a [Arc<TlsContext>],
    name: &str,
) -> Option<&'a Arc<TlsContext>> {
    contexts.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

fn load_certs(path: &Path) -> ConfigResult<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).map_err(ConfigError::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(ConfigError::Io)
}

fn load_key(path: &Path, password: Option<&str>) -> Result<PrivateKeyDer<'static>, String> {
    if let Some(password) = password {
        let pem = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let (_, doc) = pkcs8::Document::from_pem(&pem)
            .map_err(|e| format!("bad encrypted key PEM: {e}"))?;
        let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(doc.as_bytes())
            .map_err(|e| format!("bad encrypted key: {e}"))?;
        let decrypted = encrypted
            .decrypt(password)
            .map_err(|e| format!("key decryption failed: {e}"))?;
        let key = PrivatePkcs8KeyDer::from(decrypted.as_bytes().to_vec());
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let file = fs::File::open(path).map_err(|e| e.to_string())?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no private key in {}", path.display()))
}

/// Does the peer certificate chain belong to the configured host?
///
/// The chain must not exceed [`MAX_CERT_DEPTH`] and the end-entity
/// certificate must carry a Common Name equal to the host,
/// case-insensitively. Chain signature validation has already happened in
/// the handshake.
pub fn peer_matches_host(certs: &[CertificateDer<'_>], host: &str) -> bool {
    if certs.len() > MAX_CERT_DEPTH {
        warn!(depth = certs.len(), "peer certificate chain too long");
        return false;
    }
    let Some(end_entity) = certs.first() else {
        warn!("peer sent no certificate");
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(end_entity) else {
        warn!("failed to parse peer certificate");
        return false;
    };
    for cn in cert.subject().iter_common_name() {
        match cn.as_str() {
            Ok(value) if value.eq_ignore_ascii_case(host) => {
                debug!(host, "found cn matching host");
                return true;
            }
            Ok(value) => warn!(cn = value, host, "cn not matching host"),
            Err(_) => continue,
        }
    }
    false
}

/// Chain validation via webpki with the name decision deferred.
///
/// The identity binding of this proxy is CN equality with the configured
/// host, checked after the handshake, so the webpki name-mismatch outcome
/// is not an error here. Everything else (trust anchor, expiry,
/// signatures) is.
#[derive(Debug)]
struct CnDeferredVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for CnDeferredVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if intermediates.len() + 1 > MAX_CERT_DEPTH {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            ));
        }
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
