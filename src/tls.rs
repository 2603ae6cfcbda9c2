//! TLS setup for both roles
//!
//! The server side terminates TLS 1.2+ with certificates selected per
//! SNI; the agent side dials out with the webpki root store. When
//! forward secrecy is requested, the AEAD suite order follows the CPU:
//! AES-GCM first where hardware AES is available, ChaCha20-Poly1305
//! first otherwise.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::{
    self,
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite,
};

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Build the listener-side TLS configuration from the configured
/// certificate pairs.
pub fn server_config(cfg: &TlsConfig) -> Result<Arc<ServerConfig>> {
    if cfg.certs.is_empty() {
        return Err(Error::Config("empty TLS certs".into()));
    }

    let mut resolver = CertResolver::default();
    for pair in &cfg.certs {
        let certs = load_certs(&pair.cert)?;
        let key = load_private_key(&pair.key)?;
        let signing_key = ring::sign::any_supported_type(&key)
            .map_err(|e| Error::Tls(format!("unusable private key {}: {}", pair.key, e)))?;
        let certified = Arc::new(CertifiedKey::new(certs, signing_key));
        if pair.sni.is_empty() {
            resolver.fallback = Some(certified);
        } else {
            for name in &pair.sni {
                resolver.by_name.insert(name.clone(), certified.clone());
            }
        }
    }

    let provider = CryptoProvider {
        cipher_suites: if cfg.fs {
            forward_secure_suites()
        } else {
            ring::DEFAULT_CIPHER_SUITES.to_vec()
        },
        ..ring::default_provider()
    };

    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

    Ok(Arc::new(config))
}

/// Build the agent-side TLS configuration (webpki trust roots).
pub fn client_config() -> Arc<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// `TLSv1.3-TLS13_AES_128_GCM_SHA256` style summary for connection logs.
pub fn tls_format(conn: &rustls::ServerConnection) -> String {
    let version = match conn.protocol_version() {
        Some(rustls::ProtocolVersion::TLSv1_2) => "TLSv1.2",
        Some(rustls::ProtocolVersion::TLSv1_3) => "TLSv1.3",
        _ => "TLS",
    };
    match conn.negotiated_cipher_suite() {
        Some(suite) => format!("{}-{:?}", version, suite.suite()),
        None => version.to_string(),
    }
}

/// Certificate selection by exact SNI match, with an optional fallback
/// pair for clients that send no recognized name.
#[derive(Default)]
struct CertResolver {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl CertResolver {
    fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            if let Some(certified) = self.by_name.get(name) {
                return Some(certified.clone());
            }
        }
        self.fallback.clone()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.lookup(client_hello.server_name())
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver")
            .field("names", &self.by_name.keys())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates found in {}", path)));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let items = rustls_pemfile::read_all(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse private key: {}", e)))?;

    for item in items {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(Error::Config(format!("no valid private key found in {}", path)))
}

/// ECDHE AEAD suites for TLS 1.2 plus the TLS 1.3 suites, ordered by
/// what the CPU encrypts fastest.
fn forward_secure_suites() -> Vec<SupportedCipherSuite> {
    use tokio_rustls::rustls::crypto::ring::cipher_suite as suite;

    let tls13_aes = [
        suite::TLS13_AES_128_GCM_SHA256,
        suite::TLS13_AES_256_GCM_SHA384,
    ];
    let tls13_chacha = [suite::TLS13_CHACHA20_POLY1305_SHA256];
    let tls12_aes = [
        suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ];
    let tls12_chacha = [
        suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ];

    let mut suites = Vec::new();
    if aes_accelerated() {
        suites.extend(tls13_aes);
        suites.extend(tls13_chacha);
        suites.extend(tls12_aes);
        suites.extend(tls12_chacha);
    } else {
        suites.extend(tls13_chacha);
        suites.extend(tls13_aes);
        suites.extend(tls12_chacha);
        suites.extend(tls12_aes);
    }
    suites
}

#[cfg(target_arch = "x86_64")]
fn aes_accelerated() -> bool {
    std::is_x86_feature_detected!("aes") && std::is_x86_feature_detected!("pclmulqdq")
}

#[cfg(target_arch = "aarch64")]
fn aes_accelerated() -> bool {
    std::arch::is_aarch64_feature_detected!("aes")
        && std::arch::is_aarch64_feature_detected!("pmull")
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn aes_accelerated() -> bool {
    false
}
