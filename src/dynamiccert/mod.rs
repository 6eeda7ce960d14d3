//! Dynamic server certificate provider.
//!
//! Supplies the current TLS keypair to the rustls handshake and hot-swaps
//! it when the files on disk change, so certificate rotation needs no
//! restart. The last good keypair keeps being served when a reload fails.

use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Error;

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// A TLS certificate resolver that periodically re-reads its keypair
/// from disk.
pub struct DynamicCertificate {
    cert_path: PathBuf,
    key_path: PathBuf,
    interval: Duration,
    current: RwLock<Arc<CertifiedKey>>,
}

impl fmt::Debug for DynamicCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicCertificate")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("interval", &self.interval)
            .finish()
    }
}

impl DynamicCertificate {
    /// Load the keypair synchronously; fails if the files are unreadable
    /// or do not form a valid pair.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Result<Self, Error> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();
        let current = load_certified_key(&cert_path, &key_path)?;
        Ok(Self {
            cert_path,
            key_path,
            interval: DEFAULT_REFRESH_INTERVAL,
            current: RwLock::new(current),
        })
    }

    /// Override the refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The certificate currently served at handshake time.
    pub fn current(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.current.read())
    }

    /// Re-read the keypair and swap it in when the chain bytes differ.
    ///
    /// Returns `Ok(true)` if a new certificate was installed.
    fn reload(&self) -> Result<bool, Error> {
        let fresh = load_certified_key(&self.cert_path, &self.key_path)?;
        let mut current = self.current.write();
        if chains_equal(&fresh.cert, &current.cert) {
            return Ok(false);
        }
        *current = fresh;
        Ok(true)
    }

    /// Refresh the keypair on a fixed interval until `shutdown` fires.
    ///
    /// Reload failures are logged; the previous keypair stays in place.
    pub async fn refresh(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.reload() {
                    Ok(true) => info!("certificate was reloaded"),
                    Ok(false) => {}
                    Err(error) => error!(%error, "failed to reload certificates"),
                },
            }
        }
    }
}

impl ResolvesServerCert for DynamicCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

fn chains_equal(a: &[CertificateDer<'_>], b: &[CertificateDer<'_>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>, Error> {
    let cert_pem = std::fs::read(cert_path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("cannot parse {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(Error::tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_pem = std::fs::read(key_path)?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
        .map_err(|e| Error::tls(format!("cannot parse {}: {e}", key_path.display())))?
        .ok_or_else(|| {
            Error::tls(format!("no private key found in {}", key_path.display()))
        })?;

    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or_else(|| Error::tls("rustls crypto provider is not installed"))?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| Error::tls(format!("cannot load private key: {e}")))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Build the server TLS configuration around the dynamic resolver.
///
/// rustls only negotiates TLS 1.2 and newer, which is the required floor.
pub fn server_config(resolver: Arc<DynamicCertificate>) -> rustls::ServerConfig {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}
