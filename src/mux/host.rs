use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::model::{normalize_host_name, Certificate};

#[derive(Default)]
struct Tables {
    /// Host name (normalized) to its live certificate.
    certs: HashMap<String, Arc<CertifiedKey>>,
    /// Bound address to the host answering unmatched SNI there.
    defaults: HashMap<String, String>,
}

/// Live TLS state for every host: certificates are swapped in place, so a
/// rotation reaches the next handshake without rebinding any socket. A
/// handshake that already resolved its certificate completes under the old
/// key.
#[derive(Default)]
pub struct SniStore {
    tables: RwLock<Tables>,
}

impl SniStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_host_cert(&self, name: &str, cert: &Certificate) -> Result<()> {
        let certified = load_certified_key(cert)?;
        let name = normalize_host_name(name);
        self.tables.write().certs.insert(name.clone(), Arc::new(certified));
        info!(host = %name, "certificate installed");
        Ok(())
    }

    pub fn has_cert(&self, name: &str) -> bool {
        self.tables
            .read()
            .certs
            .contains_key(&normalize_host_name(name))
    }

    /// Removes the host's certificate and any default-host slots pointing at
    /// it. Subsequent unmatched SNI on those addresses fails the handshake.
    pub fn remove_host(&self, name: &str) {
        let name = normalize_host_name(name);
        let mut tables = self.tables.write();
        tables.certs.remove(&name);
        tables.defaults.retain(|_, host| host != &name);
    }

    /// Marks the host as the default for a bound address. The previous
    /// default (if any) is replaced in the same write, keeping the
    /// one-default-per-address invariant.
    pub fn set_default(&self, address: &str, name: &str) {
        let name = normalize_host_name(name);
        debug!(address, host = %name, "default TLS host set");
        self.tables
            .write()
            .defaults
            .insert(address.to_string(), name);
    }

    pub fn clear_default(&self, address: &str, name: &str) {
        let name = normalize_host_name(name);
        let mut tables = self.tables.write();
        if tables.defaults.get(address) == Some(&name) {
            tables.defaults.remove(address);
        }
    }

    /// Builds a server config for one bound address. The resolver reads the
    /// live tables on every handshake, so later cert and default updates
    /// flow through without rebuilding the config.
    pub fn server_config(self: &Arc<Self>, address: &str) -> Arc<ServerConfig> {
        let resolver = SniResolver {
            store: self.clone(),
            address: address.to_string(),
        };
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

/// SNI resolution for one bound address: exact host-name match first, then
/// that address's default host. No match fails the handshake.
struct SniResolver {
    store: Arc<SniStore>,
    address: String,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver")
            .field("address", &self.address)
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let tables = self.store.tables.read();
        if let Some(name) = client_hello.server_name() {
            if let Some(certified) = tables.certs.get(&normalize_host_name(name)) {
                return Some(certified.clone());
            }
        }
        tables
            .defaults
            .get(&self.address)
            .and_then(|host| tables.certs.get(host))
            .cloned()
    }
}

fn load_certified_key(cert: &Certificate) -> Result<CertifiedKey> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert.cert.as_bytes())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ProxyError::Config(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Config("no certificates in PEM".into()));
    }

    let key = rustls_pemfile::private_key(&mut cert.key.as_bytes())
        .map_err(|e| ProxyError::Config(format!("bad private key PEM: {e}")))?
        .ok_or_else(|| ProxyError::Config("no private key in PEM".into()))?;

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| ProxyError::Config(format!("private key rejected: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}
