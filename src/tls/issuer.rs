//! Per-host server certificates for intercepted TLS

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;

use super::ca::CertificateAuthority;
use super::cache::LeafCache;
use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Issues leaves signed by the loaded root and turns them into rustls configs.
pub struct LeafIssuer {
    ca: Arc<CertificateAuthority>,
    validity: Duration,
    cache: Option<LeafCache>,
}

impl std::fmt::Debug for LeafIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafIssuer")
            .field("validity", &self.validity)
            .field("cached", &self.cache_size())
            .finish()
    }
}

impl LeafIssuer {
    pub fn new(ca: Arc<CertificateAuthority>, config: &TlsConfig) -> Self {
        let validity = config.leaf_validity();
        Self {
            ca,
            validity,
            cache: LeafCache::new(config.leaf_cache_capacity, validity / 2),
        }
    }

    /// The signed leaf for `hostname`, chained to the root.
    pub fn certified_key_for(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(cache) = &self.cache {
            if let Some(key) = cache.get(hostname) {
                tracing::debug!(hostname = %hostname, "Reusing cached leaf certificate");
                return Ok(key);
            }
        }

        tracing::debug!(hostname = %hostname, "Issuing leaf certificate");
        let leaf = self.ca.issue(hostname, self.validity)?;
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&leaf.key_der)
            .map_err(|e| Error::tls(format!("Unusable leaf key: {}", e)))?;
        let key = Arc::new(CertifiedKey::new(
            vec![leaf.cert_der, self.ca.cert_der().clone()],
            signing_key,
        ));

        if let Some(cache) = &self.cache {
            cache.put(hostname.to_string(), Arc::clone(&key));
        }
        Ok(key)
    }

    /// A server config that presents the leaf for `hostname` regardless of SNI.
    pub fn server_config_for_host(&self, hostname: &str) -> Result<ServerConfig> {
        let key = self.certified_key_for(hostname)?;
        Ok(http1_only(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(FixedLeaf(key))),
        ))
    }

    /// A server config that picks the leaf from the client's SNI.
    pub fn sni_server_config(self: &Arc<Self>) -> ServerConfig {
        http1_only(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::clone(self) as Arc<dyn ResolvesServerCert>),
        )
    }

    pub fn cache_size(&self) -> usize {
        self.cache.as_ref().map_or(0, LeafCache::len)
    }
}

impl ResolvesServerCert for LeafIssuer {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(sni) = client_hello.server_name() else {
            tracing::debug!("TLS client sent no SNI, refusing handshake");
            return None;
        };
        match self.certified_key_for(sni) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(hostname = %sni, error = %e, "Failed to issue certificate");
                None
            }
        }
    }
}

#[derive(Debug)]
struct FixedLeaf(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedLeaf {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

fn http1_only(mut config: ServerConfig) -> ServerConfig {
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::ca::GeneratedCa;

    fn issuer(capacity: usize) -> LeafIssuer {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let generated = GeneratedCa::generate().unwrap();
        let ca = CertificateAuthority::from_pem(&generated.cert_pem, &generated.key_pem).unwrap();
        let config = TlsConfig {
            leaf_cache_capacity: capacity,
            ..TlsConfig::default()
        };
        LeafIssuer::new(Arc::new(ca), &config)
    }

    #[test]
    fn test_chain_is_leaf_then_root() {
        let issuer = issuer(0);
        let key = issuer.certified_key_for("pypi.org").unwrap();
        assert_eq!(key.cert.len(), 2);
        assert_eq!(&key.cert[1], issuer.ca.cert_der());
    }

    #[test]
    fn test_fresh_leaf_without_cache() {
        let issuer = issuer(0);
        let first = issuer.certified_key_for("pypi.org").unwrap();
        let second = issuer.certified_key_for("pypi.org").unwrap();
        assert_ne!(first.cert[0], second.cert[0]);
        assert_eq!(issuer.cache_size(), 0);
    }

    #[test]
    fn test_cached_leaf_reused() {
        let issuer = issuer(16);
        let first = issuer.certified_key_for("pypi.org").unwrap();
        let second = issuer.certified_key_for("pypi.org").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        issuer.certified_key_for("files.pythonhosted.org").unwrap();
        assert_eq!(issuer.cache_size(), 2);
    }

    #[test]
    fn test_server_config_offers_http1_only() {
        let issuer = issuer(0);
        let config = issuer.server_config_for_host("pypi.org").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let sni = Arc::new(issuer).sni_server_config();
        assert_eq!(sni.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
