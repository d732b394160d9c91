//! pkgproxy - A caching MITM proxy for pip/PyPI and RPM downloads
//!
//! Package managers are pointed at the proxy with `HTTP_PROXY`/`HTTPS_PROXY`.
//! Every `GET` is answered from a flat on-disk cache, fetching from the origin
//! once on a miss. CONNECT tunnels are terminated with leaf certificates signed
//! by a local root CA so that HTTPS downloads are cached too.
//!
//! # Example
//!
//! ```no_run
//! use pkgproxy::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("pkgproxy.toml")?;
//!     let server = ProxyServer::new(config)?;
//!     let (_tx, rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(rx).await?;
//!     Ok(())
//! }
//! ```

pub mod access_log;
pub mod cache;
pub mod config;
pub mod error;
pub mod hashing;
pub mod proxy;
pub mod tls;

pub use access_log::{AccessEntry, AccessEvent, AccessLog, Transport};
pub use cache::{cache_key, content_type_for, CacheRequest, CacheStore, Resolution, Resolved};
pub use config::{Config, TunnelResponseMode};
pub use error::{Error, Result};
pub use proxy::{BoundAddresses, ProxyServer};
pub use tls::{CertificateAuthority, GeneratedCa, LeafIssuer};
