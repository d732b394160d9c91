//! pkgproxy CLI - A caching MITM proxy for pip/PyPI and RPM downloads

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pkgproxy::{cache_key, content_type_for, Config, GeneratedCa, ProxyServer};

#[derive(Parser)]
#[command(name = "pkgproxy")]
#[command(about = "A caching MITM proxy for pip/PyPI and RPM downloads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to CA certificate (overrides config)
        #[arg(long, env = "CACERT")]
        ca_cert: Option<PathBuf>,

        /// Path to CA private key (overrides config)
        #[arg(long, env = "CAKEY")]
        ca_key: Option<PathBuf>,

        /// Cache directory (overrides config)
        #[arg(long, env = "PKGPROXY_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// Plaintext proxy listener (overrides config)
        #[arg(long)]
        http_bind: Option<String>,

        /// TLS listener; pass an empty string to disable (overrides config)
        #[arg(long)]
        https_bind: Option<String>,

        /// Log level (error, warn, info, debug, trace); defaults to the config value
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Generate a new root CA certificate
    GenerateCa {
        /// Output directory for ca.crt and ca.key
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Certificate filename
        #[arg(long, default_value = "ca.crt")]
        cert_name: String,

        /// Key filename
        #[arg(long, default_value = "ca.key")]
        key_name: String,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the cache key for a URL and whether it is cached
    CacheKey {
        /// Absolute URL as the proxy would see it
        url: String,

        /// Cache directory to look in
        #[arg(long, env = "PKGPROXY_CACHE_DIR")]
        cache_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            ca_cert,
            ca_key,
            cache_dir,
            http_bind,
            https_bind,
            log_level,
        } => {
            let mut cfg = match config {
                Some(ref path) => Config::from_file(path)?,
                None => Config::parse("")?,
            };

            let level = log_level.unwrap_or_else(|| cfg.logging.level.clone());
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            match config {
                Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
                None => tracing::info!("Using default configuration"),
            }

            if let Some(cert) = ca_cert {
                cfg.proxy.ca_cert = cert.to_string_lossy().to_string();
            }
            if let Some(key) = ca_key {
                cfg.proxy.ca_key = key.to_string_lossy().to_string();
            }
            if let Some(dir) = cache_dir {
                cfg.cache.dir = dir;
            }
            if let Some(addr) = http_bind {
                cfg.proxy.http_bind = addr;
            }
            if let Some(addr) = https_bind {
                cfg.proxy.https_bind = addr;
            }

            std::fs::create_dir_all(&cfg.cache.dir).map_err(|e| {
                format!(
                    "Failed to create cache directory '{}': {}",
                    cfg.cache.dir.display(),
                    e
                )
            })?;

            let http_bind = cfg.proxy.http_bind.clone();
            let server = match ProxyServer::new(cfg) {
                Ok(server) => server,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    eprintln!();
                    eprintln!("To generate a new CA certificate:");
                    eprintln!("  pkgproxy generate-ca --out ./certs/");
                    std::process::exit(1);
                }
            };

            tracing::info!("Configure clients with:");
            tracing::info!("  export HTTP_PROXY=http://{}", http_bind);
            tracing::info!("  export HTTPS_PROXY=http://{}", http_bind);

            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::GenerateCa {
            out,
            cert_name,
            key_name,
        } => {
            std::fs::create_dir_all(&out)?;

            let cert_path = out.join(&cert_name);
            let key_path = out.join(&key_name);

            println!("Generating CA certificate...");

            let ca = GeneratedCa::generate()?;
            ca.save(&cert_path, &key_path)?;

            println!("CA certificate generated successfully!");
            println!();
            println!("  Certificate: {}", cert_path.display());
            println!("  Private key: {}", key_path.display());
            println!();
            println!("To use with the proxy:");
            println!(
                "  pkgproxy run --ca-cert {} --ca-key {}",
                cert_path.display(),
                key_path.display()
            );
            println!();
            println!("Clients must trust the certificate, e.g. for pip:");
            println!("  pip config set global.cert {}", cert_path.display());
            println!();
            println!("IMPORTANT: Keep the private key secure!");
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  HTTP listener: {}", cfg.proxy.http_bind);
            if cfg.proxy.https_enabled() {
                println!("  TLS listener: {}", cfg.proxy.https_bind);
            } else {
                println!("  TLS listener: disabled");
            }
            println!("  CA cert: {}", cfg.proxy.ca_cert);
            println!("  CA key: {}", cfg.proxy.ca_key);
            println!("  Tunnel response: {:?}", cfg.proxy.tunnel_response);
            println!("  Connect probe: {}", cfg.proxy.connect_probe);
            println!("  Cache dir: {}", cfg.cache.dir.display());
            println!("  Secure hosts: {}", cfg.cache.secure_hosts.join(", "));
            println!("  Lock timeout: {}s", cfg.cache.lock_timeout_secs);
            println!("  Leaf validity: {}h", cfg.tls.leaf_validity_hours);
            println!("  Log level: {}", cfg.logging.level);
            println!(
                "  Access log: {}",
                cfg.logging.access_log.as_deref().unwrap_or("disabled")
            );
            if let Some(ref upstream) = cfg.proxy.upstream_override {
                println!("  Upstream override: {}", upstream);
            }
        }

        Commands::CacheKey { url, cache_dir } => {
            let key = cache_key(&url);
            println!("{}", key);
            println!("  Content-Type: {}", content_type_for(&url));

            if let Some(dir) = cache_dir {
                let path = dir.join(&key);
                if path.is_file() {
                    let digest = pkgproxy::hashing::sha256_file(&path).await?;
                    println!("  Cached: {}", path.display());
                    println!("  SHA-256: {}", digest);
                } else {
                    println!("  Cached: no");
                }
            }
        }
    }

    Ok(())
}
