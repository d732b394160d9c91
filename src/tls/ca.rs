//! Root certificate authority and leaf issuance

use rand::{rngs::OsRng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384, PKCS_ED25519,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

const ORGANIZATION: &str = "pkgproxy";
const CLOCK_SKEW: time::Duration = time::Duration::minutes(5);

/// A generated CA certificate and key pair
pub struct GeneratedCa {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key
    pub key_pem: String,
}

impl GeneratedCa {
    /// Generate a new P-256 root CA valid for ten years
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "pkgproxy Root CA");
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());

        params.not_before = time::OffsetDateTime::now_utc() - CLOCK_SKEW;
        params.not_after = params.not_before + time::Duration::days(3650);

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::certificate(e.to_string()))?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(e.to_string()))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Save the certificate and key to files
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path.as_ref(), &self.cert_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write certificate to '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        std::fs::write(key_path.as_ref(), &self.key_pem).map_err(|e| {
            Error::certificate(format!(
                "Failed to write key to '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(key_path.as_ref())?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(key_path.as_ref(), perms)?;
        }

        Ok(())
    }
}

/// A leaf certificate and its freshly generated private key
pub struct IssuedLeaf {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

/// The loaded root: read once at startup, shared read-only afterwards
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load a CA from a PEM certificate and a PKCS#8 PEM private key (RSA or EC)
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let mut cert_reader = BufReader::new(cert_pem.as_bytes());
        let cert_der = match rustls_pemfile::certs(&mut cert_reader).next() {
            Some(Ok(cert)) => cert,
            Some(Err(e)) => {
                return Err(Error::certificate(format!(
                    "Failed to decode CA certificate PEM: {}",
                    e
                )))
            }
            None => return Err(Error::certificate("No certificate found in CA PEM")),
        };

        let mut key_reader = BufReader::new(key_pem.as_bytes());
        match rustls_pemfile::private_key(&mut key_reader) {
            Ok(Some(PrivateKeyDer::Pkcs8(_))) => {}
            Ok(Some(_)) => {
                return Err(Error::certificate(
                    "CA private key must be PKCS#8 (BEGIN PRIVATE KEY)",
                ))
            }
            Ok(None) => return Err(Error::certificate("No private key found in CA key PEM")),
            Err(e) => {
                return Err(Error::certificate(format!(
                    "Failed to decode CA private key PEM: {}",
                    e
                )))
            }
        }

        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA private key: {}", e)))?;
        if key_pair.algorithm() == &PKCS_ED25519 {
            return Err(Error::certificate(
                "Unsupported CA key type: expected RSA or EC",
            ));
        }
        let alg = key_pair.algorithm();
        if alg == &PKCS_ECDSA_P256_SHA256 || alg == &PKCS_ECDSA_P384_SHA384 {
            tracing::info!("Loaded an EC CA private key");
        } else {
            tracing::info!("Loaded an RSA CA private key");
        }

        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;

        Ok(Self { issuer, cert_der })
    }

    /// Load a CA from files
    pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA certificate '{}': {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;

        let key_pem = std::fs::read_to_string(key_path.as_ref()).map_err(|e| {
            Error::certificate(format!(
                "Failed to read CA key '{}': {}",
                key_path.as_ref().display(),
                e
            ))
        })?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Issue a server certificate for `hostname`, valid for `validity` from now.
    ///
    /// Every call generates a new P-256 key and a random serial. IP literals
    /// get an IP SAN, everything else a DNS SAN.
    pub fn issue(&self, hostname: &str, validity: Duration) -> Result<IssuedLeaf> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;

        let san = match hostname.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => {
                ServerName::try_from(hostname).map_err(|e| {
                    Error::certificate(format!("Invalid hostname '{}': {}", hostname, e))
                })?;
                SanType::DnsName(hostname.try_into().map_err(|e| {
                    Error::certificate(format!("Invalid hostname '{}': {}", hostname, e))
                })?)
            }
        };
        params.subject_alt_names = vec![san];

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());

        let validity = time::Duration::try_from(validity)
            .map_err(|e| Error::certificate(format!("Invalid leaf validity: {}", e)))?;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = now
            .checked_add(validity)
            .ok_or_else(|| Error::certificate("Leaf validity exceeds supported range"))?;

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::certificate(format!("Failed to generate leaf key: {}", e)))?;

        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| Error::certificate(format!("Failed to sign certificate: {}", e)))?;

        Ok(IssuedLeaf {
            cert_der: CertificateDer::from(cert.der().to_vec()),
            key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        })
    }

    /// Get the CA certificate in DER format
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

/// Positive, non-zero 128-bit serial
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 0x7F;
    if bytes.iter().all(|byte| *byte == 0) {
        bytes[bytes.len() - 1] = 1;
    }
    SerialNumber::from(bytes.to_vec())
}
