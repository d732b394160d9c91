//! TLS and certificate management

mod ca;
mod cache;
mod issuer;

pub use ca::{CertificateAuthority, GeneratedCa, IssuedLeaf};
pub use issuer::LeafIssuer;
