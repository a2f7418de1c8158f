//! Crypto capabilities behind a swappable provider.
//!
//! The protocol engine only ever talks to [`CryptoProvider`]; which backend
//! performs the work is decided once, at [`Directory`](crate::Directory)
//! construction. Two interchangeable backends ship with the crate:
//!
//! - [`RustCryptoProvider`] — pure-code, via the `rsa` and `x509-cert`
//!   crates (the default);
//! - [`OpensslCliProvider`] — drives the `openssl` binary in subprocesses.
//!
//! Both must produce identical outputs for identical inputs.

use std::fmt;

use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::error::Result;

mod openssl_cli;
mod rustcrypto;

pub use self::{openssl_cli::OpensslCliProvider, rustcrypto::RustCryptoProvider};

/// RSA modulus size used when the caller does not bring their own key.
pub const DEFAULT_KEY_BITS: u32 = 2048;

/// Subject contents for a certificate signing request.
///
/// `alt_names` become a Subject Alternative Name extension; entries that
/// parse as IP addresses are encoded as iPAddress (type 7), everything else
/// as dNSName (type 2), per RFC 5280.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrParams {
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub organization: Option<String>,
    pub organization_unit: Option<String>,
}

impl CsrParams {
    /// Parameters for a certificate covering `domains`, the first of which
    /// becomes the Common Name. All of them are listed in the SAN.
    pub fn for_domains<I, S>(domains: I) -> CsrParams
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let alt_names: Vec<String> = domains.into_iter().map(Into::into).collect();
        CsrParams {
            common_name: alt_names.first().cloned().unwrap_or_default(),
            alt_names,
            ..CsrParams::default()
        }
    }
}

/// A freshly built CSR along with the private key that signed it.
pub struct KeyedCsr {
    pub private_key_pem: Zeroizing<String>,
    pub csr_pem: String,
}

impl fmt::Debug for KeyedCsr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCsr")
            .field("csr_pem", &self.csr_pem)
            .finish_non_exhaustive()
    }
}

/// Names extracted from a CSR, SAN order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrDomains {
    pub common_name: Option<String>,
    pub alt_names: Vec<String>,
}

impl CsrDomains {
    /// The identifiers a certificate order for this CSR must cover: the
    /// common name first, then the alt names, deduplicated.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        for name in self.common_name.iter().chain(self.alt_names.iter()) {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        out
    }
}

/// Subject names and validity window parsed from a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub alt_names: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// The capability set the protocol engine requires from a crypto backend.
///
/// PEM in, PEM (or raw bytes) out; no backend types leak through the
/// interface, which is what keeps the two implementations interchangeable.
pub trait CryptoProvider: fmt::Debug + Send + Sync {
    /// Generates an RSA private key, returned as PKCS#8 PEM.
    fn generate_private_key(&self, bits: u32) -> Result<Zeroizing<String>>;

    /// The public modulus of a private key or certificate PEM, big-endian
    /// with no superfluous leading zeroes.
    fn modulus(&self, pem: &str) -> Result<Vec<u8>>;

    /// The public exponent of a private key or certificate PEM, big-endian
    /// with no superfluous leading zeroes.
    fn public_exponent(&self, pem: &str) -> Result<Vec<u8>>;

    /// RSASSA-PKCS1-v1_5 signature over SHA-256 of `data`.
    fn sign_rs256(&self, key_pem: &str, data: &[u8]) -> Result<Vec<u8>>;

    /// Builds a SHA-256-signed PKCS#10 request. A fresh
    /// [`DEFAULT_KEY_BITS`] key is generated when `key_pem` is `None`.
    fn create_csr(&self, params: &CsrParams, key_pem: Option<&str>) -> Result<KeyedCsr>;

    /// Extracts the common name and SAN entries from a CSR PEM.
    fn csr_domains(&self, csr_pem: &str) -> Result<CsrDomains>;

    /// Extracts subject names and the validity window from a certificate
    /// PEM.
    fn certificate_info(&self, cert_pem: &str) -> Result<CertificateInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_params_for_domains() {
        let params = CsrParams::for_domains(["example.com", "www.example.com"]);
        assert_eq!(params.common_name, "example.com");
        assert_eq!(params.alt_names, ["example.com", "www.example.com"]);
    }

    #[test]
    fn test_identifiers_dedup_cn_first() {
        let domains = CsrDomains {
            common_name: Some("example.com".to_owned()),
            alt_names: vec![
                "www.example.com".to_owned(),
                "example.com".to_owned(),
                "www.example.com".to_owned(),
            ],
        };

        assert_eq!(domains.identifiers(), ["example.com", "www.example.com"]);
    }
}
