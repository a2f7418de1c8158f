use std::io::{BufReader, Cursor};

use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::{
    crypto::{CertificateInfo, CryptoProvider},
    error::{Error, Result},
};

/// Encapsulated certificate chain and, when this crate generated it, the
/// matching private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    private_key_pem: Option<Zeroizing<String>>,
    certificate: String,
}

impl Certificate {
    pub(crate) fn new(private_key_pem: Option<Zeroizing<String>>, certificate: String) -> Self {
        Certificate {
            private_key_pem,
            certificate,
        }
    }

    /// Wraps an existing chain + key pair, e.g. loaded from disk.
    pub fn parse(private_key_pem: Option<Zeroizing<String>>, certificate: String) -> Self {
        Certificate {
            private_key_pem,
            certificate,
        }
    }

    /// The private key in PEM format, when one was generated alongside the
    /// order.
    pub fn private_key(&self) -> Option<&str> {
        self.private_key_pem.as_deref().map(String::as_str)
    }

    /// The issued certificate chain in PEM format, end-entity first.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// The end-entity certificate in DER encoding.
    pub fn certificate_der(&self) -> Result<Vec<u8>> {
        self.certificate_chain()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Crypto("no certificates in chain".to_owned()))
    }

    /// The issued certificate chain in DER format.
    pub fn certificate_chain(&self) -> Result<Vec<Vec<u8>>> {
        let mut rdr = BufReader::new(Cursor::new(self.certificate()));

        rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| Error::Crypto(format!("PEM chain: {err}")))
    }

    /// Subject names and validity window of the end-entity certificate.
    pub fn info(&self, crypto: &dyn CryptoProvider) -> Result<CertificateInfo> {
        crypto.certificate_info(&self.certificate)
    }

    /// Inspect the certificate to count the number of (whole) valid days
    /// left.
    ///
    /// It's up to the ACME API provider to decide how long an issued
    /// certificate is valid. Let's Encrypt sets the validity to 90 days.
    /// This function reports 89 days for a newly issued cert, since it
    /// counts _whole_ days.
    ///
    /// It is possible to get negative days for an expired certificate.
    pub fn valid_days_left(&self, crypto: &dyn CryptoProvider) -> Result<i64> {
        let info = self.info(crypto)?;
        let diff = info.not_after - OffsetDateTime::now_utc();

        Ok(diff.whole_days())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::RustCryptoProvider, test::TEST_CERT_CHAIN};

    #[test]
    fn test_chain_split_and_der() {
        let cert = Certificate::parse(None, TEST_CERT_CHAIN.to_owned());

        let chain = cert.certificate_chain().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(cert.certificate_der().unwrap(), chain[0]);
        assert!(cert.private_key().is_none());
    }

    #[test]
    fn test_certificate_info() {
        let cert = Certificate::parse(None, TEST_CERT_CHAIN.to_owned());
        let crypto = RustCryptoProvider::new();

        let info = cert.info(&crypto).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("acme-test.example.com"));
        assert_eq!(info.alt_names, ["acme-test.example.com"]);
        assert!(info.not_after > info.not_before);

        // the fixture is valid for years
        assert!(cert.valid_days_left(&crypto).unwrap() > 365);
    }
}
