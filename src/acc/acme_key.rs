use std::fmt;

use zeroize::Zeroizing;

use crate::{
    crypto::CryptoProvider,
    error::Result,
    jws::Jwk,
};

/// The RSA account key plus the key ID assigned by the ACME server.
///
/// The key itself only ever exists as PEM; all operations on it go through
/// the crypto provider.
#[derive(Clone)]
pub(crate) struct AcmeKey {
    private_key_pem: Zeroizing<String>,

    /// Set once we contacted the ACME API to figure out the key ID.
    key_id: Option<String>,
}

impl AcmeKey {
    /// Generates a fresh RSA key via the crypto provider.
    pub(crate) fn generate(crypto: &dyn CryptoProvider, bits: u32) -> Result<AcmeKey> {
        let pem = crypto.generate_private_key(bits)?;
        Ok(Self::from_zeroizing(pem))
    }

    /// Wraps an existing PEM key, verifying it parses as RSA.
    pub(crate) fn from_pem(pem: &str, crypto: &dyn CryptoProvider) -> Result<AcmeKey> {
        // cheapest full-parse validation the provider offers
        crypto.modulus(pem)?;
        Ok(Self::from_zeroizing(Zeroizing::new(pem.to_owned())))
    }

    fn from_zeroizing(private_key_pem: Zeroizing<String>) -> AcmeKey {
        AcmeKey {
            private_key_pem,
            key_id: None,
        }
    }

    pub(crate) fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub(crate) fn to_pem(&self) -> Zeroizing<String> {
        self.private_key_pem.clone()
    }

    pub(crate) fn jwk(&self, crypto: &dyn CryptoProvider) -> Result<Jwk> {
        Jwk::from_pem(&self.private_key_pem, crypto)
    }

    pub(crate) fn key_id(&self) -> &str {
        self.key_id.as_deref().expect("key_id not set")
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid);
    }
}

impl fmt::Debug for AcmeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
