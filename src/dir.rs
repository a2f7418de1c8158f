use std::{sync::Arc, time::Duration};

use crate::{
    acc::{Account, AcmeKey},
    api,
    crypto::{CryptoProvider, RustCryptoProvider, DEFAULT_KEY_BITS},
    error::{Error, Result},
    req::{req_expect_header, req_handle_error, Http},
    retry::RetryPolicy,
    trans::{NoncePool, Transport},
    util::read_json,
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates.
    /// The root signing certificate is not supposed to be in any trust
    /// chains.
    LetsEncryptStaging,

    /// Provide an arbitrary directory URL to connect to.
    Other(&'a str),
}

impl DirectoryUrl<'_> {
    fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// Client knobs beyond the directory URL.
///
/// The defaults match what the crate would pick on its own: the pure-code
/// crypto backend, five polling attempts spaced 5–30 s apart, a 30 s HTTP
/// timeout, and a `acme-core/<version> (<os>)` User-Agent.
#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    /// Crypto backend used for all key, CSR, and signing operations.
    pub crypto: Arc<dyn CryptoProvider>,

    /// Backoff settings shared by all polling loops of this client.
    pub retry: RetryPolicy,

    /// Per-request HTTP timeout.
    pub http_timeout: Duration,

    /// Value of the `User-Agent` header on every request.
    pub user_agent: String,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        DirectoryOptions {
            crypto: Arc::new(RustCryptoProvider::new()),
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(30),
            user_agent: format!(
                "{}/{} ({})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS
            ),
        }
    }
}

/// Entry point for accessing an ACME API.
///
/// The directory document is fetched once and cached for the lifetime of
/// this value; resources are immutable for a given directory URL within a
/// client's lifetime.
#[derive(Clone)]
pub struct Directory {
    nonce_pool: Arc<NoncePool>,
    api_directory: api::Directory,
    http: Http,
    crypto: Arc<dyn CryptoProvider>,
    retry: RetryPolicy,
}

impl Directory {
    /// Fetches a directory with default [`DirectoryOptions`].
    pub async fn fetch(url: DirectoryUrl<'_>) -> Result<Directory> {
        Self::fetch_with(url, DirectoryOptions::default()).await
    }

    /// Fetches a directory over explicit client options.
    pub async fn fetch_with(url: DirectoryUrl<'_>, options: DirectoryOptions) -> Result<Directory> {
        let http = Http::new(&options.user_agent, options.http_timeout)?;

        let res = req_handle_error(http.get(url.to_url()).await?, &[200]).await?;
        let api_directory: api::Directory = read_json(res).await?;

        let nonce_pool = Arc::new(NoncePool::new(&api_directory.new_nonce));

        Ok(Directory {
            nonce_pool,
            api_directory,
            http,
            crypto: options.crypto,
            retry: options.retry,
        })
    }

    /// URL of the server's terms of service, when it advertises one.
    pub fn terms_of_service(&self) -> Option<&str> {
        self.api_directory
            .meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.as_deref())
    }

    /// Registers a new account under a freshly generated RSA key.
    ///
    /// `contact` entries use URL form, e.g. `mailto:admin@example.com`.
    /// Registration requires agreeing to the server's terms of service.
    pub async fn register_account(
        &self,
        contact: Option<Vec<String>>,
        terms_of_service_agreed: bool,
    ) -> Result<Account> {
        let acme_key = AcmeKey::generate(&*self.crypto, DEFAULT_KEY_BITS)?;
        self.upsert_account(acme_key, contact, terms_of_service_agreed)
            .await
    }

    /// Creates or finds the account belonging to `private_key_pem`.
    ///
    /// The server answers 201 for a newly created account and 200 when the
    /// key is already registered; both succeed here, and the account URL is
    /// taken from the `Location` header either way.
    pub async fn load_account(
        &self,
        private_key_pem: &str,
        contact: Option<Vec<String>>,
        terms_of_service_agreed: bool,
    ) -> Result<Account> {
        let acme_key = AcmeKey::from_pem(private_key_pem, &*self.crypto)?;
        self.upsert_account(acme_key, contact, terms_of_service_agreed)
            .await
    }

    /// Finds the existing account belonging to `private_key_pem` without
    /// ever creating one (`onlyReturnExisting`, RFC 8555 §7.3.1).
    pub async fn load_existing_account(&self, private_key_pem: &str) -> Result<Account> {
        let acme_key = AcmeKey::from_pem(private_key_pem, &*self.crypto)?;

        let acc = api::Account {
            only_return_existing: Some(true),
            ..api::Account::default()
        };

        let mut transport = self.new_transport(acme_key);

        let res = transport
            .call_jwk(&self.api_directory.new_account, &acc, &[200])
            .await?;

        let kid = req_expect_header(&res, "location")?;
        log::debug!("Key ID is: {kid}");
        let api_account: api::Account = read_json(res).await?;

        // fill in the server returned key ID
        transport.set_key_id(kid.clone());

        Ok(self.assemble_account(transport, api_account, kid))
    }

    /// Binds to a pre-known account URL, validating it with an
    /// updateAccount POST. A stale or foreign URL surfaces as the server's
    /// error instead of silently re-registering.
    pub async fn load_account_with_url(
        &self,
        private_key_pem: &str,
        account_url: &str,
    ) -> Result<Account> {
        let acme_key = AcmeKey::from_pem(private_key_pem, &*self.crypto)?;

        let mut transport = self.new_transport(acme_key);
        transport.set_key_id(account_url.to_owned());

        let res = transport
            .call_kid(account_url, &api::EmptyObject, &[200, 202])
            .await?;
        let api_account: api::Account = read_json(res).await?;

        Ok(self.assemble_account(transport, api_account, account_url.to_owned()))
    }

    async fn upsert_account(
        &self,
        acme_key: AcmeKey,
        contact: Option<Vec<String>>,
        terms_of_service_agreed: bool,
    ) -> Result<Account> {
        if !terms_of_service_agreed {
            return Err(Error::Config(
                "account registration requires agreeing to the terms of service".to_owned(),
            ));
        }

        // Prepare making a call to newAccount. This is fine to do both for
        // new keys and existing. For existing keys the server returns 200
        // with the Location header set to the key ID (kid); for new ones it
        // returns 201.
        let acc = api::Account {
            contact,
            terms_of_service_agreed: Some(true),
            ..api::Account::default()
        };

        let mut transport = self.new_transport(acme_key);
        let res = transport
            .call_jwk(&self.api_directory.new_account, &acc, &[200, 201])
            .await?;

        let kid = req_expect_header(&res, "location")?;
        log::debug!("Key ID is: {kid}");
        let api_account: api::Account = read_json(res).await?;

        // fill in the server returned key ID
        transport.set_key_id(kid.clone());

        Ok(self.assemble_account(transport, api_account, kid))
    }

    fn new_transport(&self, acme_key: AcmeKey) -> Transport {
        Transport::new(
            Arc::clone(&self.nonce_pool),
            self.http.clone(),
            Arc::clone(&self.crypto),
            acme_key,
        )
    }

    fn assemble_account(
        &self,
        transport: Transport,
        api_account: api::Account,
        account_url: String,
    ) -> Account {
        Account::new(
            transport,
            api_account,
            account_url,
            self.api_directory.clone(),
            Arc::clone(&self.crypto),
            self.retry,
            self.http.clone(),
        )
    }

    /// Returns a reference to the directory's API object.
    ///
    /// Useful for debugging.
    pub fn api_directory(&self) -> &api::Directory {
        &self.api_directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_directory() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        assert!(dir.api_directory().new_account.ends_with("/acme/new-acct"));
        assert!(dir.terms_of_service().unwrap().ends_with("/terms"));
    }

    #[tokio::test]
    async fn test_create_account() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let acc = dir
            .register_account(Some(vec!["mailto:foo@bar.com".to_owned()]), true)
            .await
            .unwrap();

        assert!(acc.account_url().ends_with("/acme/acct/1"));
    }

    #[tokio::test]
    async fn test_registration_requires_tos_agreement() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let err = dir.register_account(None, false).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_existing_account_discovered_via_200() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        // first registration creates (201), the second call with the same
        // key must be treated as "found", not as an error
        let first = dir
            .load_account(crate::test::TEST_KEY_1, None, true)
            .await
            .unwrap();
        let second = dir
            .load_account(crate::test::TEST_KEY_1, None, true)
            .await
            .unwrap();

        assert_eq!(first.account_url(), second.account_url());
    }

    #[tokio::test]
    async fn test_load_existing_account_unknown_key_fails() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let err = dir
            .load_existing_account(crate::test::TEST_KEY_2)
            .await
            .unwrap_err();

        match err {
            Error::Protocol(problem) => {
                assert_eq!(problem.error_name(), "accountDoesNotExist");
            }
            other => panic!("expected protocol error, got: {other}"),
        }
    }

    #[tokio::test]
    async fn test_load_account_with_url() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let acc = dir
            .load_account(crate::test::TEST_KEY_1, None, true)
            .await
            .unwrap();
        let account_url = acc.account_url();

        let rebound = dir
            .load_account_with_url(crate::test::TEST_KEY_1, &account_url)
            .await
            .unwrap();

        assert_eq!(rebound.account_url(), account_url);
    }
}
