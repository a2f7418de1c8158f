use std::{collections::HashSet, iter, sync::Arc};

use base64::prelude::*;
use parking_lot::RwLock;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::{
    api,
    cert::Certificate,
    crypto::{CryptoProvider, DEFAULT_KEY_BITS},
    error::Result,
    jws::{jws_with, JwsProtectedHeader},
    order::{NewOrder, Order},
    req::{req_expect_header, Http},
    retry::RetryPolicy,
    util::read_json,
};

mod acme_key;

pub(crate) use self::acme_key::AcmeKey;

#[derive(Debug)]
pub(crate) struct AccountInner {
    /// The transport slot. Key rollover is the only writer.
    transport: RwLock<crate::trans::Transport>,

    /// Readers are signed requests in flight; rollover takes the write half
    /// to quiesce them before swapping the key.
    in_flight: tokio::sync::RwLock<()>,

    pub(crate) api_account: RwLock<api::Account>,
    pub(crate) account_url: String,
    pub(crate) api_directory: api::Directory,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) retry: RetryPolicy,
    pub(crate) http: Http,
}

impl AccountInner {
    /// Signed POST with the account key ID, allowing concurrent requests
    /// but never one that races the key rollover swap.
    pub(crate) async fn call_kid<T>(
        &self,
        url: &str,
        body: &T,
        allowed: &[u16],
    ) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        let _flight = self.in_flight.read().await;
        let transport = self.transport.read().clone();
        transport.call_kid(url, body, allowed).await
    }

    pub(crate) fn jwk(&self) -> Result<crate::jws::Jwk> {
        self.transport.read().jwk()
    }
}

/// Account with an ACME provider.
///
/// Accounts are created through [`Directory`]: [`register_account()`] for a
/// fresh key, [`load_account()`] / [`load_existing_account()`] for a known
/// one. An account consists of optional contact addresses and the RSA
/// private key that signs every request against the API.
///
/// [`Directory`]: crate::Directory
/// [`register_account()`]: crate::Directory::register_account()
/// [`load_account()`]: crate::Directory::load_account()
/// [`load_existing_account()`]: crate::Directory::load_existing_account()
#[derive(Clone, Debug)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl Account {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: crate::trans::Transport,
        api_account: api::Account,
        account_url: String,
        api_directory: api::Directory,
        crypto: Arc<dyn CryptoProvider>,
        retry: RetryPolicy,
        http: Http,
    ) -> Self {
        Self {
            inner: Arc::new(AccountInner {
                transport: RwLock::new(transport),
                in_flight: tokio::sync::RwLock::new(()),
                api_account: RwLock::new(api_account),
                account_url,
                api_directory,
                crypto,
                retry,
                http,
            }),
        }
    }

    /// The account URL assigned at creation, used as the JWS `kid`.
    pub fn account_url(&self) -> String {
        self.inner.account_url.clone()
    }

    /// Private key for this account, as PKCS#8 PEM.
    pub fn private_key_pem(&self) -> Zeroizing<String> {
        self.inner.transport.read().acme_key().to_pem()
    }

    /// Updates the account's contact addresses.
    pub async fn update_account(&self, contact: Option<Vec<String>>) -> Result<api::Account> {
        let payload = api::Account {
            contact,
            ..api::Account::default()
        };

        let res = self
            .inner
            .call_kid(&self.inner.account_url, &payload, &[200, 202])
            .await?;
        let api_account: api::Account = read_json(res).await?;

        *self.inner.api_account.write() = api_account.clone();
        Ok(api_account)
    }

    /// Deactivates the account. Irreversible, see [RFC 8555 §7.3.6].
    ///
    /// [RFC 8555 §7.3.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.6
    pub async fn deactivate(&self) -> Result<api::Account> {
        let payload = api::Account {
            status: Some(api::AccountStatus::Deactivated),
            ..api::Account::default()
        };

        let res = self
            .inner
            .call_kid(&self.inner.account_url, &payload, &[200])
            .await?;
        let api_account: api::Account = read_json(res).await?;

        *self.inner.api_account.write() = api_account.clone();
        Ok(api_account)
    }

    /// Rolls the account over to a new RSA key (generated when `None`),
    /// per [RFC 8555 §7.3.5].
    ///
    /// The request is an inner JWS signed by the new key (carrying its JWK,
    /// no nonce) wrapped in an outer JWS signed by the current key. On
    /// success the client's signing key is swapped atomically: in-flight
    /// signed requests are quiesced first, and the nonce pool is drained.
    ///
    /// [RFC 8555 §7.3.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.5
    pub async fn change_key(&self, new_key_pem: Option<&str>) -> Result<()> {
        // no signed request may be in flight across the swap
        let _quiesce = self.inner.in_flight.write().await;

        let crypto = &self.inner.crypto;

        let new_key = match new_key_pem {
            Some(pem) => AcmeKey::from_pem(pem, &**crypto)?,
            None => AcmeKey::generate(&**crypto, DEFAULT_KEY_BITS)?,
        };

        let key_change_url = &self.inner.api_directory.key_change;

        let old_transport = self.inner.transport.read().clone();

        let payload = api::KeyChange {
            account: self.inner.account_url.clone(),
            old_key: old_transport.jwk()?,
        };

        let inner_protected =
            JwsProtectedHeader::new_jwk_no_nonce(new_key.jwk(&**crypto)?, key_change_url);
        let inner_jws = jws_with(inner_protected, &new_key, &**crypto, &payload)?;

        old_transport
            .call_kid(key_change_url, &inner_jws, &[200])
            .await?;

        self.inner.transport.write().swap_key(new_key);

        log::debug!("account key rolled over");
        Ok(())
    }

    /// Create a new order to issue a certificate for this account.
    ///
    /// Each order has a required `primary_name` (which will be set as the
    /// certificate's `CN`) and a variable number of `alt_names`, all deduplicated
    /// into dns identifiers. Wildcard names (`*.example.com`) are allowed and
    /// will restrict the authorization to the `dns-01` challenge.
    ///
    /// This library doesn't constrain the number of `alt_names`, but it is
    /// limited by the ACME API provider. Let's Encrypt [sets a max of 100 names]
    /// per certificate.
    ///
    /// Every call creates a new order with the ACME API provider, even when
    /// the domain names supplied are exactly the same.
    ///
    /// [sets a max of 100 names]: https://letsencrypt.org/docs/rate-limits/
    pub async fn new_order(&self, primary_name: &str, alt_names: &[&str]) -> Result<NewOrder> {
        let mut identifiers = Vec::new();
        let mut dedup = HashSet::new();
        for domain in iter::once(primary_name).chain(alt_names.iter().copied()) {
            if dedup.insert(domain) {
                identifiers.push(api::Identifier::dns(domain));
            }
        }

        let order = api::Order::from_identifiers(identifiers);

        let new_order_url = self.inner.api_directory.new_order.as_str();

        let res = self.inner.call_kid(new_order_url, &order, &[201]).await?;
        let order_url = req_expect_header(&res, "location")?;
        let api_order: api::Order = read_json(res).await?;

        let mut order = Order::new(&self.inner, order, order_url);
        order.api_order.overwrite(api_order)?;
        Ok(NewOrder { order })
    }

    /// Revoke a certificate for the reason given.
    pub async fn revoke_certificate(
        &self,
        cert: &Certificate,
        reason: RevocationReason,
    ) -> Result<()> {
        // convert to base64url of the DER (which is not PEM).
        let certificate = BASE64_URL_SAFE_NO_PAD.encode(cert.certificate_der()?);

        let reason = match reason {
            // > the reason code CRL entry extension SHOULD be absent instead of
            // > using the unspecified (0) reasonCode value
            // see <https://datatracker.ietf.org/doc/html/rfc5280#section-5.3.1>
            RevocationReason::Unspecified => None,

            reason => Some(reason as usize),
        };

        let revocation = api::Revocation::new(certificate, reason);

        let url = &self.inner.api_directory.revoke_cert;
        self.inner.call_kid(url, &revocation, &[200]).await?;

        Ok(())
    }

    pub(crate) fn inner(&self) -> &Arc<AccountInner> {
        &self.inner
    }

    /// Returns a copy of the account's API object.
    ///
    /// Useful for debugging.
    pub fn api_account(&self) -> api::Account {
        self.inner.api_account.read().clone()
    }
}

/// Enumeration of reasons for revocation.
///
/// The reason codes are taken from [RFC 5280 §5.3.1].
///
/// [RFC 5280 §5.3.1]: https://tools.ietf.org/html/rfc5280#section-5.3.1
pub enum RevocationReason {
    Unspecified = 0,
    KeyCompromise = 1,
    CACompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    // value 7 is not used
    RemoveFromCRL = 8,
    PrivilegeWithdrawn = 9,
    AACompromise = 10,
}

#[cfg(test)]
mod tests {
    use crate::{error::Error, Directory, DirectoryUrl};

    #[tokio::test]
    async fn test_create_order() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let acc = dir
            .register_account(Some(vec!["mailto:foo@bar.com".to_owned()]), true)
            .await
            .unwrap();

        let _order = acc.new_order("acme-test.example.com", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_account_contact() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let acc = dir.register_account(None, true).await.unwrap();

        let updated = acc
            .update_account(Some(vec!["mailto:new@example.com".to_owned()]))
            .await
            .unwrap();

        assert_eq!(
            updated.contact.as_deref(),
            Some(&["mailto:new@example.com".to_owned()][..])
        );
    }

    #[tokio::test]
    async fn test_deactivate_account() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();
        let acc = dir.register_account(None, true).await.unwrap();

        let deactivated = acc.deactivate().await.unwrap();
        assert!(deactivated.is_status_deactivated());
    }

    #[tokio::test]
    async fn test_revoke_certificate() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();
        let acc = dir.register_account(None, true).await.unwrap();

        let cert = crate::cert::Certificate::parse(
            None,
            crate::test::TEST_CERT_CHAIN.to_owned(),
        );

        acc.revoke_certificate(&cert, crate::RevocationReason::Superseded)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_key_rollover() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let acc = dir
            .load_account(crate::test::TEST_KEY_1, None, true)
            .await
            .unwrap();

        acc.change_key(Some(crate::test::TEST_KEY_2)).await.unwrap();

        // the mock verified outer (old key) and inner (new key) signatures
        // and the {account, oldKey} payload; it now only accepts the new key
        assert!(server.state.key_changed());
        acc.update_account(None).await.unwrap();

        // a client still bound to the old key must be rejected
        let stale = dir
            .load_account_with_url(crate::test::TEST_KEY_1, &acc.account_url())
            .await;
        match stale {
            Err(Error::Protocol(problem)) => {
                assert_eq!(problem.error_name(), "unauthorized");
            }
            Err(other) => panic!("expected unauthorized, got: {other}"),
            Ok(_) => panic!("stale key must not validate"),
        }
    }
}
