//! Order life cycle.
//!
//! An order goes through a life cycle of different states that require various actions by
//! the user. To ensure the user only use appropriate actions, this library have simple façade
//! structs that wraps the actual [`api::Order`].
//!
//! 1. First prove ownership:
//!    * [`NewOrder`] -> [`Auth`]* -> [`Challenge`]
//! 2. Then submit CSR and download the cert.
//!    * [`NewOrder`] -> [`CsrOrder`] -> [`CertOrder`]
//!
//! \* Possibly multiple auths.
//!
//! All polling against the API runs on the account's [`RetryPolicy`]
//! (exponential backoff with jitter); a terminal `invalid` status aborts the
//! backoff immediately.
//!
//! [`RetryPolicy`]: crate::RetryPolicy

use std::sync::Arc;

use base64::prelude::*;
use zeroize::Zeroizing;

use crate::{
    acc::AccountInner,
    api,
    cert::Certificate,
    crypto::CsrParams,
    error::{Entity, Error, Result},
    retry::{retry, CancelHandle},
    util::{der_from_pem, read_json},
};

pub(crate) mod auth;

pub use self::auth::{Auth, Challenge, Dns, Http, TlsAlpn};

/// The order wrapped with an outer facade.
pub(crate) struct Order {
    pub(crate) acc: Arc<AccountInner>,
    pub(crate) api_order: api::Order,
    pub(crate) url: String,
}

impl Order {
    pub(crate) fn new(acc: &Arc<AccountInner>, api_order: api::Order, url: String) -> Self {
        Order {
            acc: Arc::clone(acc),
            api_order,
            url,
        }
    }
}

/// POST-as-GET refresh of the order state.
pub(crate) async fn refresh_order(acc: &Arc<AccountInner>, url: &str) -> Result<api::Order> {
    let res = acc.call_kid(url, &api::EmptyString, &[200]).await?;
    read_json(res).await
}

/// Polls the order URL until every authorization went through (`ready`), or
/// further (`valid` for replayed orders).
pub(crate) async fn wait_order_ready(
    acc: &Arc<AccountInner>,
    url: &str,
    cancel: &CancelHandle,
) -> Result<api::Order> {
    retry(&acc.retry, cancel, |abort| async move {
        let order = refresh_order(acc, url).await?;

        match order.status {
            Some(api::OrderStatus::Ready) | Some(api::OrderStatus::Valid) => Ok(order),
            Some(api::OrderStatus::Invalid) => {
                abort.abort();
                Err(Error::state(Entity::Order, order_error_reason(&order)))
            }
            other => Err(Error::Pending {
                entity: Entity::Order,
                status: status_name(other),
            }),
        }
    })
    .await
}

/// Polls the order URL after finalization until the certificate is issued.
pub(crate) async fn wait_order_valid(
    acc: &Arc<AccountInner>,
    url: &str,
    cancel: &CancelHandle,
) -> Result<api::Order> {
    retry(&acc.retry, cancel, |abort| async move {
        let order = refresh_order(acc, url).await?;

        match order.status {
            Some(api::OrderStatus::Valid) => Ok(order),
            Some(api::OrderStatus::Invalid) => {
                abort.abort();
                Err(Error::state(Entity::Finalize, order_error_reason(&order)))
            }
            other => Err(Error::Pending {
                entity: Entity::Order,
                status: status_name(other),
            }),
        }
    })
    .await
}

fn status_name(status: Option<api::OrderStatus>) -> String {
    match status {
        Some(status) => format!("{status:?}").to_lowercase(),
        None => "unknown".to_owned(),
    }
}

fn order_error_reason(order: &api::Order) -> String {
    order
        .error
        .as_ref()
        .map(|problem| problem.to_string())
        .unwrap_or_else(|| "order reported invalid without an error document".to_owned())
}

/// A new order created by [`Account::new_order()`].
///
/// An order is created using one or many domains (a primary `CN` and possible multiple
/// alt names). All domains in the order must have authorizations ([confirmed ownership])
/// before the order can progress to submitting a [CSR].
///
/// This order façade provides calls to provide such authorizations and to progress the order
/// when ready.
///
/// The ACME API provider might "remember" for a time that you already own a domain, which
/// means you might not need to prove the ownership every time. Use appropriate methods to
/// first check whether you really need to handle authorizations.
///
/// [`Account::new_order()`]: crate::Account::new_order()
/// [confirmed ownership]: ../index.html#domain-ownership
/// [CSR]: https://en.wikipedia.org/wiki/Certificate_signing_request
pub struct NewOrder {
    pub(crate) order: Order,
}

impl NewOrder {
    /// The URL the server assigned to this order.
    pub fn order_url(&self) -> &str {
        &self.order.url
    }

    /// Tell if the domains in this order have been authorized.
    ///
    /// This doesn't do any calls against the API. You must manually call [`refresh`].
    ///
    /// In ACME API terms, the order can either be `ready` or `valid`, which both would mean we have
    /// passed the authorization stage.
    ///
    /// [`refresh`]: Self::refresh
    pub fn is_validated(&self) -> bool {
        self.order.api_order.status.is_some_and(|status| {
            matches!(status, api::OrderStatus::Ready | api::OrderStatus::Valid)
        })
    }

    /// If the order [is validated], progress it to a [`CsrOrder`].
    ///
    /// This doesn't do any calls against the API. You must manually call [`refresh`].
    ///
    /// [is validated]: Self::is_validated
    /// [`refresh`]: Self::refresh
    pub fn confirm_validations(&self) -> Option<CsrOrder> {
        if self.is_validated() {
            Some(CsrOrder {
                order: Order::new(
                    &self.order.acc,
                    self.order.api_order.clone(),
                    self.order.url.clone(),
                ),
            })
        } else {
            None
        }
    }

    /// Refresh the order state against the ACME API.
    ///
    /// The specification calls this a "POST-as-GET" against the order URL.
    pub async fn refresh(&mut self) -> Result<()> {
        let api_order = refresh_order(&self.order.acc, &self.order.url).await?;
        self.order.api_order.overwrite(api_order)?;
        Ok(())
    }

    /// Polls the order with backoff until all authorizations are done,
    /// progressing to a [`CsrOrder`].
    ///
    /// Aborts the backoff immediately when the server reports the order
    /// `invalid`.
    pub async fn poll_ready(mut self) -> Result<CsrOrder> {
        let api_order =
            wait_order_ready(&self.order.acc, &self.order.url, &CancelHandle::new()).await?;
        self.order.api_order.overwrite(api_order)?;

        Ok(CsrOrder { order: self.order })
    }

    /// Provide the authorizations. The number of authorizations will be the same as
    /// the number of domains requested, i.e. at least one (the primary CN), but possibly
    /// more (for alt names).
    ///
    /// The authorizations are fetched in parallel, one POST-as-GET each.
    ///
    /// If the order includes new domain names that have not been authorized before, this
    /// list might contain a mix of already valid and not yet valid auths.
    pub async fn authorizations(&self) -> Result<Vec<Auth>> {
        let mut result = vec![];

        if let Some(authorizations) = &self.order.api_order.authorizations {
            let fetches = authorizations.iter().map(|auth_url| async move {
                let res = self
                    .order
                    .acc
                    .call_kid(auth_url, &api::EmptyString, &[200])
                    .await?;
                let api_auth: api::Authorization = read_json(res).await?;
                Ok::<_, Error>(Auth::new(&self.order.acc, api_auth, auth_url))
            });

            result = futures::future::try_join_all(fetches).await?;
        }

        Ok(result)
    }

    /// Returns a reference to the order's API object.
    ///
    /// Useful for debugging.
    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}

/// An order that is ready for a [CSR] submission.
///
/// Submitting the CSR is called "finalizing" the order.
///
/// Use [`finalize`] when the CSR is built elsewhere, or [`finalize_key`] to
/// have the crate's crypto provider build one over the order's domains from
/// a private key.
///
/// [CSR]: https://en.wikipedia.org/wiki/Certificate_signing_request
/// [`finalize`]: Self::finalize
/// [`finalize_key`]: Self::finalize_key
pub struct CsrOrder {
    pub(crate) order: Order,
}

impl CsrOrder {
    /// Finalizes the order with a ready-made CSR in PEM form and awaits
    /// certificate issuance.
    ///
    /// Once the CSR has been submitted, the order goes into a "processing"
    /// status, where we must poll until the status changes to "valid".
    pub async fn finalize(self, csr_pem: &str) -> Result<CertOrder> {
        let csr_der = der_from_pem(csr_pem, "CERTIFICATE REQUEST")?;
        self.do_finalize(csr_der, None, &CancelHandle::new()).await
    }

    /// Builds a CSR over the order's domains, signed with `private_key_pem`,
    /// and finalizes with it.
    ///
    /// The first domain is picked for the CSR's Common Name; all of them
    /// are listed in the Subject Alternative Name extension.
    pub async fn finalize_key(self, private_key_pem: &str) -> Result<CertOrder> {
        let params = CsrParams::for_domains(self.order.api_order.domains());
        let bundle = self
            .order
            .acc
            .crypto
            .create_csr(&params, Some(private_key_pem))?;

        let csr_der = der_from_pem(&bundle.csr_pem, "CERTIFICATE REQUEST")?;
        self.do_finalize(csr_der, Some(bundle.private_key_pem), &CancelHandle::new())
            .await
    }

    pub(crate) async fn do_finalize(
        mut self,
        csr_der: Vec<u8>,
        private_key_pem: Option<Zeroizing<String>>,
        cancel: &CancelHandle,
    ) -> Result<CertOrder> {
        let csr_b64 = BASE64_URL_SAFE_NO_PAD.encode(&csr_der);
        let finalize = api::Finalize::new(csr_b64);

        let inner = &self.order.acc;
        let finalize_url = &self.order.api_order.finalize;

        // If the CSR is invalid, we will get a 4xx code back that bombs out
        // right here.
        inner.call_kid(finalize_url, &finalize, &[200]).await?;

        // wait for the status to leave processing:
        // valid -> cert is issued
        // invalid -> the whole thing is off
        let api_order = wait_order_valid(inner, &self.order.url, cancel).await?;
        self.order.api_order.overwrite(api_order)?;

        Ok(CertOrder {
            private_key_pem,
            order: self.order,
        })
    }

    /// Returns a reference to the order's API object.
    ///
    /// Useful for debugging.
    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}

/// Order for an issued certificate that is ready to download.
pub struct CertOrder {
    private_key_pem: Option<Zeroizing<String>>,
    order: Order,
}

impl CertOrder {
    /// Request download of the issued certificate.
    ///
    /// The response is an `application/pem-certificate-chain`, end-entity
    /// certificate first.
    pub async fn download_cert(self) -> Result<Certificate> {
        let url = self
            .order
            .api_order
            .certificate
            .ok_or_else(|| Error::state(Entity::Download, "order carries no certificate URL"))?;

        let inner = self.order.acc;

        let res = inner.call_kid(&url, &api::EmptyString, &[200]).await?;
        let certificate = crate::req::req_safe_read_body(res).await;

        Ok(Certificate::new(self.private_key_pem, certificate))
    }

    /// Returns a reference to the order's API object.
    ///
    /// Useful for debugging.
    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::CryptoProvider as _, Directory, DirectoryUrl};

    #[tokio::test]
    async fn test_get_authorizations() {
        let server = crate::test::with_directory_server();
        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();
        let acc = dir
            .register_account(Some(vec!["mailto:foo@bar.com".to_owned()]), true)
            .await
            .unwrap();
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();

        let authorizations = ord.authorizations().await.unwrap();
        assert_eq!(authorizations.len(), 1);
        assert_eq!(authorizations[0].domain_name(), "acme-test.example.com");
    }

    #[tokio::test]
    async fn test_finalize_with_generated_csr() {
        let server = crate::test::with_directory_server();
        server.state.pass_authorization_after(0);

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch_with(url, crate::test::fast_options())
            .await
            .unwrap();
        let acc = dir
            .register_account(Some(vec!["mailto:foo@bar.com".to_owned()]), true)
            .await
            .unwrap();
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();

        // the mock order is `ready` once its authorization is valid
        let ord = ord.poll_ready().await.unwrap();

        let ord = ord.finalize_key(crate::test::TEST_KEY_2).await.unwrap();
        let cert = ord.download_cert().await.unwrap();

        assert_eq!(cert.certificate(), crate::test::TEST_CERT_CHAIN);
        assert!(cert.private_key().is_some());
    }

    #[tokio::test]
    async fn test_finalize_with_external_csr() {
        let server = crate::test::with_directory_server();
        server.state.pass_authorization_after(0);

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch_with(url, crate::test::fast_options())
            .await
            .unwrap();
        let acc = dir.register_account(None, true).await.unwrap();
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();
        let ord = ord.poll_ready().await.unwrap();

        let crypto = crate::crypto::RustCryptoProvider::new();
        let bundle = crypto
            .create_csr(
                &crate::crypto::CsrParams::for_domains(["acme-test.example.com"]),
                Some(crate::test::TEST_KEY_2),
            )
            .unwrap();

        let ord = ord.finalize(&bundle.csr_pem).await.unwrap();
        let cert = ord.download_cert().await.unwrap();

        assert_eq!(cert.certificate(), crate::test::TEST_CERT_CHAIN);
        assert!(cert.private_key().is_none());
    }
}
