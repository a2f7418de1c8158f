use std::sync::Arc;

use sha2::{Digest as _, Sha256};

use crate::{
    acc::AccountInner,
    api,
    error::{Entity, Error, Result},
    jws::key_authorization,
    retry::{retry, CancelHandle},
    util::read_json,
};

/// An authorization (ownership proof) for a domain name.
///
/// Each authorization for an order must be progressed to a valid state before the ACME API
/// will issue a certificate.
///
/// Authorizations may or may not be required depending on previous orders against the same
/// ACME account. The ACME API decides if the authorization is needed.
///
/// The ways of providing the authorization are:
///
/// * In a text file served using [HTTP] from a web server of the domain being authorized.
/// * A `TXT` [DNS] record under the domain being authorized.
/// * A [TLS-ALPN] certificate served on port 443 of the domain being authorized.
///
/// Wildcard domains only ever get the DNS variant.
///
/// [HTTP]: Auth::http_challenge
/// [DNS]: Auth::dns_challenge
/// [TLS-ALPN]: Auth::tls_alpn_challenge
#[derive(Debug)]
pub struct Auth {
    inner: Arc<AccountInner>,
    api_auth: api::Authorization,
    auth_url: String,
}

impl Auth {
    pub(crate) fn new(
        inner: &Arc<AccountInner>,
        api_auth: api::Authorization,
        auth_url: &str,
    ) -> Self {
        Auth {
            inner: Arc::clone(inner),
            api_auth,
            auth_url: auth_url.to_owned(),
        }
    }

    /// Domain name for this authorization.
    pub fn domain_name(&self) -> &str {
        &self.api_auth.identifier.value
    }

    /// The URL this authorization is refreshed from.
    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// Whether this authorization covers a wildcard name.
    ///
    /// Wildcard authorizations MUST be satisfied with `dns-01`.
    pub fn is_wildcard(&self) -> bool {
        self.api_auth.is_wildcard()
    }

    /// Whether we actually need to do the authorization. This might not be needed if we have
    /// proven ownership of the domain recently in a previous order.
    pub fn need_challenge(&self) -> bool {
        !matches!(self.api_auth.status, api::AuthorizationStatus::Valid)
    }

    /// Get the http challenge.
    ///
    /// The http challenge must be placed so it is accessible under:
    ///
    /// ```text
    /// http://<domain-to-be-proven>/.well-known/acme-challenge/<token>
    /// ```
    ///
    /// The challenge will be accessed over HTTP (not HTTPS), for obvious reasons.
    pub fn http_challenge(&self) -> Option<Challenge<Http>> {
        self.api_auth
            .http_challenge()
            .map(|c| Challenge::new(&self.inner, c.clone(), &self.auth_url))
    }

    /// Get the dns challenge.
    ///
    /// The dns challenge is a `TXT` record that must be put created under:
    ///
    /// ```text
    /// _acme-challenge.<domain-to-be-proven>.  TXT  <proof>
    /// ```
    ///
    /// The `<proof>` contains the signed token proving this account updated it.
    ///
    /// The dns proof is not the same as the http proof.
    pub fn dns_challenge(&self) -> Option<Challenge<Dns>> {
        self.api_auth
            .dns_challenge()
            .map(|c| Challenge::new(&self.inner, c.clone(), &self.auth_url))
    }

    /// Returns the TLS ALPN challenge.
    ///
    /// The TLS ALPN challenge is a certificate that must be served when a TLS connection is made
    /// with the ALPN protocol "acme-tls/1". The certificate must contain a single dNSName SAN
    /// containing the domain being validated, as well as an ACME extension containing the SHA256 of
    /// the key authorization.
    pub fn tls_alpn_challenge(&self) -> Option<Challenge<TlsAlpn>> {
        self.api_auth
            .tls_alpn_challenge()
            .map(|c| Challenge::new(&self.inner, c.clone(), &self.auth_url))
    }

    /// Deactivates a pending authorization, telling the server the client no
    /// longer intends to prove control ([RFC 8555 §7.5.2]).
    ///
    /// [RFC 8555 §7.5.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.5.2
    pub async fn deactivate(self) -> Result<api::Authorization> {
        #[derive(serde::Serialize)]
        struct Deactivation {
            status: &'static str,
        }

        let res = self
            .inner
            .call_kid(
                &self.auth_url,
                &Deactivation {
                    status: "deactivated",
                },
                &[200],
            )
            .await?;

        read_json(res).await
    }

    /// Returns a reference to the authorization's API object.
    ///
    /// Useful for debugging.
    ///
    /// We don't refresh the authorization when the corresponding challenge is validated, so there
    /// will be no changes to see here.
    pub fn api_auth(&self) -> &api::Authorization {
        &self.api_auth
    }
}

/// Polls an authorization URL until it leaves `pending`.
///
/// `valid` resolves the future; every other terminal status aborts the
/// backoff and surfaces as a state error carrying the server-reported
/// challenge failure.
pub(crate) async fn wait_authorization(
    acc: &Arc<AccountInner>,
    auth_url: &str,
    cancel: &CancelHandle,
) -> Result<api::Authorization> {
    retry(&acc.retry, cancel, |abort| async move {
        let res = acc.call_kid(auth_url, &api::EmptyString, &[200]).await?;
        let auth: api::Authorization = read_json(res).await?;

        match auth.status {
            api::AuthorizationStatus::Valid => Ok(auth),
            api::AuthorizationStatus::Pending => Err(Error::Pending {
                entity: Entity::Authorization,
                status: "pending".to_owned(),
            }),
            status => {
                abort.abort();

                let reason = match auth.challenge_error() {
                    Some(error) => format!("{error} (subproblems: {:?})", error.subproblems),
                    None => format!("authorization is {status:?} and no error was reported"),
                };

                Err(Error::state(Entity::Authorization, reason))
            }
        }
    })
    .await
}

/// Marker type for HTTP challenges.
#[doc(hidden)]
pub struct Http;

/// Marker type for DNS challenges.
#[doc(hidden)]
pub struct Dns;

/// Marker type for TLS ALPN challenges.
#[doc(hidden)]
pub struct TlsAlpn;

/// A DNS, HTTP, or TLS-ALPN challenge as obtained from the [`Auth`].
pub struct Challenge<A> {
    inner: Arc<AccountInner>,
    api_challenge: api::Challenge,
    auth_url: String,
    _ph: std::marker::PhantomData<A>,
}

/// See [RFC 8555 §8.3].
///
/// [RFC 8555 §8.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.3
impl Challenge<Http> {
    /// Returns the token, a unique identifier of the challenge.
    ///
    /// This is used as the file name in the HTTP challenge like so:
    ///
    /// ```text
    /// http://<domain-to-be-proven>/.well-known/acme-challenge/<token>
    /// ```
    pub fn http_token(&self) -> &str {
        &self.api_challenge.token
    }

    /// Returns the proof content for HTTP validation.
    ///
    /// Proof is typically placed in a text file that is served as the file named by `token`,
    /// with content type `text/plain`.
    pub fn http_proof(&self) -> Result<String> {
        key_authorization(&self.api_challenge.token, &self.inner.jwk()?, false)
    }
}

/// See [RFC 8555 §8.4].
///
/// [RFC 8555 §8.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.4
impl Challenge<Dns> {
    /// Returns the proof content for DNS validation.
    ///
    /// Proof is to be placed in a DNS TXT record like so:
    ///
    /// ```plain
    /// _acme-challenge.<domain-to-be-proven>.  TXT  <proof>
    /// ```
    ///
    /// Multiple TXT records may coexist under the same name (SAN orders on
    /// overlapping zones).
    pub fn dns_proof(&self) -> Result<String> {
        key_authorization(&self.api_challenge.token, &self.inner.jwk()?, true)
    }
}

/// See [RFC 8737 §3].
///
/// [RFC 8737 §3]: https://datatracker.ietf.org/doc/html/rfc8737#section-3
impl Challenge<TlsAlpn> {
    /// Returns the proof content for TLS-ALPN validation.
    ///
    /// Proof is to be placed in the `id-pe-acmeIdentifier` extension
    /// (1.3.6.1.5.5.7.1.31) of the certificate used for validation.
    pub fn tls_alpn_proof(&self) -> Result<[u8; 32]> {
        let proof = key_authorization(&self.api_challenge.token, &self.inner.jwk()?, false)?;

        Ok(Sha256::digest(proof).into())
    }
}

impl<A> Challenge<A> {
    fn new(inner: &Arc<AccountInner>, api_challenge: api::Challenge, auth_url: &str) -> Self {
        Challenge {
            inner: Arc::clone(inner),
            api_challenge,
            auth_url: auth_url.to_owned(),
            _ph: std::marker::PhantomData,
        }
    }

    /// Returns true if this challenge needs validation.
    ///
    /// It might already been done in a previous order for the same account.
    pub fn need_validate(&self) -> bool {
        matches!(self.api_challenge.status, api::ChallengeStatus::Pending)
    }

    /// Tells the ACME API that the challenge proof is in place, without
    /// waiting for the outcome.
    pub async fn submit(&self) -> Result<api::Challenge> {
        submit_challenge(&self.inner, &self.api_challenge).await
    }

    /// Tells the ACME API to attempt validating the proof of this challenge,
    /// then polls the authorization with backoff until it reaches a terminal
    /// state.
    ///
    /// The challenge proof must be put in place before this call. Either by: placing it in a DNS
    /// record, updating a web server, or passing it to TLS connection for ALPN exchange.
    pub async fn validate(&self) -> Result<()> {
        self.submit().await?;

        wait_authorization(&self.inner, &self.auth_url, &CancelHandle::new()).await?;

        Ok(())
    }

    /// Returns a reference to the challenge's API object.
    ///
    /// Useful for debugging.
    pub fn api_challenge(&self) -> &api::Challenge {
        &self.api_challenge
    }
}

/// POST to the challenge URL signalling the proof is in place.
///
/// The payload carries the key authorization computed for this challenge.
pub(crate) async fn submit_challenge(
    acc: &Arc<AccountInner>,
    challenge: &api::Challenge,
) -> Result<api::Challenge> {
    let payload = api::ChallengeResponse {
        key_authorization: key_authorization(&challenge.token, &acc.jwk()?, false)?,
    };

    let res = acc.call_kid(&challenge.url, &payload, &[200]).await?;
    read_json(res).await
}

#[cfg(test)]
mod tests {
    use crate::{Directory, DirectoryUrl};

    #[tokio::test]
    async fn test_get_challenges() {
        let server = crate::test::with_directory_server();
        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();
        let acc = dir
            .register_account(Some(vec!["mailto:foo@bar.com".to_owned()]), true)
            .await
            .unwrap();
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();
        let authz = ord.authorizations().await.unwrap();
        assert_eq!(authz.len(), 1);
        let auth = &authz[0];

        let http = auth.http_challenge().unwrap();
        assert!(http.need_validate());

        let dns = auth.dns_challenge().unwrap();
        assert!(dns.need_validate());
    }

    #[tokio::test]
    async fn test_proofs_are_consistent() {
        let server = crate::test::with_directory_server();
        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();
        let acc = dir
            .load_account(crate::test::TEST_KEY_1, None, true)
            .await
            .unwrap();
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();
        let authz = ord.authorizations().await.unwrap();
        let auth = &authz[0];

        let http = auth.http_challenge().unwrap();
        let dns = auth.dns_challenge().unwrap();

        let http_proof = http.http_proof().unwrap();
        let dns_proof = dns.dns_proof().unwrap();

        // token.thumbprint for http, base64url(sha256(token.thumbprint)) for dns
        assert!(http_proof.starts_with(http.http_token()));
        assert!(!dns_proof.contains('.'));

        let alpn = auth.tls_alpn_challenge().unwrap();
        assert_eq!(alpn.tls_alpn_proof().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_deactivate_authorization() {
        let server = crate::test::with_directory_server();
        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();
        let acc = dir.register_account(None, true).await.unwrap();
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();
        let mut authz = ord.authorizations().await.unwrap();

        let deactivated = authz.remove(0).deactivate().await.unwrap();
        assert_eq!(
            deactivated.status,
            crate::api::AuthorizationStatus::Deactivated
        );
    }

    #[tokio::test]
    async fn test_validate_challenge() {
        let server = crate::test::with_directory_server();
        server.state.pass_authorization_after(2);

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch_with(url, crate::test::fast_options())
            .await
            .unwrap();
        let acc = dir.register_account(None, true).await.unwrap();
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();
        let authz = ord.authorizations().await.unwrap();

        let http = authz[0].http_challenge().unwrap();
        http.validate().await.unwrap();

        assert!(server.state.challenge_submitted());
    }
}
