//! The auto-mode orchestrator: run an order through every state until the
//! certificate is downloadable, driving user-supplied callbacks to publish
//! and withdraw challenge responses.

use std::{fmt, future::Future, sync::Arc};

use futures::future::{join_all, BoxFuture};

use crate::{
    acc::{Account, AccountInner},
    api,
    cert::Certificate,
    dir::Directory,
    error::{Entity, Error, Result},
    jws::key_authorization,
    order::{
        auth::{submit_challenge, wait_authorization},
        wait_order_ready, CsrOrder,
    },
    retry::{retry, CancelHandle},
    util::der_from_pem,
    verify::ChallengeProof,
};

/// Error type returned from challenge callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// A challenge provisioning callback.
///
/// Receives the authorization, the selected challenge, and the key
/// authorization in its published form: served verbatim for `http-01`,
/// `base64url(SHA-256(keyAuthorization))` for `dns-01` and `tls-alpn-01`.
pub type ChallengeCallback = Box<
    dyn Fn(api::Authorization, api::Challenge, String) -> BoxFuture<'static, Result<(), CallbackError>>
        + Send
        + Sync,
>;

/// Options for [`Account::auto`] / [`Directory::auto`].
pub struct AutoOptions {
    csr_pem: String,
    challenge_create_fn: ChallengeCallback,
    challenge_remove_fn: ChallengeCallback,
    email: Option<String>,
    terms_of_service_agreed: bool,
    challenge_priority: Vec<api::ChallengeKind>,
    verify_challenges: bool,
    cancel: CancelHandle,
}

impl AutoOptions {
    /// Options over a ready-made CSR (PEM) and the two challenge callbacks.
    ///
    /// `create` is awaited before the server is told to validate; `remove`
    /// runs for every identifier `create` ran for, whatever the outcome,
    /// and its errors are logged rather than propagated.
    pub fn new<C, CF, R, RF>(csr_pem: impl Into<String>, create: C, remove: R) -> Self
    where
        C: Fn(api::Authorization, api::Challenge, String) -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<(), CallbackError>> + Send + 'static,
        R: Fn(api::Authorization, api::Challenge, String) -> RF + Send + Sync + 'static,
        RF: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        AutoOptions {
            csr_pem: csr_pem.into(),
            challenge_create_fn: Box::new(move |auth, challenge, key_auth| {
                Box::pin(create(auth, challenge, key_auth))
            }),
            challenge_remove_fn: Box::new(move |auth, challenge, key_auth| {
                Box::pin(remove(auth, challenge, key_auth))
            }),
            email: None,
            terms_of_service_agreed: false,
            challenge_priority: vec![api::ChallengeKind::Http01, api::ChallengeKind::Dns01],
            verify_challenges: true,
            cancel: CancelHandle::new(),
        }
    }

    /// Contact email used when [`Directory::auto`] has to register an
    /// account first.
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Agree to the server's terms of service (required for account
    /// registration; defaults to false).
    pub fn terms_of_service_agreed(mut self, agreed: bool) -> Self {
        self.terms_of_service_agreed = agreed;
        self
    }

    /// Challenge types to prefer, in order. Defaults to
    /// `[http-01, dns-01]`. Wildcard identifiers ignore this and always use
    /// `dns-01`.
    pub fn challenge_priority(mut self, priority: Vec<api::ChallengeKind>) -> Self {
        self.challenge_priority = priority;
        self
    }

    /// Whether to self-verify challenge provisioning before asking the
    /// server to validate (default true). `tls-alpn-01` verification is
    /// best-effort either way.
    pub fn verify_challenges(mut self, verify: bool) -> Self {
        self.verify_challenges = verify;
        self
    }

    /// A handle that cancels the operation from another task. Challenge
    /// cleanup callbacks run before the cancellation surfaces.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl fmt::Debug for AutoOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoOptions")
            .field("email", &self.email)
            .field("terms_of_service_agreed", &self.terms_of_service_agreed)
            .field("challenge_priority", &self.challenge_priority)
            .field("verify_challenges", &self.verify_challenges)
            .finish_non_exhaustive()
    }
}

impl Directory {
    /// Create-or-find the account for `account_key_pem` (a fresh key when
    /// `None`), then run [`Account::auto`] with these options.
    pub async fn auto(
        &self,
        account_key_pem: Option<&str>,
        options: AutoOptions,
    ) -> Result<Certificate> {
        let contact = options
            .email
            .as_ref()
            .map(|email| vec![format!("mailto:{email}")]);

        let account = match account_key_pem {
            Some(pem) => {
                self.load_account(pem, contact, options.terms_of_service_agreed)
                    .await?
            }
            None => {
                self.register_account(contact, options.terms_of_service_agreed)
                    .await?
            }
        };

        account.auto(options).await
    }
}

impl Account {
    /// Runs a whole order: derive identifiers from the CSR, create the
    /// order, satisfy every pending authorization through the callbacks,
    /// finalize with the CSR, and download the certificate chain.
    ///
    /// Authorizations are processed concurrently; the flow waits for all of
    /// them before finalizing. On failure or cancellation every
    /// `challenge_remove_fn` whose `challenge_create_fn` ran is still
    /// invoked before the error is returned.
    pub async fn auto(&self, options: AutoOptions) -> Result<Certificate> {
        let inner = self.inner();

        // identifiers: common name first, then SANs, deduplicated
        let domains = inner.crypto.csr_domains(&options.csr_pem)?;
        let identifiers = domains.identifiers();

        let Some((primary, alt)) = identifiers.split_first() else {
            return Err(Error::Config("CSR names no identifiers".to_owned()));
        };
        let alt: Vec<&str> = alt.iter().map(String::as_str).collect();

        log::debug!("auto order for {identifiers:?}");

        let order = self.new_order(primary, &alt).await?;

        let auths = order.authorizations().await?;

        // fan out over pending authorizations; join_all (not fail-fast) so
        // every branch reaches its cleanup callback before we give up
        let outcomes = join_all(
            auths
                .iter()
                .filter(|auth| auth.need_challenge())
                .map(|auth| process_authorization(inner, &options, auth)),
        )
        .await;

        if let Some(err) = outcomes.into_iter().find_map(Result::err) {
            return Err(err);
        }

        // fan-in is complete; progress the order to ready
        let api_order = wait_order_ready(inner, order.order_url(), &options.cancel).await?;
        let mut order = order;
        order.order.api_order.overwrite(api_order)?;

        let csr_order = CsrOrder { order: order.order };
        let csr_der = der_from_pem(&options.csr_pem, "CERTIFICATE REQUEST")?;

        let cert_order = csr_order.do_finalize(csr_der, None, &options.cancel).await?;

        cert_order.download_cert().await
    }
}

/// Walk one authorization from pending to valid.
///
/// The create callback, self-verification, challenge submission, and status
/// polling happen in order; the remove callback runs no matter which of
/// those failed.
async fn process_authorization(
    inner: &Arc<AccountInner>,
    options: &AutoOptions,
    auth: &crate::order::Auth,
) -> Result<()> {
    let api_auth = auth.api_auth();
    let domain = auth.domain_name().to_owned();

    let challenge = select_challenge(api_auth, &options.challenge_priority)?.clone();
    let kind = challenge
        .kind()
        .expect("selected challenge is a known type");

    log::debug!("selected {kind} for {domain}");

    let jwk = inner.jwk()?;
    let published = match kind {
        api::ChallengeKind::Http01 => key_authorization(&challenge.token, &jwk, false)?,
        api::ChallengeKind::Dns01 | api::ChallengeKind::TlsAlpn01 => {
            key_authorization(&challenge.token, &jwk, true)?
        }
    };

    (options.challenge_create_fn)(api_auth.clone(), challenge.clone(), published.clone())
        .await
        .map_err(|err| Error::Callback(format!("challengeCreateFn for {domain}: {err}")))?;

    // from here on, the remove callback must run on every path
    let outcome = drive_challenge(inner, options, auth, &challenge, kind).await;

    if let Err(err) =
        (options.challenge_remove_fn)(api_auth.clone(), challenge.clone(), published).await
    {
        // cleanup is best-effort
        log::warn!("challengeRemoveFn for {domain} failed: {err}");
    }

    outcome
}

async fn drive_challenge(
    inner: &Arc<AccountInner>,
    options: &AutoOptions,
    auth: &crate::order::Auth,
    challenge: &api::Challenge,
    kind: api::ChallengeKind,
) -> Result<()> {
    let domain = auth.domain_name();

    if options.verify_challenges {
        let jwk = inner.jwk()?;
        let proof = match kind {
            api::ChallengeKind::Http01 => ChallengeProof::Http {
                token: challenge.token.clone(),
                key_auth: key_authorization(&challenge.token, &jwk, false)?,
            },
            api::ChallengeKind::Dns01 => ChallengeProof::Dns {
                digest: key_authorization(&challenge.token, &jwk, true)?,
            },
            api::ChallengeKind::TlsAlpn01 => ChallengeProof::TlsAlpn {
                key_auth: key_authorization(&challenge.token, &jwk, false)?,
            },
        };

        let http = inner.http.clone();
        let verified = retry(&inner.retry, &options.cancel, |_abort| {
            let proof = proof.clone();
            let http = http.clone();
            let domain = domain.to_owned();
            async move { proof.verify(&http, &domain).await }
        })
        .await;

        match verified {
            Ok(()) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            // the ALPN probe depends on network position; treat it as
            // advisory
            Err(err) if kind == api::ChallengeKind::TlsAlpn01 => {
                log::warn!("tls-alpn-01 self-verification inconclusive for {domain}: {err}");
            }
            Err(err) => return Err(err),
        }
    }

    submit_challenge(inner, challenge).await?;

    wait_authorization(inner, auth.auth_url(), &options.cancel).await?;

    Ok(())
}

/// Picks the challenge to run for an authorization.
///
/// Wildcard identifiers can only be proven over DNS, whatever the caller's
/// priority says. Everything else takes the first priority entry the server
/// offered.
fn select_challenge<'a>(
    auth: &'a api::Authorization,
    priority: &[api::ChallengeKind],
) -> Result<&'a api::Challenge> {
    if auth.is_wildcard() || auth.identifier.is_wildcard() {
        return auth.dns_challenge().ok_or_else(|| {
            Error::state(
                Entity::Authorization,
                format!(
                    "wildcard authorization for {} offers no dns-01 challenge",
                    auth.identifier.value
                ),
            )
        });
    }

    for kind in priority {
        if let Some(challenge) = auth.challenge(*kind) {
            return Ok(challenge);
        }
    }

    let offered: Vec<&str> = auth.challenges.iter().map(|c| c._type.as_str()).collect();
    Err(Error::state(
        Entity::Challenge,
        format!("no challenge matches priority {priority:?}; server offered {offered:?}"),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::{
        crypto::{CryptoProvider as _, CsrParams, RustCryptoProvider},
        error::Error,
        jws::{key_authorization, Jwk},
        test::{fast_options, with_directory_server, TEST_CERT_CHAIN, TEST_KEY_1, TEST_KEY_2},
        Directory, DirectoryUrl,
    };

    use super::AutoOptions;

    #[derive(Clone, Default)]
    struct Recorder {
        created: Arc<Mutex<Vec<(String, String, String)>>>,
        removed: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn options(&self, csr_pem: &str) -> AutoOptions {
            let created = Arc::clone(&self.created);
            let removed = Arc::clone(&self.removed);

            AutoOptions::new(
                csr_pem,
                move |auth, challenge, key_auth| {
                    let created = Arc::clone(&created);
                    async move {
                        created.lock().unwrap().push((
                            auth.identifier.value,
                            challenge._type,
                            key_auth,
                        ));
                        Ok(())
                    }
                },
                move |auth, _challenge, _key_auth| {
                    let removed = Arc::clone(&removed);
                    async move {
                        removed.lock().unwrap().push(auth.identifier.value);
                        Ok(())
                    }
                },
            )
            .verify_challenges(false)
        }
    }

    fn csr_for(domain: &str) -> String {
        RustCryptoProvider::new()
            .create_csr(&CsrParams::for_domains([domain]), Some(TEST_KEY_2))
            .unwrap()
            .csr_pem
    }

    #[tokio::test]
    async fn test_auto_http01_full_order() {
        let server = with_directory_server();
        server.state.pass_authorization_after(2);

        let dir = Directory::fetch_with(DirectoryUrl::Other(&server.dir_url), fast_options())
            .await
            .unwrap();
        let acc = dir.load_account(TEST_KEY_1, None, true).await.unwrap();

        let recorder = Recorder::default();
        let cert = acc
            .auto(recorder.options(&csr_for("acme-test.example.com")))
            .await
            .unwrap();

        assert_eq!(cert.certificate(), TEST_CERT_CHAIN);

        // the create callback ran exactly once, with the http-01 token and
        // the plain `token.thumbprint` key authorization
        let created = recorder.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        let (domain, challenge_type, key_auth) = &created[0];
        assert_eq!(domain, "acme-test.example.com");
        assert_eq!(challenge_type, "http-01");

        let crypto = RustCryptoProvider::new();
        let jwk = Jwk::from_pem(TEST_KEY_1, &crypto).unwrap();
        let expected = key_authorization(crate::test::TEST_HTTP_TOKEN, &jwk, false).unwrap();
        assert_eq!(key_auth, &expected);

        // cleanup ran exactly once, and the server saw the challenge POST
        // and the finalize
        assert_eq!(*recorder.removed.lock().unwrap(), ["acme-test.example.com"]);
        assert!(server.state.challenge_submitted());
        assert!(server.state.finalized());
    }

    #[tokio::test]
    async fn test_auto_wildcard_forces_dns01() {
        let server = with_directory_server();
        server.state.set_wildcard(true);
        server.state.pass_authorization_after(1);

        let dir = Directory::fetch_with(DirectoryUrl::Other(&server.dir_url), fast_options())
            .await
            .unwrap();
        let acc = dir.load_account(TEST_KEY_1, None, true).await.unwrap();

        let recorder = Recorder::default();

        // http-01 first in priority; the wildcard must still go dns-01
        let options = recorder
            .options(&csr_for("*.example.com"))
            .challenge_priority(vec![crate::api::ChallengeKind::Http01]);

        acc.auto(options).await.unwrap();

        let created = recorder.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        let (_, challenge_type, key_auth) = &created[0];
        assert_eq!(challenge_type, "dns-01");

        // dns-01 publishes the hashed key authorization
        let crypto = RustCryptoProvider::new();
        let jwk = Jwk::from_pem(TEST_KEY_1, &crypto).unwrap();
        let expected = key_authorization(crate::test::TEST_DNS_TOKEN, &jwk, true).unwrap();
        assert_eq!(key_auth, &expected);
    }

    #[tokio::test]
    async fn test_auto_invalid_authorization_cleans_up() {
        let server = with_directory_server();
        server
            .state
            .fail_authorization("dns lookup failed");

        let dir = Directory::fetch_with(DirectoryUrl::Other(&server.dir_url), fast_options())
            .await
            .unwrap();
        let acc = dir.load_account(TEST_KEY_1, None, true).await.unwrap();

        let recorder = Recorder::default();
        let err = acc
            .auto(recorder.options(&csr_for("acme-test.example.com")))
            .await
            .unwrap_err();

        match err {
            Error::State { reason, .. } => assert!(
                reason.contains("dns lookup failed"),
                "unexpected reason: {reason}"
            ),
            other => panic!("expected state error, got: {other}"),
        }

        // cleanup must run even though the authorization failed
        assert_eq!(*recorder.removed.lock().unwrap(), ["acme-test.example.com"]);
    }

    #[tokio::test]
    async fn test_auto_cancellation_runs_cleanup() {
        let server = with_directory_server();
        // authorization never leaves pending; cancellation interrupts the
        // polling loop
        server.state.pass_authorization_after(u32::MAX as usize);

        let dir = Directory::fetch_with(DirectoryUrl::Other(&server.dir_url), fast_options())
            .await
            .unwrap();
        let acc = dir.load_account(TEST_KEY_1, None, true).await.unwrap();

        let recorder = Recorder::default();
        let options = recorder.options(&csr_for("acme-test.example.com"));
        let cancel = options.cancel_handle();
        cancel.cancel();

        let err = acc.auto(options).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // the create callback had already run, so cleanup must have too
        assert_eq!(*recorder.removed.lock().unwrap(), ["acme-test.example.com"]);
    }

    #[tokio::test]
    async fn test_directory_auto_registers_account() {
        let server = with_directory_server();
        server.state.pass_authorization_after(1);

        let dir = Directory::fetch_with(DirectoryUrl::Other(&server.dir_url), fast_options())
            .await
            .unwrap();

        let recorder = Recorder::default();
        let options = recorder
            .options(&csr_for("acme-test.example.com"))
            .email("admin@example.com")
            .terms_of_service_agreed(true);

        let cert = dir.auto(Some(TEST_KEY_1), options).await.unwrap();
        assert_eq!(cert.certificate(), TEST_CERT_CHAIN);
    }

    #[tokio::test]
    async fn test_directory_auto_requires_tos() {
        let server = with_directory_server();

        let dir = Directory::fetch_with(DirectoryUrl::Other(&server.dir_url), fast_options())
            .await
            .unwrap();

        let recorder = Recorder::default();
        let options = recorder.options(&csr_for("acme-test.example.com"));

        let err = dir.auto(Some(TEST_KEY_1), options).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
