use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    acc::AcmeKey,
    crypto::CryptoProvider,
    error::Result,
    jws::{jws_with, Jwk, JwsProtectedHeader},
    req::{req_expect_header, req_handle_error, Http},
};

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against newAccount url
/// 3. `set_key_id` from the returned `Location` header.
/// 4. `call_kid()` for all calls after that.
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    acme_key: AcmeKey,
    crypto: Arc<dyn CryptoProvider>,
    nonce_pool: Arc<NoncePool>,
    http: Http,
}

impl Transport {
    pub(crate) fn new(
        nonce_pool: Arc<NoncePool>,
        http: Http,
        crypto: Arc<dyn CryptoProvider>,
        acme_key: AcmeKey,
    ) -> Self {
        Transport {
            acme_key,
            crypto,
            nonce_pool,
            http,
        }
    }

    /// Update the key ID once it is known (part of setting up the transport).
    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    /// The key used in the transport.
    pub(crate) fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    /// The JWK for the transport key.
    pub(crate) fn jwk(&self) -> Result<Jwk> {
        self.acme_key.jwk(&*self.crypto)
    }

    /// Replaces the signing key, keeping the key ID. Used by key rollover,
    /// which also drains the nonce pool so nothing signed for the old key
    /// context is reused.
    pub(crate) fn swap_key(&mut self, new_key: AcmeKey) {
        let kid = self.acme_key.key_id().to_owned();
        self.acme_key = new_key;
        self.acme_key.set_key_id(kid);
        self.nonce_pool.drain();
    }

    /// Make call using the full JWK.
    ///
    /// Only needed for the first newAccount request.
    pub(crate) async fn call_jwk<T>(
        &self,
        url: &str,
        body: &T,
        allowed: &[u16],
    ) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        fn jws_with_jwk<T: Serialize + ?Sized>(
            url: &str,
            nonce: String,
            key: &AcmeKey,
            crypto: &dyn CryptoProvider,
            payload: &T,
        ) -> Result<String> {
            let jwk = key.jwk(crypto)?;
            let protected = JwsProtectedHeader::new_jwk(jwk, url, nonce);
            let jws = jws_with(protected, key, crypto, payload)?;
            Ok(serde_json::to_string(&jws)?)
        }

        self.do_call(url, body, allowed, jws_with_jwk).await
    }

    /// Make call using the key ID.
    pub(crate) async fn call_kid<T>(
        &self,
        url: &str,
        body: &T,
        allowed: &[u16],
    ) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        fn jws_with_kid<T: Serialize + ?Sized>(
            url: &str,
            nonce: String,
            key: &AcmeKey,
            crypto: &dyn CryptoProvider,
            payload: &T,
        ) -> Result<String> {
            let protected = JwsProtectedHeader::new_kid(key.key_id(), url, nonce);
            let jws = jws_with(protected, key, crypto, payload)?;
            Ok(serde_json::to_string(&jws)?)
        }

        self.do_call(url, body, allowed, jws_with_kid).await
    }

    async fn do_call<T, F>(
        &self,
        url: &str,
        body: &T,
        allowed: &[u16],
        make_body: F,
    ) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
        F: Fn(&str, String, &AcmeKey, &dyn CryptoProvider, &T) -> Result<String>,
    {
        let mut retried_bad_nonce = false;

        loop {
            // Either get a new nonce, or reuse one from a previous request.
            let nonce = self.nonce_pool.get_nonce(&self.http).await?;

            // Sign the body.
            let body = make_body(url, nonce, &self.acme_key, &*self.crypto, body)?;

            log::debug!("Call endpoint: {url}");

            // Post it to the URL.
            let response = self.http.post_jose(url, &body).await?;

            // Regardless of the request being a success or not, there might
            // be a nonce in the response.
            let fresh_nonce = response
                .headers()
                .get("replay-nonce")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_owned());

            // Turn errors into problem documents.
            match req_handle_error(response, allowed).await {
                Ok(response) => {
                    self.nonce_pool.store(fresh_nonce);
                    return Ok(response);
                }

                Err(problem) if problem.is_bad_nonce() && !retried_bad_nonce => {
                    // The server invalidated our nonce. It shipped a fresh
                    // one alongside the rejection; the pool contents are
                    // stale, so replace them and retry exactly once.
                    log::debug!("Retrying on bad nonce");
                    self.nonce_pool.replace(fresh_nonce);
                    retried_bad_nonce = true;
                }

                Err(problem) => {
                    self.nonce_pool.store(fresh_nonce);
                    return Err(problem.into());
                }
            }
        }
    }
}

/// Shared pool of nonces.
///
/// Nonces are single-use. Every response replenishes the pool; when it runs
/// dry a HEAD request against `newNonce` fetches one.
#[derive(Debug, Default)]
pub(crate) struct NoncePool {
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

const NONCE_POOL_CAP: usize = 10;

impl NoncePool {
    pub(crate) fn new(nonce_url: &str) -> Self {
        NoncePool {
            nonce_url: nonce_url.to_owned(),
            ..Self::default()
        }
    }

    fn store(&self, nonce: Option<String>) {
        let Some(nonce) = nonce else { return };

        log::trace!("Storing new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce);

        if pool.len() > NONCE_POOL_CAP {
            pool.pop_front();
        }
    }

    /// Throws away everything harvested so far, keeping only `nonce`.
    fn replace(&self, nonce: Option<String>) {
        let mut pool = self.pool.lock();
        pool.clear();
        drop(pool);

        self.store(nonce);
    }

    pub(crate) fn drain(&self) {
        self.pool.lock().clear();
    }

    async fn get_nonce(&self, http: &Http) -> Result<String> {
        {
            let mut pool = self.pool.lock();

            if let Some(nonce) = pool.pop_front() {
                log::trace!("Use previous nonce");
                return Ok(nonce);
            }
        }

        log::debug!("Request new nonce");
        let res = http.head(&self.nonce_url).await?;

        Ok(req_expect_header(&res, "replay-nonce")?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        acc::AcmeKey,
        api,
        crypto::RustCryptoProvider,
        error::Error,
        req::Http,
        test::{with_directory_server, TEST_KEY_1},
    };

    use super::{NoncePool, Transport};

    fn test_transport(nonce_url: &str) -> Transport {
        let crypto = Arc::new(RustCryptoProvider::new());
        let key = AcmeKey::from_pem(TEST_KEY_1, &*crypto).unwrap();
        let http = Http::new("acme-core/test", std::time::Duration::from_secs(30)).unwrap();
        Transport::new(Arc::new(NoncePool::new(nonce_url)), http, crypto, key)
    }

    #[tokio::test]
    async fn test_bad_nonce_recovered_once() {
        let server = with_directory_server();
        let nonce_url = format!("{}/acme/new-nonce", server.url);

        // the next POST is rejected with badNonce; the retry must succeed
        server.state.reject_nonces(1);

        let transport = test_transport(&nonce_url);
        let res = transport
            .call_jwk(
                &format!("{}/acme/new-acct", server.url),
                &api::Account {
                    terms_of_service_agreed: Some(true),
                    ..api::Account::default()
                },
                &[200, 201],
            )
            .await
            .unwrap();

        assert_eq!(res.status().as_u16(), 201);
        assert_eq!(server.state.bad_nonce_rejections(), 1);
    }

    #[tokio::test]
    async fn test_second_bad_nonce_is_surfaced() {
        let server = with_directory_server();
        let nonce_url = format!("{}/acme/new-nonce", server.url);

        server.state.reject_nonces(2);

        let transport = test_transport(&nonce_url);
        let err = transport
            .call_jwk(
                &format!("{}/acme/new-acct", server.url),
                &api::Account::default(),
                &[200, 201],
            )
            .await
            .unwrap_err();

        match err {
            Error::Protocol(problem) => assert!(problem.is_bad_nonce()),
            other => panic!("expected protocol error, got: {other}"),
        }
    }

    #[tokio::test]
    async fn test_disallowed_status_is_a_protocol_error() {
        let server = with_directory_server();
        let nonce_url = format!("{}/acme/new-nonce", server.url);

        let transport = test_transport(&nonce_url);

        // newAccount answers 201 here; with an allow-list of just 200 the
        // call must fail even though the request itself worked
        let err = transport
            .call_jwk(
                &format!("{}/acme/new-acct", server.url),
                &api::Account {
                    terms_of_service_agreed: Some(true),
                    ..api::Account::default()
                },
                &[200],
            )
            .await
            .unwrap_err();

        match err {
            Error::Protocol(problem) => assert_eq!(problem.status, Some(201)),
            other => panic!("expected protocol error, got: {other}"),
        }
    }

    #[test]
    fn test_nonce_pool_caps_and_drains() {
        let pool = NoncePool::new("http://unused.example/new-nonce");

        for i in 0..20 {
            pool.store(Some(format!("nonce-{i}")));
        }
        assert_eq!(pool.pool.lock().len(), 10);

        pool.replace(Some("only".to_owned()));
        assert_eq!(pool.pool.lock().len(), 1);

        pool.drain();
        assert!(pool.pool.lock().is_empty());
    }
}
