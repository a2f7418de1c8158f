//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{acc::AcmeKey, crypto::CryptoProvider, error::Result};

/// JWS Protected Header scheme as defined in [RFC 8555 §6.2].
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// there MUST be a "jwk" field. This field MUST contain the public key corresponding to the
/// private key used to sign the JWS.
/// >
/// > For all other requests, the request is signed using an existing account, and there MUST be a
/// "kid" field. This field MUST contain the account URL received by POSTing to the newAccount
/// resource.
///
/// The nonce is optional because the inner JWS of a key rollover request is
/// the one place a signed body carries no nonce, see [RFC 8555 §7.3.5].
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
/// [RFC 8555 §7.3.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.5
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    /// Algorithm.
    ///
    /// This field MUST NOT contain "none" or a Message Authentication Code (MAC) algorithm.
    ///
    /// This crate signs with RSASSA-PKCS1-v1_5 over SHA-256 ("RS256", RFC 7518).
    alg: String,

    /// A unique value that enables the verifier of a JWS to recognize when replay has occurred.
    ///
    /// As defined in [RFC 8555 §6.5].
    ///
    /// [RFC 8555 §6.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.5
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,

    /// Defined in [RFC 8555 §6.4].
    ///
    /// > The value of the "url" header parameter MUST be a string representing the target URL.
    ///
    /// [RFC 8555 §6.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.4
    url: String,

    /// JSON Web Key.
    ///
    /// Mutually exclusive with `kid` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    /// Key ID.
    ///
    /// Mutually exclusive with `jwk` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

const RS256: &str = "RS256";

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: RS256.to_owned(),
            url: url.to_owned(),
            nonce: Some(nonce),
            jwk: Some(jwk),
            ..Self::default()
        }
    }

    /// Header for the inner JWS of a key rollover; carries no nonce.
    pub(crate) fn new_jwk_no_nonce(jwk: Jwk, url: &str) -> Self {
        JwsProtectedHeader {
            alg: RS256.to_owned(),
            url: url.to_owned(),
            jwk: Some(jwk),
            ..Self::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: RS256.to_owned(),
            url: url.to_owned(),
            nonce: Some(nonce),
            kid: Some(kid.to_owned()),
            ..Self::default()
        }
    }
}

/// An RSA public key in JWK form, as carried in JWS protected headers.
///
/// See [RFC 7517] and, for the thumbprint, [RFC 7638].
///
/// [RFC 7517]: https://datatracker.ietf.org/doc/html/rfc7517
/// [RFC 7638]: https://datatracker.ietf.org/doc/html/rfc7638
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
// LEXICAL ORDER OF FIELDS MATTER!
//
// An RSA JWK's required members are exactly {e, kty, n}, so serializing this
// struct as-is doubles as the canonical thumbprint input.
pub struct Jwk {
    e: String,
    kty: String,
    n: String,
}

impl Jwk {
    /// Derives the JWK from a private key (or certificate) PEM via the
    /// crypto provider.
    pub(crate) fn from_pem(pem: &str, crypto: &dyn CryptoProvider) -> Result<Jwk> {
        let e = crypto.public_exponent(pem)?;
        let n = crypto.modulus(pem)?;

        Ok(Jwk {
            e: BASE64_URL_SAFE_NO_PAD.encode(e),
            kty: "RSA".to_owned(),
            n: BASE64_URL_SAFE_NO_PAD.encode(n),
        })
    }

    /// The RFC 7638 thumbprint: SHA-256 over the canonical `{e, kty, n}`
    /// JSON, base64url-encoded.
    pub fn thumbprint(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(canonical)))
    }
}

/// Computes the key authorization for a challenge token.
///
/// `token || "." || base64url(SHA-256(canonical JWK))` per [RFC 8555 §8.1].
/// With `extra_sha256` the result is hashed and base64url-encoded once more,
/// which is the form published for `dns-01`.
///
/// [RFC 8555 §8.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.1
pub(crate) fn key_authorization(token: &str, jwk: &Jwk, extra_sha256: bool) -> Result<String> {
    let key_auth = format!("{token}.{}", jwk.thumbprint()?);

    let res = if extra_sha256 {
        BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth))
    } else {
        key_auth
    };

    Ok(res)
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Construct a JWS with protected header according to [RFC 7515 §5.1].
///
/// [RFC 7515 §5.1]: https://datatracker.ietf.org/doc/html/rfc7515#section-5.1
pub(crate) fn jws_with<T: Serialize + ?Sized>(
    protected: JwsProtectedHeader,
    key: &AcmeKey,
    crypto: &dyn CryptoProvider,
    payload: &T,
) -> Result<FlattenedJsonJws> {
    let header = {
        let pro_json = serde_json::to_string(&protected)?;
        BASE64_URL_SAFE_NO_PAD.encode(pro_json)
    };

    let payload = {
        let payload_json = serde_json::to_string(payload)?;

        // An empty string payload marks a POST-as-GET and is carried
        // verbatim, not base64url encoded.
        if payload_json == "\"\"" {
            String::new()
        } else {
            BASE64_URL_SAFE_NO_PAD.encode(payload_json)
        }
    };

    let to_sign = format!("{header}.{payload}");
    let signature = crypto.sign_rs256(key.private_key_pem(), to_sign.as_bytes())?;
    let signature = BASE64_URL_SAFE_NO_PAD.encode(signature);

    Ok(FlattenedJsonJws {
        protected: header,
        payload,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypto::RustCryptoProvider;

    #[test]
    fn test_jwk_canonical_field_order() {
        let crypto = RustCryptoProvider::new();
        let jwk = Jwk::from_pem(crate::test::TEST_KEY_1, &crypto).unwrap();

        let json = serde_json::to_string(&jwk).unwrap();

        // thumbprint hashing relies on the exact {e, kty, n} member order
        let e_at = json.find("\"e\"").unwrap();
        let kty_at = json.find("\"kty\"").unwrap();
        let n_at = json.find("\"n\"").unwrap();
        assert!(e_at < kty_at && kty_at < n_at, "canonical order broken: {json}");

        assert!(json.contains("\"kty\":\"RSA\""));
        assert!(!json.contains('='), "JWK members must be unpadded base64url");
    }

    #[test]
    fn test_thumbprint_matches_manual_hash() {
        let crypto = RustCryptoProvider::new();
        let jwk = Jwk::from_pem(crate::test::TEST_KEY_1, &crypto).unwrap();

        let manual = {
            let canonical = serde_json::to_string(&jwk).unwrap();
            BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(canonical))
        };

        assert_eq!(jwk.thumbprint().unwrap(), manual);
    }

    #[test]
    fn test_thumbprint_parity_between_key_and_certificate() {
        let crypto = RustCryptoProvider::new();

        // the JWK (and so the thumbprint) must come out the same whether it
        // is derived from the private key or from a certificate over it
        let from_key = Jwk::from_pem(crate::test::TEST_KEY_1, &crypto).unwrap();
        let from_cert = Jwk::from_pem(crate::test::TEST_CERT_CHAIN, &crypto).unwrap();

        assert_eq!(from_key, from_cert);
        assert_eq!(
            from_key.thumbprint().unwrap(),
            from_cert.thumbprint().unwrap()
        );
    }

    #[test]
    fn test_key_authorization_shape() {
        let crypto = RustCryptoProvider::new();
        let jwk = Jwk::from_pem(crate::test::TEST_KEY_1, &crypto).unwrap();

        let token = "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w";
        let key_auth = key_authorization(token, &jwk, false).unwrap();

        assert_eq!(
            key_auth,
            format!("{token}.{}", jwk.thumbprint().unwrap())
        );

        // the dns-01 form is a digest of the plain form
        let dns = key_authorization(token, &jwk, true).unwrap();
        let expected = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(&key_auth));
        assert_eq!(dns, expected);
    }

    #[test]
    fn test_protected_header_jwk_xor_kid() {
        let crypto = RustCryptoProvider::new();
        let key = AcmeKey::from_pem(crate::test::TEST_KEY_1, &crypto).unwrap();
        let jwk = Jwk::from_pem(crate::test::TEST_KEY_1, &crypto).unwrap();

        let url = "https://example.com/acme/new-acct";

        let with_jwk = JwsProtectedHeader::new_jwk(jwk, url, "nonce-1".to_owned());
        let jws = jws_with(with_jwk, &key, &crypto, &crate::api::EmptyObject).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(
            &BASE64_URL_SAFE_NO_PAD.decode(&jws.protected).unwrap(),
        )
        .unwrap();

        assert_eq!(decoded["alg"], "RS256");
        assert_eq!(decoded["url"], url);
        assert_eq!(decoded["nonce"], "nonce-1");
        assert!(decoded.get("jwk").is_some());
        assert!(decoded.get("kid").is_none());

        let with_kid =
            JwsProtectedHeader::new_kid("https://example.com/acme/acct/1", url, "nonce-2".to_owned());
        let jws = jws_with(with_kid, &key, &crypto, &crate::api::EmptyObject).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(
            &BASE64_URL_SAFE_NO_PAD.decode(&jws.protected).unwrap(),
        )
        .unwrap();

        assert_eq!(decoded["kid"], "https://example.com/acme/acct/1");
        assert!(decoded.get("jwk").is_none());
    }

    #[test]
    fn test_post_as_get_payload_is_empty() {
        let crypto = RustCryptoProvider::new();
        let key = AcmeKey::from_pem(crate::test::TEST_KEY_1, &crypto).unwrap();
        let jwk = Jwk::from_pem(crate::test::TEST_KEY_1, &crypto).unwrap();

        let protected = JwsProtectedHeader::new_jwk(jwk, "https://example.com", "n".to_owned());
        let jws = jws_with(protected, &key, &crypto, &crate::api::EmptyString).unwrap();

        assert_eq!(jws.payload, "");
    }
}
