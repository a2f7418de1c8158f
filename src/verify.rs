//! Pre-flight checks that a challenge response is actually visible before
//! the ACME server is asked to look for it.
//!
//! All three probes report a [`TransportError::Verification`] until the
//! expected value shows up; the orchestrator runs them under the account's
//! retry policy so propagation delays are absorbed by backoff.

use std::sync::Arc;

use der::{asn1::ObjectIdentifier, Decode as _};
use hickory_resolver::TokioAsyncResolver;
use sha2::{Digest as _, Sha256};

use crate::{
    error::{Result, TransportError},
    req::Http,
};

/// id-pe-acmeIdentifier, RFC 8737 §6.1.
const OID_ACME_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.31");

const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

/// The ALPN protocol name for tls-alpn-01, RFC 8737 §4.
const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// Fetches `http://<domain>/.well-known/acme-challenge/<token>` and compares
/// the (trimmed) body against the key authorization.
pub(crate) async fn verify_http01(
    http: &Http,
    domain: &str,
    token: &str,
    key_authorization: &str,
) -> Result<()> {
    let url = format!("http://{domain}/.well-known/acme-challenge/{token}");

    let res = http.get(&url).await?;
    let status = res.status().as_u16();
    let body = crate::req::req_safe_read_body(res).await;

    if status != 200 {
        return Err(TransportError::Verification(format!(
            "{url} answered with status {status}"
        ))
        .into());
    }

    if body.trim() != key_authorization {
        return Err(TransportError::Verification(format!(
            "{url} serves the wrong key authorization"
        ))
        .into());
    }

    log::debug!("http-01 self-verification passed for {domain}");
    Ok(())
}

/// Resolves TXT records at `_acme-challenge.<domain>` and checks the hashed
/// key authorization is among them.
///
/// Additional TXT records under the same name are fine (SAN orders on
/// overlapping zones publish several).
pub(crate) async fn verify_dns01(domain: &str, dns_digest: &str) -> Result<()> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|err| {
        TransportError::Verification(format!("system DNS configuration: {err}"))
    })?;

    let record_name = format!("_acme-challenge.{}.", domain.trim_end_matches('.'));

    let lookup = resolver
        .txt_lookup(record_name.clone())
        .await
        .map_err(|err| TransportError::Verification(format!("{record_name} TXT: {err}")))?;

    let found = lookup
        .iter()
        .flat_map(|txt| txt.txt_data())
        .any(|data| String::from_utf8_lossy(data).trim() == dns_digest);

    if !found {
        return Err(TransportError::Verification(format!(
            "{record_name} has no TXT record matching the challenge digest"
        ))
        .into());
    }

    log::debug!("dns-01 self-verification passed for {domain}");
    Ok(())
}

/// Opens a TLS connection with the `acme-tls/1` ALPN protocol and inspects
/// the offered certificate: the SAN must name the identifier and the
/// `id-pe-acmeIdentifier` extension must carry SHA-256 of the key
/// authorization.
///
/// Chain validation is deliberately skipped; the validation certificate is
/// self-signed by design.
pub(crate) async fn verify_tls_alpn01(domain: &str, key_authorization: &str) -> Result<()> {
    use rustls::client::danger;
    use rustls::pki_types::ServerName;

    #[derive(Debug)]
    struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

    impl danger::ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<danger::ServerCertVerified, rustls::Error> {
            // the certificate itself is inspected after the handshake
            Ok(danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error> {
            Ok(danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<danger::HandshakeSignatureValid, rustls::Error> {
            Ok(danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| TransportError::Verification(format!("TLS config: {err}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    config.alpn_protocols = vec![ACME_TLS_ALPN_PROTOCOL.to_vec()];

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(domain.to_owned())
        .map_err(|err| TransportError::Verification(format!("server name {domain}: {err}")))?;

    let tcp = tokio::net::TcpStream::connect((domain, 443))
        .await
        .map_err(|err| TransportError::Verification(format!("connect {domain}:443: {err}")))?;

    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|err| TransportError::Verification(format!("TLS handshake: {err}")))?;

    let (_, connection) = tls.get_ref();

    if connection.alpn_protocol() != Some(ACME_TLS_ALPN_PROTOCOL) {
        return Err(TransportError::Verification(format!(
            "{domain} did not negotiate acme-tls/1"
        ))
        .into());
    }

    let certs = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| {
            TransportError::Verification(format!("{domain} offered no certificate"))
        })?;

    let cert = x509_cert::Certificate::from_der(certs.as_ref())
        .map_err(|err| TransportError::Verification(format!("validation cert: {err}")))?;

    let expected_digest: [u8; 32] = Sha256::digest(key_authorization).into();
    let mut san_matched = false;
    let mut digest_matched = false;

    for extension in cert.tbs_certificate.extensions.iter().flatten() {
        if extension.extn_id == OID_SUBJECT_ALT_NAME {
            let san =
                x509_cert::ext::pkix::SubjectAltName::from_der(extension.extn_value.as_bytes())
                    .map_err(|err| {
                        TransportError::Verification(format!("validation cert SAN: {err}"))
                    })?;

            san_matched = san.0.iter().any(|name| {
                matches!(
                    name,
                    x509_cert::ext::pkix::name::GeneralName::DnsName(dns)
                        if dns.to_string().eq_ignore_ascii_case(domain)
                )
            });
        } else if extension.extn_id == OID_ACME_IDENTIFIER {
            // extension value is an OCTET STRING wrapping the raw digest
            let inner = der::asn1::OctetString::from_der(extension.extn_value.as_bytes())
                .map_err(|err| {
                    TransportError::Verification(format!("acmeIdentifier extension: {err}"))
                })?;
            digest_matched = inner.as_bytes() == expected_digest;
        }
    }

    if !san_matched {
        return Err(TransportError::Verification(format!(
            "validation cert does not name {domain}"
        ))
        .into());
    }

    if !digest_matched {
        return Err(TransportError::Verification(
            "validation cert acmeIdentifier digest mismatch".to_owned(),
        )
        .into());
    }

    log::debug!("tls-alpn-01 self-verification passed for {domain}");
    Ok(())
}

/// The published form of a challenge proof, as handed to self-verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChallengeProof {
    /// http-01: the key authorization served verbatim.
    Http { token: String, key_auth: String },
    /// dns-01: base64url(SHA-256(key authorization)) in a TXT record.
    Dns { digest: String },
    /// tls-alpn-01: SHA-256(key authorization) in the acmeIdentifier
    /// extension.
    TlsAlpn { key_auth: String },
}

impl ChallengeProof {
    pub(crate) async fn verify(&self, http: &Http, domain: &str) -> Result<()> {
        match self {
            ChallengeProof::Http { token, key_auth } => {
                verify_http01(http, domain, token, key_auth).await
            }
            ChallengeProof::Dns { digest } => verify_dns01(domain, digest).await,
            ChallengeProof::TlsAlpn { key_auth } => verify_tls_alpn01(domain, key_auth).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::req::Http;

    #[tokio::test]
    async fn test_http01_mismatch_is_verification_error() {
        let server = crate::test::with_challenge_file_server("served-value");

        let http = Http::new("acme-core/test", std::time::Duration::from_secs(5)).unwrap();

        // serving some other value must not verify
        let err = verify_http01(&http, &server.host, "token", "expected-value")
            .await
            .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("self-verification"), "{rendered}");

        // serving the right value must verify
        verify_http01(&http, &server.host, "token", "served-value")
            .await
            .unwrap();
    }

    #[test]
    fn test_dns_record_name_shape() {
        // guard the record name formatting against fqdn dots
        let name = format!("_acme-challenge.{}.", "example.com".trim_end_matches('.'));
        assert_eq!(name, "_acme-challenge.example.com.");

        let name = format!("_acme-challenge.{}.", "example.com.".trim_end_matches('.'));
        assert_eq!(name, "_acme-challenge.example.com.");
    }
}
