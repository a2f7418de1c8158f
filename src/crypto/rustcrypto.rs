use std::net::IpAddr;

use der::{
    asn1::{Ia5String, ObjectIdentifier, OctetString},
    Decode as _, DecodePem as _, Encode as _, EncodePem as _,
};
use rsa::{
    pkcs1::DecodeRsaPrivateKey as _,
    pkcs1v15::SigningKey,
    pkcs8::{DecodePrivateKey as _, DecodePublicKey as _, EncodePrivateKey as _, LineEnding},
    signature::{SignatureEncoding as _, Signer as _},
    traits::PublicKeyParts as _,
    RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;
use time::OffsetDateTime;
use x509_cert::{
    builder::{Builder as _, RequestBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    request::CertReq,
    Certificate,
};
use zeroize::Zeroizing;

use super::{CertificateInfo, CryptoProvider, CsrDomains, CsrParams, KeyedCsr, DEFAULT_KEY_BITS};
use crate::error::{Error, Result};

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_EXTENSION_REQUEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

/// Pure-code crypto backend built on the `rsa` and `x509-cert` crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for RustCryptoProvider {
    fn generate_private_key(&self, bits: u32) -> Result<Zeroizing<String>> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits as usize)
            .map_err(|err| Error::Crypto(format!("RSA key generation: {err}")))?;

        key.to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| Error::Crypto(format!("PKCS#8 encoding: {err}")))
    }

    fn modulus(&self, pem: &str) -> Result<Vec<u8>> {
        Ok(public_key_from_pem(pem)?.n().to_bytes_be())
    }

    fn public_exponent(&self, pem: &str) -> Result<Vec<u8>> {
        Ok(public_key_from_pem(pem)?.e().to_bytes_be())
    }

    fn sign_rs256(&self, key_pem: &str, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(private_key_from_pem(key_pem)?);
        let signature = signing_key
            .try_sign(data)
            .map_err(|err| Error::Crypto(format!("RS256 signing: {err}")))?;

        Ok(signature.to_vec())
    }

    fn create_csr(&self, params: &CsrParams, key_pem: Option<&str>) -> Result<KeyedCsr> {
        if params.common_name.is_empty() {
            return Err(Error::Config("CSR requires a common name".to_owned()));
        }

        let private_key_pem = match key_pem {
            Some(pem) => Zeroizing::new(pem.to_owned()),
            None => self.generate_private_key(DEFAULT_KEY_BITS)?,
        };

        let signing_key = SigningKey::<Sha256>::new(private_key_from_pem(&private_key_pem)?);

        let subject = subject_string(params)
            .parse::<Name>()
            .map_err(|err| Error::Crypto(format!("CSR subject: {err}")))?;

        let mut builder = RequestBuilder::new(subject, &signing_key)
            .map_err(|err| Error::Crypto(format!("CSR builder: {err}")))?;

        let san = alt_names_to_general_names(&params.alt_names)?;
        if !san.is_empty() {
            builder
                .add_extension(&SubjectAltName(san))
                .map_err(|err| Error::Crypto(format!("CSR SAN extension: {err}")))?;
        }

        let csr = builder
            .build::<rsa::pkcs1v15::Signature>()
            .map_err(|err| Error::Crypto(format!("CSR signing: {err}")))?;

        let csr_pem = csr
            .to_pem(LineEnding::LF)
            .map_err(|err| Error::Crypto(format!("CSR encoding: {err}")))?;

        Ok(KeyedCsr {
            private_key_pem,
            csr_pem,
        })
    }

    fn csr_domains(&self, csr_pem: &str) -> Result<CsrDomains> {
        let csr = CertReq::from_pem(csr_pem)
            .map_err(|err| Error::Crypto(format!("CSR parsing: {err}")))?;

        let mut alt_names = Vec::new();

        for attribute in csr.info.attributes.iter() {
            if attribute.oid != OID_EXTENSION_REQUEST {
                continue;
            }

            for value in attribute.values.iter() {
                let extensions: x509_cert::ext::Extensions = value
                    .decode_as()
                    .map_err(|err| Error::Crypto(format!("CSR extensionRequest: {err}")))?;

                for extension in &extensions {
                    if extension.extn_id == OID_SUBJECT_ALT_NAME {
                        alt_names.extend(decode_san(extension.extn_value.as_bytes())?);
                    }
                }
            }
        }

        Ok(CsrDomains {
            common_name: first_common_name(&csr.info.subject),
            alt_names,
        })
    }

    fn certificate_info(&self, cert_pem: &str) -> Result<CertificateInfo> {
        let cert = Certificate::from_pem(cert_pem)
            .map_err(|err| Error::Crypto(format!("certificate parsing: {err}")))?;

        let tbs = &cert.tbs_certificate;

        let mut alt_names = Vec::new();
        for extension in tbs.extensions.iter().flatten() {
            if extension.extn_id == OID_SUBJECT_ALT_NAME {
                alt_names.extend(decode_san(extension.extn_value.as_bytes())?);
            }
        }

        Ok(CertificateInfo {
            common_name: first_common_name(&tbs.subject),
            alt_names,
            not_before: to_offset_date_time(&tbs.validity.not_before)?,
            not_after: to_offset_date_time(&tbs.validity.not_after)?,
        })
    }
}

fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|err| Error::Config(format!("unable to parse RSA private key: {err}")))
}

fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    if pem.contains("-----BEGIN CERTIFICATE-----") {
        let cert = Certificate::from_pem(pem)
            .map_err(|err| Error::Crypto(format!("certificate parsing: {err}")))?;

        let spki = cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|err| Error::Crypto(format!("SPKI encoding: {err}")))?;

        RsaPublicKey::from_public_key_der(&spki)
            .map_err(|err| Error::Crypto(format!("certificate carries no RSA key: {err}")))
    } else {
        Ok(private_key_from_pem(pem)?.to_public_key())
    }
}

/// Renders the subject in the same attribute order the openssl backend
/// passes to `-subj`, so both backends emit byte-identical subjects.
fn subject_string(params: &CsrParams) -> String {
    let mut parts = Vec::new();

    for (attr, value) in [
        ("C", &params.country),
        ("ST", &params.state),
        ("L", &params.locality),
        ("O", &params.organization),
        ("OU", &params.organization_unit),
    ] {
        if let Some(value) = value {
            parts.push(format!("{attr}={value}"));
        }
    }

    parts.push(format!("CN={}", params.common_name));
    parts.join(",")
}

fn alt_names_to_general_names(alt_names: &[String]) -> Result<Vec<GeneralName>> {
    let mut seen = Vec::new();
    let mut out = Vec::new();

    for name in alt_names {
        if seen.contains(name) {
            continue;
        }
        seen.push(name.clone());

        match name.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => out.push(GeneralName::IpAddress(
                OctetString::new(ip.octets().to_vec())
                    .map_err(|err| Error::Crypto(format!("SAN IP entry: {err}")))?,
            )),
            Ok(IpAddr::V6(ip)) => out.push(GeneralName::IpAddress(
                OctetString::new(ip.octets().to_vec())
                    .map_err(|err| Error::Crypto(format!("SAN IP entry: {err}")))?,
            )),
            Err(_) => out.push(GeneralName::DnsName(
                Ia5String::new(name)
                    .map_err(|err| Error::Crypto(format!("SAN DNS entry `{name}`: {err}")))?,
            )),
        }
    }

    Ok(out)
}

fn decode_san(der: &[u8]) -> Result<Vec<String>> {
    let san = SubjectAltName::from_der(der)
        .map_err(|err| Error::Crypto(format!("SAN parsing: {err}")))?;

    Ok(san
        .0
        .iter()
        .filter_map(|name| match name {
            GeneralName::DnsName(dns) => Some(dns.to_string()),
            GeneralName::IpAddress(octets) => ip_from_octets(octets.as_bytes()),
            _ => None,
        })
        .collect())
}

fn ip_from_octets(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets).to_string())
        }
        _ => None,
    }
}

fn first_common_name(name: &Name) -> Option<String> {
    for rdn in name.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid == OID_COMMON_NAME {
                return atv_string(&atv.value);
            }
        }
    }

    None
}

fn atv_string(value: &der::Any) -> Option<String> {
    if let Ok(s) = value.decode_as::<der::asn1::Utf8StringRef<'_>>() {
        return Some(s.to_string());
    }
    if let Ok(s) = value.decode_as::<der::asn1::PrintableStringRef<'_>>() {
        return Some(s.to_string());
    }
    if let Ok(s) = value.decode_as::<der::asn1::Ia5StringRef<'_>>() {
        return Some(s.to_string());
    }

    None
}

fn to_offset_date_time(t: &x509_cert::time::Time) -> Result<OffsetDateTime> {
    let unix = t.to_date_time().unix_duration();

    OffsetDateTime::from_unix_timestamp(unix.as_secs() as i64)
        .map_err(|err| Error::Crypto(format!("certificate validity: {err}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test::TEST_KEY_1;

    #[test]
    fn test_modulus_and_exponent_are_minimal_big_endian() {
        let crypto = RustCryptoProvider::new();

        let n = crypto.modulus(TEST_KEY_1).unwrap();
        let e = crypto.public_exponent(TEST_KEY_1).unwrap();

        // 2048-bit modulus, no leading zero byte
        assert_eq!(n.len(), 256);
        assert_ne!(n[0], 0);

        // the common exponent 65537
        assert_eq!(e, vec![0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_sign_rs256_is_deterministic() {
        let crypto = RustCryptoProvider::new();

        let sig1 = crypto.sign_rs256(TEST_KEY_1, b"hello").unwrap();
        let sig2 = crypto.sign_rs256(TEST_KEY_1, b"hello").unwrap();

        assert_eq!(sig1.len(), 256);
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_csr_round_trip_preserves_san_order() {
        let crypto = RustCryptoProvider::new();

        let params = CsrParams {
            common_name: "example.com".to_owned(),
            alt_names: vec![
                "example.com".to_owned(),
                "www.example.com".to_owned(),
                "192.0.2.7".to_owned(),
            ],
            organization: Some("Example Org".to_owned()),
            ..CsrParams::default()
        };

        let bundle = crypto.create_csr(&params, Some(TEST_KEY_1)).unwrap();
        let domains = crypto.csr_domains(&bundle.csr_pem).unwrap();

        assert_eq!(domains.common_name.as_deref(), Some("example.com"));
        assert_eq!(
            domains.alt_names,
            ["example.com", "www.example.com", "192.0.2.7"]
        );
        assert_eq!(
            domains.identifiers(),
            ["example.com", "www.example.com", "192.0.2.7"]
        );
    }

    #[test]
    fn test_csr_requires_common_name() {
        let crypto = RustCryptoProvider::new();

        let err = crypto
            .create_csr(&CsrParams::default(), Some(TEST_KEY_1))
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_wildcard_common_name_survives_round_trip() {
        let crypto = RustCryptoProvider::new();

        let params = CsrParams {
            common_name: "*.example.com".to_owned(),
            alt_names: vec!["*.example.com".to_owned()],
            ..CsrParams::default()
        };

        let bundle = crypto.create_csr(&params, Some(TEST_KEY_1)).unwrap();
        let domains = crypto.csr_domains(&bundle.csr_pem).unwrap();

        assert_eq!(domains.common_name.as_deref(), Some("*.example.com"));
        assert_eq!(domains.alt_names, ["*.example.com"]);
    }
}
