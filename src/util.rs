use base64::prelude::*;
use serde::de;

use crate::error::{Error, Result, TransportError};

/// Extracts the DER body of the first PEM block carrying `label`.
///
/// Handles the armor produced by this crate and by openssl; PEM headers are
/// not supported.
pub(crate) fn der_from_pem(pem: &str, label: &str) -> Result<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let start = pem
        .find(&begin)
        .ok_or_else(|| Error::Config(format!("no `{label}` PEM block found")))?
        + begin.len();
    let stop = pem[start..]
        .find(&end)
        .ok_or_else(|| Error::Config(format!("unterminated `{label}` PEM block")))?
        + start;

    let body = pem[start..stop]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>();

    BASE64_STANDARD
        .decode(body)
        .map_err(|err| Error::Config(format!("invalid PEM base64: {err}")))
}

pub(crate) async fn read_json<T: de::DeserializeOwned>(res: reqwest::Response) -> Result<T> {
    let res_body = crate::req::req_safe_read_body(res).await;
    log::debug!("{res_body}");
    Ok(serde_json::from_str(&res_body).map_err(TransportError::from)?)
}

#[cfg(test)]
mod tests {
    use base64::prelude::*;

    use super::*;

    #[test]
    fn test_base64url_round_trip() {
        let inputs: &[&[u8]] = &[b"", b"f", b"fo", b"foo", b"foob", &[0xff, 0x00, 0xfb, 0x3e]];

        for input in inputs {
            let encoded = BASE64_URL_SAFE_NO_PAD.encode(input);
            assert!(!encoded.contains('='));

            // undo the url-safe alphabet by hand and decode with padding
            let mut standard = encoded.replace('-', "+").replace('_', "/");
            while standard.len() % 4 != 0 {
                standard.push('=');
            }

            let decoded = BASE64_STANDARD.decode(standard).unwrap();
            assert_eq!(&decoded, input);
        }
    }

    #[test]
    fn test_der_from_pem() {
        let pem = "-----BEGIN CERTIFICATE REQUEST-----\nAQID\n-----END CERTIFICATE REQUEST-----\n";
        let der = der_from_pem(pem, "CERTIFICATE REQUEST").unwrap();
        assert_eq!(der, vec![1, 2, 3]);

        assert!(der_from_pem(pem, "CERTIFICATE").is_err());
    }
}
