use serde::{Deserialize, Serialize};

use crate::jws::Jwk;

/// Inner payload of a key rollover request.
///
/// This document is signed by the *new* account key (carried in the inner
/// JWS `jwk` header) and then wrapped in an outer JWS signed by the old key.
///
/// See [RFC 8555 §7.3.5].
///
/// [RFC 8555 §7.3.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.5
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChange {
    /// The account URL whose key is being replaced.
    pub account: String,

    /// The JWK of the key being replaced.
    pub old_key: Jwk,
}
