//! JSON API payloads.
//!
//! Not intended to be used directly. Provided to aid debugging.

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

mod account;
mod authorization;
mod challenge;
mod directory;
mod finalize;
mod identifier;
mod key_change;
mod order;
mod revocation;

pub use self::{
    account::{Account, AccountStatus},
    authorization::{Authorization, AuthorizationStatus},
    challenge::{Challenge, ChallengeKind, ChallengeResponse, ChallengeStatus},
    directory::{Directory, DirectoryMeta, Resource},
    finalize::Finalize,
    identifier::Identifier,
    key_change::KeyChange,
    order::{Order, OrderStatus},
    revocation::Revocation,
};

/// Serializes to `""`.
pub struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`.
pub struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// Classification of the problem types this crate reacts to.
///
/// See [RFC 8555 §6.7].
///
/// [RFC 8555 §6.7]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    /// The nonce in the JWS was already used or never issued.
    BadNonce,
    /// The server requires human intervention, e.g. re-agreeing to updated
    /// terms of service.
    UserActionRequired,
    /// A rate limit was hit; retrying immediately will not help.
    RateLimited,
    /// The account lacks authorization for the request, or the JWS was
    /// signed with the wrong key.
    Unauthorized,
    /// Anything else.
    Other,
}

/// An ACME problem document.
///
/// See [RFC 8555 §6.7].
///
/// [RFC 8555 §6.7]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.7
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// HTTP status the problem travelled with. Filled in by the transport,
    /// not part of the wire document for error responses that omit it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    /// The problem name with the RFC 8555 (or legacy draft) urn prefix
    /// stripped.
    pub fn error_name(&self) -> &str {
        self._type
            .strip_prefix("urn:ietf:params:acme:error:")
            .or_else(|| self._type.strip_prefix("urn:acme:error:"))
            .unwrap_or(&self._type)
    }

    pub fn kind(&self) -> ProblemKind {
        match self.error_name() {
            "badNonce" => ProblemKind::BadNonce,
            "userActionRequired" => ProblemKind::UserActionRequired,
            "rateLimited" => ProblemKind::RateLimited,
            "unauthorized" => ProblemKind::Unauthorized,
            _ => ProblemKind::Other,
        }
    }

    /// Returns true if problem type is "badNonce".
    pub fn is_bad_nonce(&self) -> bool {
        self.kind() == ProblemKind::BadNonce
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            _ => write!(f, "{}", self._type),
        }
    }
}

impl std::error::Error for Problem {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_empty_string() {
        let x = serde_json::to_string(&EmptyString).unwrap();
        assert_eq!("\"\"", x);
    }

    #[test]
    fn test_api_empty_object() {
        let x = serde_json::to_string(&EmptyObject).unwrap();
        assert_eq!("{}", x);
    }

    #[test]
    fn test_problem_kind() {
        let urn = Problem {
            _type: "urn:ietf:params:acme:error:badNonce".to_owned(),
            ..Problem::default()
        };
        assert_eq!(urn.kind(), ProblemKind::BadNonce);
        assert!(urn.is_bad_nonce());

        let legacy = Problem {
            _type: "urn:acme:error:rateLimited".to_owned(),
            ..Problem::default()
        };
        assert_eq!(legacy.kind(), ProblemKind::RateLimited);

        let other = Problem {
            _type: "urn:ietf:params:acme:error:dns".to_owned(),
            ..Problem::default()
        };
        assert_eq!(other.kind(), ProblemKind::Other);
        assert_eq!(other.error_name(), "dns");
    }
}
