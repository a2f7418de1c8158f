use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Directory object for ACME client self-configuration.
///
/// See [RFC 8555 §7.1.1].
///
/// # Example JSON
///
/// ```json
/// {
///   "newNonce": "https://example.com/acme/new-nonce",
///   "newAccount": "https://example.com/acme/new-account",
///   "newOrder": "https://example.com/acme/new-order",
///   "newAuthz": "https://example.com/acme/new-authz",
///   "revokeCert": "https://example.com/acme/revoke-cert",
///   "keyChange": "https://example.com/acme/key-change",
///   "meta": {
///     "termsOfService": "https://example.com/acme/terms/2017-5-30",
///     "website": "https://www.example.com/",
///     "caaIdentities": ["example.com"],
///     "externalAccountRequired": false
///   }
/// }
/// ```
///
/// [RFC 8555 §7.1.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.1
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// URL for new nonce requests.
    pub new_nonce: String,

    /// URL for new account requests.
    pub new_account: String,

    /// URL for new order requests.
    pub new_order: String,

    /// URL for new authorization requests.
    ///
    /// If the ACME server does not implement [pre-authorization], it MUST
    /// omit the `newAuthz` field of the directory.
    ///
    /// [pre-authorization]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.4.1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,

    /// URL for certificate revocation requests.
    pub revoke_cert: String,

    /// URL for key change requests.
    pub key_change: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

impl Directory {
    /// Looks up the endpoint URL for a known resource.
    ///
    /// [`Resource::Meta`] has no URL of its own and reports an error, as do
    /// resources the server's directory did not advertise.
    pub fn resource_url(&self, resource: Resource) -> Result<&str, Error> {
        match resource {
            Resource::NewNonce => Ok(&self.new_nonce),
            Resource::NewAccount => Ok(&self.new_account),
            Resource::NewOrder => Ok(&self.new_order),
            Resource::RevokeCert => Ok(&self.revoke_cert),
            Resource::KeyChange => Ok(&self.key_change),
            Resource::Meta => Err(Error::Config(
                "`meta` is not a URL-addressed directory resource".to_owned(),
            )),
        }
    }
}

/// The closed set of directory resources this crate recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    NewNonce,
    NewAccount,
    NewOrder,
    RevokeCert,
    KeyChange,
    Meta,
}

impl Resource {
    pub fn name(self) -> &'static str {
        match self {
            Resource::NewNonce => "newNonce",
            Resource::NewAccount => "newAccount",
            Resource::NewOrder => "newOrder",
            Resource::RevokeCert => "revokeCert",
            Resource::KeyChange => "keyChange",
            Resource::Meta => "meta",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newNonce" => Ok(Resource::NewNonce),
            "newAccount" => Ok(Resource::NewAccount),
            "newOrder" => Ok(Resource::NewOrder),
            "revokeCert" => Ok(Resource::RevokeCert),
            "keyChange" => Ok(Resource::KeyChange),
            "meta" => Ok(Resource::Meta),
            other => Err(Error::Config(format!(
                "unknown directory resource: {other}"
            ))),
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc8555#section-9.7.6>
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    /// URL identifying the current terms of service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,

    /// URL locating a website providing more information about the ACME
    /// server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    /// The hostnames that the ACME server recognizes as referring to itself
    /// for the purposes of Certification Authority Authorization (CAA)
    /// record validation as defined in [RFC 6844].
    ///
    /// [RFC 6844]: https://datatracker.ietf.org/doc/html/rfc6844
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caa_identities: Option<Vec<String>>,

    /// If true, then the CA requires that all newAccount requests include an
    /// `externalAccountBinding` field associating the new account with an
    /// external account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_required: Option<bool>,
}

impl DirectoryMeta {
    pub fn external_account_required(&self) -> bool {
        self.external_account_required.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_lookup() {
        let dir = Directory {
            new_nonce: "https://example.com/acme/new-nonce".to_owned(),
            new_account: "https://example.com/acme/new-acct".to_owned(),
            new_order: "https://example.com/acme/new-order".to_owned(),
            revoke_cert: "https://example.com/acme/revoke-cert".to_owned(),
            key_change: "https://example.com/acme/key-change".to_owned(),
            ..Directory::default()
        };

        let resource = "newOrder".parse::<Resource>().unwrap();
        assert_eq!(
            dir.resource_url(resource).unwrap(),
            "https://example.com/acme/new-order"
        );

        assert!("newFoo".parse::<Resource>().is_err());
        assert!(dir.resource_url(Resource::Meta).is_err());
    }
}
