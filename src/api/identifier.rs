use serde::{Deserialize, Serialize};

/// A (type, value) pair naming what a certificate will cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub(crate) fn dns(value: &str) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }

    pub fn is_type_dns(&self) -> bool {
        self._type == "dns"
    }

    /// Returns true for wildcard DNS identifiers (`*.example.com`).
    ///
    /// Wildcard identifiers can only be validated via `dns-01`, see
    /// [RFC 8555 §7.1.3].
    ///
    /// [RFC 8555 §7.1.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.3
    pub fn is_wildcard(&self) -> bool {
        self.is_type_dns() && self.value.starts_with("*.")
    }
}
