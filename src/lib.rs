//! Provisioning certificates from ACME (Automatic Certificate Management Environment) providers
//! such as [Let's Encrypt](https://letsencrypt.org/).
//!
//! It follows the [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555) spec, using ACME v2 to
//! issue/renew certificates, signing every request with an RSA account key ("RS256").
//!
//! # Usage
//!
//! There are two levels of API.
//!
//! - The facade types ([`Directory`] → [`Account`] → [`order`] types) walk
//!   the protocol one resource at a time and leave challenge provisioning
//!   entirely to you.
//! - [`Account::auto()`] / [`Directory::auto()`] run a whole order: you
//!   hand over a CSR and two callbacks that publish and withdraw challenge
//!   responses, and get back the certificate chain.
//!
//! # Domain Ownership
//!
//! Most website TLS certificates tries to prove ownership/control over the domain they are issued
//! for. For ACME, this means proving you control either:
//!
//! - a server answering TLS or HTTP requests for that domain;
//! - the DNS server answering name lookups against the domain.
//!
//! To use this library, there are points in the flow where you would need to modify either the web
//! server or DNS server before progressing to get the certificate. In auto mode those points are
//! the two challenge callbacks; with the facade types they sit between obtaining a
//! [`Challenge`](order::Challenge) and calling `validate` on it.
//!
//! Wildcard domains can only be proven via DNS (`dns-01`); this crate enforces that during
//! challenge selection.
//!
//! ## Multiple Domains
//!
//! When creating a new order, it's possible to provide multiple alt-names that will also be part of
//! the certificate. The ACME API requires you to prove ownership of each such domain. See
//! [`authorizations`].
//!
//! # Crypto backends
//!
//! All key material handling sits behind [`crypto::CryptoProvider`]. The default backend is pure
//! Rust ([`crypto::RustCryptoProvider`]); an alternative drives the `openssl` command line tool
//! ([`crypto::OpensslCliProvider`]). Pick one in [`DirectoryOptions`].
//!
//! # Rate Limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being abused. It
//! might be tempting to lower this crate's backoff settings, but balance this against the real risk
//! of having access cut off.
//!
//! ## Use Staging For Development!
//!
//! Especially take care to use the Let's Encrypt staging environment for development where the rate
//! limits are more relaxed. See [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [`authorizations`]: crate::order::NewOrder::authorizations()
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod acc;
mod auto;
mod cert;
mod dir;
mod error;
mod jws;
mod req;
mod retry;
mod trans;
mod util;
mod verify;

pub mod api;
pub mod crypto;
pub mod order;

#[cfg(test)]
mod test;

pub use crate::{
    acc::{Account, RevocationReason},
    auto::{AutoOptions, CallbackError, ChallengeCallback},
    cert::Certificate,
    dir::{Directory, DirectoryOptions, DirectoryUrl},
    error::{Entity, Error, Result, TransportError},
    jws::Jwk,
    retry::{CancelHandle, RetryPolicy},
};
