use std::fmt;

use crate::api::Problem;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by this crate.
///
/// Transient conditions (a `badNonce` rejection, a pending authorization) are
/// retried internally; what reaches the caller is either a terminal protocol
/// or state error, or [`Error::Timeout`] once the retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid client options, including unparseable key material.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The crypto provider failed to perform a capability.
    #[error("crypto provider: {0}")]
    Crypto(String),

    /// Network failure, TLS error, or a malformed response body.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Problem document returned by the ACME API.
    ///
    /// `badNonce` rejections are recovered once per request before one of
    /// these is surfaced.
    #[error(transparent)]
    Protocol(#[from] Problem),

    /// An order, authorization, or challenge reached a terminal invalid
    /// state.
    #[error("{entity} is in a terminal state: {reason}")]
    State { entity: Entity, reason: String },

    /// A challenge callback supplied by the caller failed.
    #[error("challenge callback failed: {0}")]
    Callback(String),

    /// A polled resource has not reached a usable state yet.
    ///
    /// Treated as transient inside polling loops; callers only ever see it
    /// wrapped in [`Error::Timeout`].
    #[error("{entity} is still {status}")]
    Pending { entity: Entity, status: String },

    /// The retry budget was exhausted without reaching a usable state.
    #[error("gave up after {attempts} attempts: {last}")]
    Timeout { attempts: usize, last: Box<Error> },

    /// The caller cancelled the operation; cleanup callbacks have run.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn state(entity: Entity, reason: impl Into<String>) -> Self {
        Error::State {
            entity,
            reason: reason.into(),
        }
    }

    /// Returns the ACME problem document, if this error carries one.
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Error::Protocol(problem) => Some(problem),
            Error::Timeout { last, .. } => last.problem(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(TransportError::Http(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Transport(TransportError::Json(err))
    }
}

/// Lower-level transport failures, wrapped by [`Error::Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("expected a JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing response header: {0}")]
    MissingHeader(&'static str),

    /// A self-verification probe observed something other than the expected
    /// challenge response. Transient until the retry budget runs out.
    #[error("self-verification: {0}")]
    Verification(String),
}

/// The protocol entity a [`Error::State`] or failure stage refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Account,
    Order,
    Authorization,
    Challenge,
    Finalize,
    Download,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Account => "account",
            Entity::Order => "order",
            Entity::Authorization => "authorization",
            Entity::Challenge => "challenge",
            Entity::Finalize => "finalize",
            Entity::Download => "download",
        })
    }
}
