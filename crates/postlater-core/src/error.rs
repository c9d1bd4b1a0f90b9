//! Error taxonomy shared by every Postlater crate.

use thiserror::Error;

/// Remote error codes meaning the access token behind a client is no longer accepted.
const AUTH_FAILURE_CODES: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "token_expired",
    "token_revoked",
    "account_inactive",
];

#[derive(Debug, Error)]
pub enum PostlaterError {
    /// No credential for the (workspace, user) pair, or it expired with no way to refresh.
    #[error("credential missing: {0}")]
    CredentialMissing(String),

    /// The refresh exchange failed. The stored credential was left untouched.
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    /// The remote API answered with `ok = false`.
    #[error("{code}")]
    RemoteApi { code: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PostlaterError {
    pub fn remote(code: impl Into<String>) -> Self {
        Self::RemoteApi { code: code.into() }
    }

    /// True when the remote side rejected the token itself, so any cached client
    /// built from it is useless until credentials are re-read.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::RemoteApi { code } => AUTH_FAILURE_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// The remote error code, when the failure came from the remote API.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::RemoteApi { code } => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PostlaterError>;
