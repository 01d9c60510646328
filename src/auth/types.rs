use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Tokens are considered expired this many seconds before their real expiry
const EXPIRY_SKEW_SECS: i64 = 60;

/// Where a bearer token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    /// Browser-redirect OAuth against the platform
    Direct,
    /// Exchanged through the delegated token broker
    Broker,
}

/// Bearer token with optional expiry
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub value: String,
    /// `None` when the platform did not report an expiry
    pub expires_at: Option<DateTime<Utc>>,
    pub source: TokenSource,
}

impl Token {
    /// Create a token that expires `expires_in` seconds from now (if known).
    ///
    /// A lifetime too large to represent is treated as unknown.
    pub fn new(value: String, expires_in: Option<u64>, source: TokenSource) -> Self {
        let expires_at = expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));

        Self {
            value,
            expires_at,
            source,
        }
    }

    /// Create a token with an absolute expiry
    pub fn with_expiry(
        value: String,
        expires_at: Option<DateTime<Utc>>,
        source: TokenSource,
    ) -> Self {
        Self {
            value,
            expires_at,
            source,
        }
    }

    /// Check if the token is expired (with 60s buffer).
    ///
    /// Tokens without a known expiry never expire locally; the remote API
    /// is the only authority on them.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }

    /// Seconds until expiry, if known
    pub fn expires_in(&self) -> Option<i64> {
        self.expires_at
            .map(|expires_at| (expires_at - Utc::now()).num_seconds())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("source", &self.source)
            .finish()
    }
}

/// Authentication failures.
///
/// `Clone` so a single in-flight refresh can hand the same outcome to every
/// waiting caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("No authentication configured. Set PIPEBOARD_API_TOKEN (broker) or META_APP_ID (direct OAuth)")]
    NotConfigured,

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Timed out after {0}s waiting for the OAuth redirect")]
    Timeout(u64),

    #[error("Authorization denied: {0}")]
    Denied(String),

    #[error("CSRF validation failed")]
    CsrfValidationFailed,

    #[error("OAuth2 error: {0}")]
    OAuth2Error(String),

    #[error("Token broker error {status}: {message}")]
    BrokerError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Token storage error: {0}")]
    TokenStorageError(String),

    #[error("Token encryption error: {0}")]
    EncryptionError(String),

    #[error("Callback server error: {0}")]
    CallbackServer(String),
}

impl<RE, T> From<oauth2::RequestTokenError<RE, T>> for AuthError
where
    RE: std::error::Error + 'static,
    T: oauth2::ErrorResponse + 'static,
{
    fn from(err: oauth2::RequestTokenError<RE, T>) -> Self {
        match err {
            oauth2::RequestTokenError::Request(e) => AuthError::Network(e.to_string()),
            other => AuthError::OAuth2Error(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        // The URL may carry credentials in its query
        AuthError::Network(err.without_url().to_string())
    }
}
