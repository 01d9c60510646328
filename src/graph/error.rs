use super::params::{redact, Params};
use crate::auth::AuthError;
use crate::callback::CallbackError;
use crate::confirm::ConfirmError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Graph error codes that mean the token itself is bad
const AUTH_ERROR_CODES: &[i64] = &[102, 190, 463];

/// Failure classes reported to the calling agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    AuthRequired,
    AuthTimeout,
    AuthDenied,
    TokenExpiredOrInvalid,
    NetworkError,
    #[serde(rename = "RemoteAPIError")]
    RemoteApiError,
    ConfirmationStale,
    ConfirmationPending,
}

/// What the agent should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    ReAuthenticate,
    AskHuman,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Access token expired or invalid: {message}")]
    TokenExpiredOrInvalid { message: String, code: Option<i64> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Graph API error {status}: {message}")]
    Remote {
        status: u16,
        message: String,
        body: Option<Value>,
    },

    #[error("Malformed response body: {0}")]
    MalformedBody(String),

    #[error(transparent)]
    Confirmation(#[from] ConfirmError),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// The `error` object of a Graph error body
#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

impl ApiError {
    /// Classify a transport failure.
    ///
    /// The request URL is left out of the message: a GET carries its params,
    /// tokens included, in the query string.
    pub fn from_transport(err: reqwest::Error) -> Self {
        let malformed = err.is_decode() || err.is_body();
        let message = describe_transport(&err.without_url());

        if malformed {
            ApiError::MalformedBody(message)
        } else {
            ApiError::Network(message)
        }
    }

    /// Classify an error response from the Graph API
    pub fn from_response(status: StatusCode, body: Option<Value>, raw: &str) -> Self {
        let graph_error = body
            .as_ref()
            .and_then(|b| serde_json::from_value::<GraphErrorBody>(b.clone()).ok())
            .map(|b| b.error);

        let code = graph_error.as_ref().and_then(|e| e.code);
        let message = match graph_error {
            Some(e) if !e.message.is_empty() => e.message,
            _ if !raw.is_empty() => truncate(raw, 500),
            _ => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };

        let code_is_auth = code.is_some_and(|c| AUTH_ERROR_CODES.contains(&c));
        if status == StatusCode::UNAUTHORIZED || code_is_auth {
            return ApiError::TokenExpiredOrInvalid { message, code };
        }

        ApiError::Remote {
            status: status.as_u16(),
            message,
            body,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Auth(AuthError::Timeout(_)) => ErrorKind::AuthTimeout,
            ApiError::Auth(AuthError::Denied(_)) => ErrorKind::AuthDenied,
            ApiError::Auth(AuthError::Network(_)) => ErrorKind::NetworkError,
            ApiError::Auth(AuthError::BrokerError { .. }) => ErrorKind::RemoteApiError,
            ApiError::Auth(_) => ErrorKind::AuthRequired,
            ApiError::TokenExpiredOrInvalid { .. } => ErrorKind::TokenExpiredOrInvalid,
            ApiError::Network(_) => ErrorKind::NetworkError,
            ApiError::Remote { .. } | ApiError::MalformedBody(_) | ApiError::InvalidRequest(_) => {
                ErrorKind::RemoteApiError
            }
            ApiError::Confirmation(ConfirmError::Pending(_)) => ErrorKind::ConfirmationPending,
            ApiError::Confirmation(
                ConfirmError::Stale(_) | ConfirmError::Expired(_) | ConfirmError::ChangesMismatch,
            ) => ErrorKind::ConfirmationStale,
            ApiError::Confirmation(_) | ApiError::Callback(_) => ErrorKind::RemoteApiError,
        }
    }

    pub fn action(&self) -> RecoveryAction {
        match self.kind() {
            ErrorKind::AuthRequired
            | ErrorKind::AuthTimeout
            | ErrorKind::AuthDenied
            | ErrorKind::TokenExpiredOrInvalid => RecoveryAction::ReAuthenticate,
            ErrorKind::NetworkError => RecoveryAction::Retry,
            ErrorKind::RemoteApiError if self.is_transient() => RecoveryAction::Retry,
            ErrorKind::RemoteApiError
            | ErrorKind::ConfirmationStale
            | ErrorKind::ConfirmationPending => RecoveryAction::AskHuman,
        }
    }

    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Remote { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }

    /// The remote API rejected the token
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::TokenExpiredOrInvalid { .. })
    }

    /// Normalized, token-free description of this failure
    pub fn report(&self, params: &Params) -> ErrorReport {
        let details = match self {
            ApiError::Remote {
                status,
                body: Some(body),
                ..
            } => json!({ "status": status, "body": body }),
            ApiError::Remote { status, message, .. } => {
                json!({ "status": status, "message": message })
            }
            ApiError::TokenExpiredOrInvalid { message, code } => {
                json!({ "message": message, "code": code })
            }
            other => json!({ "message": other.to_string() }),
        };

        ErrorReport {
            error: self.to_string(),
            kind: self.kind(),
            action: self.action(),
            details,
            params_sent: redact(params),
        }
    }
}

/// Uniform failure shape handed to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub details: Value,
    pub params_sent: Params,
}

/// `err` followed by its causes, e.g. `error sending request: tcp connect error: Connection refused`
fn describe_transport(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
