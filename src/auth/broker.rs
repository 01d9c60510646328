use super::single_flight::RefreshGate;
use super::token_store::TokenStore;
use super::types::{AuthError, Token, TokenSource};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Default base URL of the delegated token broker
pub const DEFAULT_BROKER_BASE: &str = "https://pipeboard.co";

/// Path of the token exchange endpoint on the broker
const TOKEN_EXCHANGE_PATH: &str = "api/meta/token";

/// Response from the broker's token exchange endpoint
#[derive(Debug, Deserialize)]
struct BrokerTokenResponse {
    access_token: String,
    /// Seconds until expiry
    #[serde(default)]
    expires_in: Option<u64>,
    /// Absolute expiry (RFC 3339)
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Exchanges a long-lived broker credential for short-lived platform tokens
pub struct BrokerAuth {
    http_client: reqwest::Client,
    exchange_url: Url,
    credential: String,
    token_store: Arc<TokenStore>,
    cached: RwLock<Option<Token>>,
    gate: RefreshGate,
}

impl BrokerAuth {
    pub fn new(
        http_client: reqwest::Client,
        broker_base: &Url,
        credential: String,
        token_store: Arc<TokenStore>,
    ) -> Result<Self, AuthError> {
        let exchange_url = broker_base
            .join(TOKEN_EXCHANGE_PATH)
            .map_err(|e| AuthError::BrokerError {
                status: 0,
                message: format!("Invalid broker URL: {}", e),
            })?;

        Ok(Self {
            http_client,
            exchange_url,
            credential,
            token_store,
            cached: RwLock::new(None),
            gate: RefreshGate::new(),
        })
    }

    /// Return the cached token, or exchange the broker credential for a new one
    pub async fn get_access_token(&self) -> Result<Token, AuthError> {
        if let Some(token) = self.cached.read().await.as_ref() {
            if !token.is_expired() {
                return Ok(token.clone());
            }
        }

        self.gate.run(|| self.exchange()).await
    }

    /// Drop the cached token so the next call exchanges again
    pub async fn clear_cached_token(&self) {
        *self.cached.write().await = None;
        if let Err(e) = self.token_store.invalidate() {
            warn!(error = %e, "Failed to invalidate cached broker token");
        }
        debug!("Broker token cache cleared");
    }

    /// Number of exchanges performed so far
    pub fn exchange_count(&self) -> u64 {
        self.gate.completed()
    }

    async fn exchange(&self) -> Result<Token, AuthError> {
        info!(url = %self.exchange_url, "Exchanging broker credential for platform token");

        let response = self
            .http_client
            .get(self.exchange_url.clone())
            .bearer_auth(&self.credential)
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(status = status.as_u16(), "Broker rejected credential");
                return Err(AuthError::AuthRequired(
                    "Broker rejected the configured PIPEBOARD_API_TOKEN".to_string(),
                ));
            }
            StatusCode::NOT_FOUND => {
                return Err(AuthError::AuthRequired(
                    "No ad account is linked to the broker credential; connect one in the broker dashboard".to_string(),
                ));
            }
            s if !s.is_success() => {
                let message = response.text().await.unwrap_or_default();
                return Err(AuthError::BrokerError {
                    status: s.as_u16(),
                    message,
                });
            }
            _ => {}
        }

        let body: BrokerTokenResponse = response.json().await.map_err(|e| AuthError::BrokerError {
            status: status.as_u16(),
            message: format!("Malformed broker response: {}", e),
        })?;

        let token = match (body.expires_at, body.expires_in) {
            (Some(at), _) => Token::with_expiry(body.access_token, Some(at), TokenSource::Broker),
            (None, expires_in) => Token::new(body.access_token, expires_in, TokenSource::Broker),
        };

        if let Err(e) = self.token_store.save(&token) {
            warn!(error = %e, "Failed to persist broker token");
        }
        *self.cached.write().await = Some(token.clone());

        info!(expires_at = ?token.expires_at, "Broker token obtained");
        Ok(token)
    }
}
