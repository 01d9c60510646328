use super::single_flight::RefreshGate;
use super::token_store::TokenStore;
use super::types::{AuthError, Token, TokenSource};
use crate::callback::{CallbackServer, RedirectOutcome};
use oauth2::{
    basic::BasicClient, reqwest::async_http_client, AuthType, AuthUrl, AuthorizationCode,
    ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use url::Url;

// Meta OAuth endpoints
pub const META_AUTH_URL: &str = "https://www.facebook.com/v22.0/dialog/oauth";
pub const META_TOKEN_URL: &str = "https://graph.facebook.com/v22.0/oauth/access_token";

pub const DEFAULT_SCOPES: &[&str] = &[
    "business_management",
    "public_profile",
    "ads_management",
    "ads_read",
];

/// How long a login waits for the browser redirect
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

/// Settings for the browser-redirect login
#[derive(Debug, Clone)]
pub struct DirectOAuthConfig {
    pub app_id: String,
    /// Enables the authorization-code flow and the long-lived token upgrade
    pub app_secret: Option<String>,
    pub auth_url: Url,
    pub token_url: Url,
    pub scopes: Vec<String>,
    pub login_timeout: Duration,
    pub open_browser: bool,
}

impl DirectOAuthConfig {
    pub fn new(app_id: impl Into<String>, app_secret: Option<String>) -> Result<Self, AuthError> {
        let parse = |raw: &str| {
            Url::parse(raw).map_err(|e| AuthError::OAuth2Error(format!("Invalid URL {}: {}", raw, e)))
        };

        Ok(Self {
            app_id: app_id.into(),
            app_secret,
            auth_url: parse(META_AUTH_URL)?,
            token_url: parse(META_TOKEN_URL)?,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            open_browser: true,
        })
    }

    fn uses_code_flow(&self) -> bool {
        self.app_secret.is_some()
    }
}

/// Where the login currently stands
#[derive(Debug, Clone, PartialEq)]
pub enum FlowPhase {
    Idle,
    AwaitingRedirect { login_url: Url },
}

/// How the most recent login ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    TokenReceived,
    TimedOut,
    UserDenied,
    Failed,
}

/// Response from the long-lived token exchange
#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Browser-redirect OAuth against the platform
pub struct DirectOAuth {
    config: DirectOAuthConfig,
    http_client: reqwest::Client,
    callback: CallbackServer,
    token_store: Arc<TokenStore>,
    cached: RwLock<Option<Token>>,
    gate: RefreshGate,
    phase: watch::Sender<FlowPhase>,
    last_outcome: Mutex<Option<FlowOutcome>>,
}

impl DirectOAuth {
    pub fn new(
        config: DirectOAuthConfig,
        http_client: reqwest::Client,
        callback: CallbackServer,
        token_store: Arc<TokenStore>,
    ) -> Self {
        let (phase, _) = watch::channel(FlowPhase::Idle);

        Self {
            config,
            http_client,
            callback,
            token_store,
            cached: RwLock::new(None),
            gate: RefreshGate::new(),
            phase,
            last_outcome: Mutex::new(None),
        }
    }

    /// Return the cached token, or run a browser login for a new one.
    ///
    /// Concurrent callers share a single login.
    pub async fn get_access_token(&self) -> Result<Token, AuthError> {
        if let Some(token) = self.cached.read().await.as_ref() {
            if !token.is_expired() {
                return Ok(token.clone());
            }
        }

        self.gate.run(|| self.login()).await
    }

    pub async fn clear_cached_token(&self) {
        *self.cached.write().await = None;
        if let Err(e) = self.token_store.invalidate() {
            warn!(error = %e, "Failed to invalidate cached OAuth token");
        }
        debug!("OAuth token cache cleared");
    }

    pub fn phase(&self) -> FlowPhase {
        self.phase.borrow().clone()
    }

    /// Watch login phase changes; the login URL is published here
    pub fn subscribe(&self) -> watch::Receiver<FlowPhase> {
        self.phase.subscribe()
    }

    pub fn last_outcome(&self) -> Option<FlowOutcome> {
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of logins that have run to completion (successful or not)
    pub fn login_count(&self) -> u64 {
        self.gate.completed()
    }

    pub fn config(&self) -> &DirectOAuthConfig {
        &self.config
    }

    fn oauth_client(&self, redirect_url: &Url) -> Result<BasicClient, AuthError> {
        let auth_url = AuthUrl::new(self.config.auth_url.to_string())
            .map_err(|e| AuthError::OAuth2Error(format!("Invalid auth URL: {}", e)))?;

        let token_url = TokenUrl::new(self.config.token_url.to_string())
            .map_err(|e| AuthError::OAuth2Error(format!("Invalid token URL: {}", e)))?;

        let redirect_url = RedirectUrl::new(redirect_url.to_string())
            .map_err(|e| AuthError::OAuth2Error(format!("Invalid redirect URI: {}", e)))?;

        let client = BasicClient::new(
            ClientId::new(self.config.app_id.clone()),
            self.config.app_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(redirect_url);

        Ok(client)
    }

    async fn login(&self) -> Result<Token, AuthError> {
        let lease = self.callback.acquire()?;
        let redirect_url = lease.callback_url()?;
        let client = self.oauth_client(&redirect_url)?;

        let mut request = client.authorize_url(CsrfToken::new_random);
        for scope in &self.config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        if !self.config.uses_code_flow() {
            request = request.use_implicit_flow();
        }
        let (login_url, csrf_token) = request.url();

        let redirect = self.callback.expect_redirect(csrf_token.secret().clone())?;
        self.phase.send_replace(FlowPhase::AwaitingRedirect {
            login_url: login_url.clone(),
        });

        info!(
            redirect_uri = %redirect_url,
            code_flow = self.config.uses_code_flow(),
            "Waiting for OAuth redirect"
        );

        if self.config.open_browser {
            if let Err(e) = open::that(login_url.as_str()) {
                warn!(error = %e, "Could not open browser; use the login link instead");
            }
        }

        let received = tokio::time::timeout(self.config.login_timeout, redirect).await;

        let result = match received {
            Err(_) => {
                warn!(
                    timeout_secs = self.config.login_timeout.as_secs(),
                    "OAuth login timed out"
                );
                self.callback.cancel_redirect(csrf_token.secret());
                lease.close();
                self.finish(FlowOutcome::TimedOut);
                return Err(AuthError::Timeout(self.config.login_timeout.as_secs()));
            }
            Ok(Err(_)) => Err(AuthError::CallbackServer(
                "Callback server stopped before the redirect arrived".to_string(),
            )),
            Ok(Ok(RedirectOutcome::Denied { error, description })) => {
                self.finish(FlowOutcome::UserDenied);
                return Err(AuthError::Denied(if description.is_empty() {
                    error
                } else {
                    format!("{}: {}", error, description)
                }));
            }
            Ok(Ok(RedirectOutcome::Code(code))) => self.exchange_code(&client, code).await,
            Ok(Ok(RedirectOutcome::Implicit {
                access_token,
                expires_in,
            })) => Ok(Token::new(access_token, expires_in, TokenSource::Direct)),
        };
        drop(lease);

        let token = match result {
            Ok(token) => self.upgrade(token).await,
            Err(e) => {
                self.finish(FlowOutcome::Failed);
                return Err(e);
            }
        };

        if let Err(e) = self.token_store.save(&token) {
            warn!(error = %e, "Failed to persist OAuth token");
        }
        *self.cached.write().await = Some(token.clone());

        self.finish(FlowOutcome::TokenReceived);
        info!(expires_at = ?token.expires_at, "OAuth login completed");
        Ok(token)
    }

    async fn exchange_code(&self, client: &BasicClient, code: String) -> Result<Token, AuthError> {
        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(async_http_client)
            .await?;

        Ok(Token::new(
            response.access_token().secret().to_string(),
            response.expires_in().map(|d| d.as_secs()),
            TokenSource::Direct,
        ))
    }

    /// Trade a short-lived token for a long-lived one. Keeps the original
    /// token on any failure.
    async fn upgrade(&self, token: Token) -> Token {
        let Some(secret) = self.config.app_secret.as_deref() else {
            return token;
        };

        let response = self
            .http_client
            .get(self.config.token_url.clone())
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.config.app_id.as_str()),
                ("client_secret", secret),
                ("fb_exchange_token", token.value.as_str()),
            ])
            .send()
            .await;

        let parsed = match response {
            Ok(response) if response.status().is_success() => {
                response
                    .json::<ExchangeResponse>()
                    .await
                    .map_err(|e| e.without_url().to_string())
            }
            Ok(response) => Err(format!("status {}", response.status())),
            Err(e) => Err(e.without_url().to_string()),
        };

        match parsed {
            Ok(long_lived) => {
                info!("Upgraded to long-lived token");
                Token::new(long_lived.access_token, long_lived.expires_in, TokenSource::Direct)
            }
            Err(reason) => {
                warn!(reason = %reason, "Long-lived token exchange failed; keeping short-lived token");
                token
            }
        }
    }

    fn finish(&self, outcome: FlowOutcome) {
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.phase.send_replace(FlowPhase::Idle);
    }
}
