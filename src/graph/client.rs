use super::error::ApiError;
use super::params::{canonicalize, Params};
use crate::auth::{
    AuthError, AuthProvider, BrokerAuth, DirectOAuth, DirectOAuthConfig, FlowPhase, Token,
    TokenStore,
};
use crate::callback::{CallbackServer, DEFAULT_IDLE_TIMEOUT};
use crate::config::{Config, ConfigError};
use crate::confirm::{
    ArmedConfirmation, ChangeSet, ConfirmationCoordinator, ConfirmationStatus, PendingChange,
};
use crate::mcp::ToolResult;
use backon::{BackoffBuilder, ExponentialBuilder};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const USER_AGENT: &str = concat!("meta-ads-mcp/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout for outward HTTP calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff for transient failures (connect, timeout, 502/503/504)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_retries)
            .build()
    }
}

/// Where a request's token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOrigin {
    /// Passed by the caller
    Explicit,
    /// `META_ACCESS_TOKEN`
    Environment,
    Store,
    Provider,
}

#[derive(Clone)]
pub struct ResolvedToken {
    pub value: String,
    pub origin: TokenOrigin,
}

impl ResolvedToken {
    /// Only tokens we obtained ourselves are refreshed on rejection
    fn refreshable(&self) -> bool {
        matches!(self.origin, TokenOrigin::Store | TokenOrigin::Provider)
    }
}

impl fmt::Debug for ResolvedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedToken")
            .field("value", &"[REDACTED]")
            .field("origin", &self.origin)
            .finish()
    }
}

/// Result of asking for a login link
#[derive(Debug, Clone, PartialEq)]
pub enum LoginLink {
    AlreadyAuthenticated,
    /// Tokens come from the broker; no browser login is involved
    Broker,
    Url(Url),
}

/// Graph API gateway.
///
/// Resolves a token, performs the call, and normalizes every failure into
/// an [`ApiError`]. Transient failures are retried with backoff; a rejected
/// token is refreshed once and the call retried once.
pub struct GraphClient {
    http_client: reqwest::Client,
    base_url: Url,
    env_token: Option<String>,
    token_store: Arc<TokenStore>,
    provider: Option<Arc<AuthProvider>>,
    callback: CallbackServer,
    retry: RetryPolicy,
}

impl GraphClient {
    /// `base_url` is the versioned Graph root, e.g. `https://graph.facebook.com/v22.0/`
    pub fn new(base_url: Url, token_store: Arc<TokenStore>, callback: CallbackServer) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url,
            env_token: None,
            token_store,
            provider: None,
            callback,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<AuthProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_env_token(mut self, token: Option<String>) -> Self {
        self.env_token = token;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_http_client(mut self, http_client: reqwest::Client) -> Self {
        self.http_client = http_client;
        self
    }

    /// Wire the gateway, the selected provider and the callback server
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let graph_url = config.graph_api_url()?;
        let token_store = Arc::new(TokenStore::new(config.token_path.clone(), config.token_key));
        let callback = CallbackServer::new(
            config.callback_host.clone(),
            config.callback_port,
            DEFAULT_IDLE_TIMEOUT,
            ConfirmationCoordinator::default(),
        );

        let provider = if let Some(credential) = &config.broker_token {
            info!(broker = %config.broker_base, "Using delegated broker authentication");
            let broker = BrokerAuth::new(
                http_client.clone(),
                &config.broker_base,
                credential.clone(),
                token_store.clone(),
            )
            .map_err(|e| ConfigError::InvalidValue {
                name: "PIPEBOARD_API_BASE",
                reason: e.to_string(),
            })?;
            Some(AuthProvider::Broker(broker))
        } else if let Some(app_id) = &config.app_id {
            info!(
                code_flow = config.app_secret.is_some(),
                "Using direct OAuth authentication"
            );
            let oauth_config = direct_oauth_config(config, app_id, &graph_url)?;
            Some(AuthProvider::Direct(DirectOAuth::new(
                oauth_config,
                http_client.clone(),
                callback.clone(),
                token_store.clone(),
            )))
        } else {
            warn!("No authentication configured; only cached or explicit tokens will work");
            None
        };

        let mut client = GraphClient::new(graph_url, token_store, callback)
            .with_http_client(http_client)
            .with_env_token(config.access_token.clone());
        if let Some(provider) = provider {
            client = client.with_provider(Arc::new(provider));
        }
        Ok(client)
    }

    pub fn provider(&self) -> Option<&Arc<AuthProvider>> {
        self.provider.as_ref()
    }

    pub fn callback(&self) -> &CallbackServer {
        &self.callback
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.token_store
    }

    pub fn has_env_token(&self) -> bool {
        self.env_token.is_some()
    }

    /// Resolve the token for a call: explicit, then environment, then the
    /// token store, then the auth provider.
    ///
    /// With no provider configured and nothing cached this fails without
    /// touching the network.
    pub async fn get_token(&self, explicit: Option<&str>) -> Result<ResolvedToken, ApiError> {
        if let Some(token) = explicit.filter(|t| !t.is_empty()) {
            return Ok(ResolvedToken {
                value: token.to_string(),
                origin: TokenOrigin::Explicit,
            });
        }

        if let Some(token) = &self.env_token {
            return Ok(ResolvedToken {
                value: token.clone(),
                origin: TokenOrigin::Environment,
            });
        }

        if let Some(token) = self.token_store.load() {
            debug!(source = ?token.source, "Using cached token");
            return Ok(ResolvedToken {
                value: token.value,
                origin: TokenOrigin::Store,
            });
        }

        let provider = self.provider.as_ref().ok_or(AuthError::NotConfigured)?;
        let token = provider.get_access_token().await?;
        Ok(ResolvedToken {
            value: token.value,
            origin: TokenOrigin::Provider,
        })
    }

    /// Call `endpoint` (relative to the Graph root) and return the parsed body
    pub async fn request(
        &self,
        endpoint: &str,
        explicit_token: Option<&str>,
        params: &Params,
        method: Method,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint_url(endpoint)?;
        let token = self.get_token(explicit_token).await?;

        match self.send_with_retry(&method, &url, &token.value, params).await {
            Err(err) if err.is_auth_failure() && token.refreshable() => {
                warn!(
                    endpoint = %endpoint,
                    origin = ?token.origin,
                    error = %err,
                    "Token rejected; refreshing once"
                );
                let Some(fresh) = self.force_refresh().await? else {
                    return Err(err);
                };
                self.send_with_retry(&method, &url, &fresh.value, params).await
            }
            other => other,
        }
    }

    /// [`request`](Self::request), folded into the tool-facing result shape
    pub async fn call(
        &self,
        endpoint: &str,
        explicit_token: Option<&str>,
        params: &Params,
        method: Method,
    ) -> ToolResult {
        match self.request(endpoint, explicit_token, params, method).await {
            Ok(body) => ToolResult::success(body),
            Err(err) => {
                warn!(endpoint = %endpoint, kind = ?err.kind(), error = %err, "Graph call failed");
                ToolResult::error(err.report(params))
            }
        }
    }

    /// Arm a human confirmation for `changes` to `target_id` and return the
    /// URL to approve it
    pub async fn confirm_mutation(
        &self,
        target_id: &str,
        changes: ChangeSet,
    ) -> Result<ArmedConfirmation, ApiError> {
        let target_id = target_id.trim();
        if target_id.is_empty() || target_id.contains('/') {
            return Err(ApiError::InvalidRequest(format!(
                "Invalid target object id {:?}",
                target_id
            )));
        }

        let lease = self.callback.acquire()?;
        let base_url = lease.base_url().clone();
        let change = PendingChange::new(Uuid::new_v4().to_string(), target_id.to_string(), changes);

        Ok(self
            .callback
            .coordinator()
            .arm(change, &base_url, Some(lease))
            .await?)
    }

    pub async fn confirmation_status(&self, change_id: &str) -> ConfirmationStatus {
        self.callback.coordinator().status(change_id).await
    }

    /// Apply an approved change. The approval is consumed, so a second call
    /// reports the change as stale.
    pub async fn apply_confirmed(
        &self,
        change_id: &str,
        explicit_token: Option<&str>,
    ) -> Result<Value, ApiError> {
        let change = self.take_confirmed(change_id).await?;
        self.request(&change.target_id, explicit_token, &change.changes, Method::POST)
            .await
    }

    /// [`apply_confirmed`](Self::apply_confirmed), folded into the
    /// tool-facing result shape. A failed POST reports the change-set that
    /// was sent.
    pub async fn call_confirmed(&self, change_id: &str, explicit_token: Option<&str>) -> ToolResult {
        match self.take_confirmed(change_id).await {
            Ok(change) => {
                self.call(&change.target_id, explicit_token, &change.changes, Method::POST)
                    .await
            }
            Err(err) => {
                warn!(change_id = %change_id, kind = ?err.kind(), error = %err, "Confirmed change not applied");
                ToolResult::error(err.report(&Params::new()))
            }
        }
    }

    /// Start a browser login in the background and return its URL
    pub async fn begin_login(&self) -> Result<LoginLink, ApiError> {
        if self.env_token.is_some() || self.token_store.load().is_some() {
            return Ok(LoginLink::AlreadyAuthenticated);
        }

        let provider = self.provider.clone().ok_or(AuthError::NotConfigured)?;
        let Some(direct) = provider.as_direct() else {
            return Ok(LoginLink::Broker);
        };

        let mut phase = direct.subscribe();
        if let FlowPhase::AwaitingRedirect { login_url } = &*phase.borrow() {
            return Ok(LoginLink::Url(login_url.clone()));
        }

        let mut login = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.get_access_token().await })
        };

        tokio::select! {
            awaiting = phase.wait_for(|p| matches!(p, FlowPhase::AwaitingRedirect { .. })) => {
                match awaiting.as_deref() {
                    Ok(FlowPhase::AwaitingRedirect { login_url }) => Ok(LoginLink::Url(login_url.clone())),
                    _ => Err(AuthError::OAuth2Error("Login ended before a link was issued".to_string()).into()),
                }
            }
            finished = &mut login => match finished {
                Ok(Ok(_)) => Ok(LoginLink::AlreadyAuthenticated),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(AuthError::OAuth2Error(format!("Login task failed: {}", e)).into()),
            },
        }
    }

    /// Run the provider now, ignoring any cached token
    pub async fn login(&self) -> Result<Token, ApiError> {
        let provider = self.provider.as_ref().ok_or(AuthError::NotConfigured)?;
        Ok(provider.get_access_token().await?)
    }

    /// Forget every cached token
    pub async fn logout(&self) -> Result<(), ApiError> {
        self.token_store.invalidate()?;
        if let Some(provider) = &self.provider {
            provider.clear_cached_token().await;
        }
        info!("Cached tokens cleared");
        Ok(())
    }

    async fn take_confirmed(&self, change_id: &str) -> Result<PendingChange, ApiError> {
        let change = self.callback.coordinator().take_approved(change_id).await?;
        info!(
            change_id = %change.id,
            target_id = %change.target_id,
            fields = change.changes.len(),
            "Applying confirmed change"
        );
        Ok(change)
    }

    async fn force_refresh(&self) -> Result<Option<Token>, ApiError> {
        if let Err(e) = self.token_store.invalidate() {
            warn!(error = %e, "Failed to invalidate rejected token");
        }

        let Some(provider) = &self.provider else {
            return Ok(None);
        };

        provider.clear_cached_token().await;
        Ok(Some(provider.get_access_token().await?))
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, ApiError> {
        let path = endpoint.trim().trim_start_matches('/');
        if path.is_empty() {
            return Err(ApiError::InvalidRequest("Endpoint is empty".to_string()));
        }

        let url = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid endpoint {:?}: {}", endpoint, e)))?;

        if url.origin() != self.base_url.origin() || !url.path().starts_with(self.base_url.path()) {
            return Err(ApiError::InvalidRequest(format!(
                "Endpoint {:?} escapes the Graph API root",
                endpoint
            )));
        }

        Ok(url)
    }

    async fn send_with_retry(
        &self,
        method: &Method,
        url: &Url,
        token: &str,
        params: &Params,
    ) -> Result<Value, ApiError> {
        let mut backoff = self.retry.backoff();
        let mut attempt = 1u32;

        loop {
            match self.send_once(method, url, token, params).await {
                Err(err) if err.is_transient() => match backoff.next() {
                    Some(delay) => {
                        debug!(
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying after transient failure"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(attempts = attempt, error = %err, "Giving up after transient failures");
                        return Err(err);
                    }
                },
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        token: &str,
        params: &Params,
    ) -> Result<Value, ApiError> {
        let pairs = canonicalize(params);

        let request = if *method == Method::GET {
            self.http_client.get(url.clone()).query(&pairs)
        } else {
            self.http_client.request(method.clone(), url.clone()).form(&pairs)
        };

        debug!(method = %method, path = %url.path(), params = pairs.len(), "Graph API request");

        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(ApiError::from_transport)?;
        let body = serde_json::from_str::<Value>(&text).ok();

        if !status.is_success() {
            return Err(ApiError::from_response(status, body, &text));
        }

        body.ok_or_else(|| {
            ApiError::MalformedBody(format!(
                "Expected JSON from {} (status {}), got {} bytes of something else",
                url.path(),
                status.as_u16(),
                text.len()
            ))
        })
    }
}

fn direct_oauth_config(
    config: &Config,
    app_id: &str,
    graph_url: &Url,
) -> Result<DirectOAuthConfig, ConfigError> {
    let invalid = |e: AuthError| ConfigError::InvalidValue {
        name: "META_APP_ID",
        reason: e.to_string(),
    };

    let mut oauth = DirectOAuthConfig::new(app_id, config.app_secret.clone()).map_err(invalid)?;
    let version = config.graph_api_version.trim_matches('/');

    oauth.auth_url = Url::parse(&format!("https://www.facebook.com/{}/dialog/oauth", version))
        .map_err(|source| ConfigError::InvalidUrl {
            name: "META_GRAPH_API_VERSION",
            source,
        })?;
    oauth.token_url = graph_url
        .join("oauth/access_token")
        .map_err(|source| ConfigError::InvalidUrl {
            name: "META_GRAPH_API_BASE",
            source,
        })?;
    oauth.login_timeout = config.login_timeout;
    oauth.open_browser = config.open_browser;

    Ok(oauth)
}
