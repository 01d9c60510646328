use meta_ads_mcp::auth::{
    AuthError, DirectOAuth, DirectOAuthConfig, FlowOutcome, FlowPhase, TokenSource, TokenStore,
};
use meta_ads_mcp::callback::{CallbackServer, ServerStatus, DEFAULT_IDLE_TIMEOUT};
use meta_ads_mcp::confirm::{ConfirmationCoordinator, PendingChange};
use reqwest::StatusCode;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{any, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    _dir: TempDir,
    store: Arc<TokenStore>,
    callback: CallbackServer,
    oauth_server: MockServer,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            store: Arc::new(TokenStore::new(dir.path().join("token_cache.json"), None)),
            _dir: dir,
            callback: CallbackServer::new(
                "127.0.0.1",
                0,
                DEFAULT_IDLE_TIMEOUT,
                ConfirmationCoordinator::default(),
            ),
            oauth_server: MockServer::start().await,
        }
    }

    fn oauth(&self, secret: Option<&str>, timeout: Duration) -> Arc<DirectOAuth> {
        let mut config = DirectOAuthConfig::new("1234", secret.map(String::from)).unwrap();
        config.token_url =
            Url::parse(&format!("{}/v22.0/oauth/access_token", self.oauth_server.uri())).unwrap();
        config.login_timeout = timeout;
        config.open_browser = false;

        Arc::new(DirectOAuth::new(
            config,
            reqwest::Client::new(),
            self.callback.clone(),
            self.store.clone(),
        ))
    }
}

/// Wait for the login link and return (state, redirect_uri)
async fn await_login_link(oauth: &DirectOAuth) -> (String, Url) {
    let mut phase = oauth.subscribe();
    let login_url = {
        let current = tokio::time::timeout(
            Duration::from_secs(5),
            phase.wait_for(|p| matches!(p, FlowPhase::AwaitingRedirect { .. })),
        )
        .await
        .expect("login link was never published")
        .unwrap();

        match &*current {
            FlowPhase::AwaitingRedirect { login_url } => login_url.clone(),
            FlowPhase::Idle => unreachable!(),
        }
    };

    let pairs: HashMap<_, _> = login_url.query_pairs().into_owned().collect();
    (
        pairs["state"].clone(),
        Url::parse(&pairs["redirect_uri"]).unwrap(),
    )
}

#[tokio::test]
async fn test_code_flow_with_long_lived_upgrade() {
    let fx = Fixture::new().await;

    Mock::given(method("POST"))
        .and(path("/v22.0/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "short-lived",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&fx.oauth_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v22.0/oauth/access_token"))
        .and(query_param("grant_type", "fb_exchange_token"))
        .and(query_param("fb_exchange_token", "short-lived"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "long-lived",
            "token_type": "bearer",
            "expires_in": 5183944
        })))
        .expect(1)
        .mount(&fx.oauth_server)
        .await;

    let oauth = fx.oauth(Some("app-secret"), Duration::from_secs(10));
    let login = {
        let oauth = oauth.clone();
        tokio::spawn(async move { oauth.get_access_token().await })
    };

    let (state, redirect_uri) = await_login_link(&oauth).await;
    assert_eq!(redirect_uri.path(), "/callback");

    let mut callback = redirect_uri.clone();
    callback
        .query_pairs_mut()
        .append_pair("code", "auth-code")
        .append_pair("state", &state);
    let page = reqwest::get(callback).await.unwrap();
    assert_eq!(page.status(), StatusCode::OK);

    let token = login.await.unwrap().unwrap();
    assert_eq!(token.value, "long-lived");
    assert_eq!(token.source, TokenSource::Direct);
    assert_eq!(fx.store.load().unwrap().value, "long-lived");
    assert_eq!(oauth.last_outcome(), Some(FlowOutcome::TokenReceived));
    assert_eq!(oauth.phase(), FlowPhase::Idle);

    // Cached now; no second login
    assert_eq!(oauth.get_access_token().await.unwrap().value, "long-lived");
    assert_eq!(oauth.login_count(), 1);

    fx.callback.stop().await;
}

#[tokio::test]
async fn test_implicit_flow_without_secret() {
    let fx = Fixture::new().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&fx.oauth_server)
        .await;

    let oauth = fx.oauth(None, Duration::from_secs(10));
    let login = {
        let oauth = oauth.clone();
        tokio::spawn(async move { oauth.get_access_token().await })
    };

    let (state, redirect_uri) = await_login_link(&oauth).await;

    // The fragment relay page is what the browser lands on first
    let relay = reqwest::get(redirect_uri.clone()).await.unwrap();
    assert!(relay.text().await.unwrap().contains("window.location.hash"));

    let mut relayed = redirect_uri.clone();
    relayed
        .query_pairs_mut()
        .append_pair("access_token", "implicit-token")
        .append_pair("expires_in", "5183999")
        .append_pair("state", &state);
    reqwest::get(relayed).await.unwrap();

    let token = login.await.unwrap().unwrap();
    assert_eq!(token.value, "implicit-token");
    assert!(token.expires_in().unwrap() > 5_000_000);

    fx.callback.stop().await;
}

/// A timed-out login fails with Timeout and frees the port right away
#[tokio::test]
async fn test_timeout_releases_callback_server() {
    let fx = Fixture::new().await;
    let oauth = fx.oauth(None, Duration::from_millis(300));

    let err = oauth.get_access_token().await.unwrap_err();

    assert_eq!(err, AuthError::Timeout(0));
    assert_eq!(oauth.last_outcome(), Some(FlowOutcome::TimedOut));
    assert_eq!(fx.callback.status(), ServerStatus::Stopped);
    assert!(!fx.callback.redirect_pending());
}

/// An armed confirmation keeps the listener alive through a login timeout
#[tokio::test]
async fn test_timeout_keeps_server_for_other_consumers() {
    let fx = Fixture::new().await;

    let lease = fx.callback.acquire().unwrap();
    let base = lease.base_url().clone();
    let change = PendingChange::new(
        "change-1".to_string(),
        "120210".to_string(),
        json!({"status": "PAUSED"}).as_object().unwrap().clone(),
    );
    fx.callback
        .coordinator()
        .arm(change, &base, Some(lease))
        .await
        .unwrap();

    let oauth = fx.oauth(None, Duration::from_millis(300));
    assert!(oauth.get_access_token().await.is_err());

    assert!(matches!(fx.callback.status(), ServerStatus::Listening(_)));
    assert!(!fx.callback.redirect_pending());

    fx.callback.stop().await;
}

#[tokio::test]
async fn test_user_denied() {
    let fx = Fixture::new().await;
    let oauth = fx.oauth(Some("app-secret"), Duration::from_secs(10));
    let login = {
        let oauth = oauth.clone();
        tokio::spawn(async move { oauth.get_access_token().await })
    };

    let (state, redirect_uri) = await_login_link(&oauth).await;
    let mut denied = redirect_uri.clone();
    denied
        .query_pairs_mut()
        .append_pair("error", "access_denied")
        .append_pair("error_reason", "user_denied")
        .append_pair("state", &state);
    reqwest::get(denied).await.unwrap();

    let err = login.await.unwrap().unwrap_err();
    assert!(matches!(err, AuthError::Denied(_)));
    assert_eq!(oauth.last_outcome(), Some(FlowOutcome::UserDenied));
    assert!(fx.store.load().is_none());

    fx.callback.stop().await;
}

#[tokio::test]
async fn test_forged_state_does_not_complete_login() {
    let fx = Fixture::new().await;
    let oauth = fx.oauth(None, Duration::from_secs(10));
    let login = {
        let oauth = oauth.clone();
        tokio::spawn(async move { oauth.get_access_token().await })
    };

    let (state, redirect_uri) = await_login_link(&oauth).await;

    let mut forged = redirect_uri.clone();
    forged
        .query_pairs_mut()
        .append_pair("access_token", "attacker-token")
        .append_pair("state", "forged");
    let response = reqwest::get(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(fx.callback.redirect_pending());

    let mut genuine = redirect_uri.clone();
    genuine
        .query_pairs_mut()
        .append_pair("access_token", "real-token")
        .append_pair("state", &state);
    reqwest::get(genuine).await.unwrap();

    assert_eq!(login.await.unwrap().unwrap().value, "real-token");

    fx.callback.stop().await;
}

/// Concurrent callers during a login share it instead of starting another
#[tokio::test]
async fn test_concurrent_callers_share_login() {
    let fx = Fixture::new().await;
    let oauth = fx.oauth(None, Duration::from_secs(10));

    let logins: Vec<_> = (0..4)
        .map(|_| {
            let oauth = oauth.clone();
            tokio::spawn(async move { oauth.get_access_token().await })
        })
        .collect();

    let (state, redirect_uri) = await_login_link(&oauth).await;
    let mut callback = redirect_uri.clone();
    callback
        .query_pairs_mut()
        .append_pair("access_token", "shared-token")
        .append_pair("state", &state);
    reqwest::get(callback).await.unwrap();

    for login in logins {
        assert_eq!(login.await.unwrap().unwrap().value, "shared-token");
    }
    assert_eq!(oauth.login_count(), 1);

    fx.callback.stop().await;
}
