use super::pages;
use super::server::{DeliveryError, RedirectOutcome, RouteState};
use crate::confirm::{ApprovalOutcome, ChangeSet, ConfirmError, ConfirmationStatus};
use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Query parameters of the OAuth redirect.
///
/// Authorization-code redirects carry `code`; implicit-flow redirects carry
/// `access_token` once the relay page has moved the fragment into the query.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
    error_reason: Option<String>,
}

/// Parameters of a confirmation link, as query string or form body
#[derive(Debug, Deserialize)]
pub struct ConfirmParams {
    id: String,
    token: String,
    changes: String,
}

pub(crate) fn router(state: Arc<RouteState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/callback", get(oauth_callback))
        .route(
            "/confirm-update",
            get(confirm_page).post(confirm_submit),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn oauth_callback(
    State(state): State<Arc<RouteState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let outcome = match (&params.code, &params.access_token, &params.error) {
        (_, _, Some(error)) => RedirectOutcome::Denied {
            error: error.clone(),
            description: params
                .error_description
                .clone()
                .or_else(|| params.error_reason.clone())
                .unwrap_or_default(),
        },
        (Some(code), _, None) => RedirectOutcome::Code(code.clone()),
        (None, Some(token), None) => RedirectOutcome::Implicit {
            access_token: token.clone(),
            expires_in: params.expires_in,
        },
        (None, None, None) => return Html(pages::implicit_relay()).into_response(),
    };

    let Some(csrf_state) = params.state.as_deref() else {
        warn!("OAuth callback without state parameter");
        return failure(StatusCode::BAD_REQUEST, "The authorization response is missing its state parameter.");
    };

    let denied = matches!(outcome, RedirectOutcome::Denied { .. });
    match state.deliver(csrf_state, outcome) {
        Ok(()) if denied => {
            info!("OAuth authorization denied by user");
            failure(StatusCode::OK, "Authorization was denied.")
        }
        Ok(()) => {
            info!("OAuth redirect delivered to waiting login");
            Html(pages::auth_success()).into_response()
        }
        Err(DeliveryError::StateMismatch) => {
            warn!("OAuth callback state mismatch");
            failure(
                StatusCode::BAD_REQUEST,
                "The authorization response did not match the login in progress.",
            )
        }
        Err(DeliveryError::NoFlow) => {
            warn!("OAuth callback with no login in progress");
            failure(
                StatusCode::CONFLICT,
                "No login is in progress, or it has timed out.",
            )
        }
    }
}

async fn confirm_page(
    State(state): State<Arc<RouteState>>,
    Query(params): Query<ConfirmParams>,
) -> Response {
    let changes = match parse_changes(&params.changes) {
        Ok(changes) => changes,
        Err(response) => return response,
    };

    match state.coordinator.inspect(&params.id, &changes).await {
        Ok((change, ConfirmationStatus::Pending { expires_at })) => {
            Html(pages::confirm_form(&change, &params.token, expires_at)).into_response()
        }
        Ok((_, ConfirmationStatus::Approved { .. })) => {
            Html(pages::confirm_already_approved()).into_response()
        }
        Ok((_, ConfirmationStatus::Stale | ConfirmationStatus::Expired))
        | Err(ConfirmError::Stale(_)) => stale(),
        Err(ConfirmError::ChangesMismatch) => rejected(
            StatusCode::BAD_REQUEST,
            "The changes in this link differ from the change that was proposed.",
        ),
        Err(e) => rejected(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn confirm_submit(
    State(state): State<Arc<RouteState>>,
    Form(params): Form<ConfirmParams>,
) -> Response {
    let changes = match parse_changes(&params.changes) {
        Ok(changes) => changes,
        Err(response) => return response,
    };

    let outcome = state
        .coordinator
        .approve(&params.id, &params.token, &changes)
        .await;

    match outcome {
        ApprovalOutcome::Approved(_) => match state.coordinator.current().await {
            Some(change) if change.id == params.id => {
                Html(pages::confirm_approved(&change)).into_response()
            }
            _ => Html(pages::confirm_already_approved()).into_response(),
        },
        ApprovalOutcome::AlreadyApproved(_) => {
            Html(pages::confirm_already_approved()).into_response()
        }
        ApprovalOutcome::Stale | ApprovalOutcome::Expired => stale(),
        ApprovalOutcome::InvalidCapability => rejected(
            StatusCode::FORBIDDEN,
            "This confirmation link is not valid for that change.",
        ),
        ApprovalOutcome::ChangesMismatch => rejected(
            StatusCode::BAD_REQUEST,
            "The changes in this link differ from the change that was proposed.",
        ),
    }
}

fn parse_changes(raw: &str) -> Result<ChangeSet, Response> {
    serde_json::from_str::<ChangeSet>(raw).map_err(|e| {
        warn!(error = %e, "Confirmation link carries malformed changes");
        rejected(
            StatusCode::BAD_REQUEST,
            "The changes in this link could not be read.",
        )
    })
}

fn failure(status: StatusCode, message: &str) -> Response {
    (status, Html(pages::auth_failure(message))).into_response()
}

fn rejected(status: StatusCode, message: &str) -> Response {
    (status, Html(pages::confirm_rejected(message))).into_response()
}

fn stale() -> Response {
    (StatusCode::CONFLICT, Html(pages::confirm_stale())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackServer;
    use crate::confirm::{ConfirmationCoordinator, PendingChange};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;
    use url::Url;

    fn fixture() -> (CallbackServer, ConfirmationCoordinator, Router) {
        let coordinator = ConfirmationCoordinator::default();
        let server = CallbackServer::new("127.0.0.1", 0, Duration::from_secs(30), coordinator.clone());
        let app = server.router();
        (server, coordinator, app)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_form(pairs: &[(&str, &str)]) -> Request<Body> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        Request::builder()
            .method("POST")
            .uri("/confirm-update")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    async fn arm(coordinator: &ConfirmationCoordinator, id: &str, fields: serde_json::Value) -> Url {
        let change = PendingChange::new(
            id.to_string(),
            "120210".to_string(),
            fields.as_object().unwrap().clone(),
        );
        coordinator
            .arm(change, &Url::parse("http://localhost:8888/").unwrap(), None)
            .await
            .unwrap()
            .url
    }

    fn path_and_query(url: &Url) -> String {
        format!("{}?{}", url.path(), url.query().unwrap())
    }

    fn query_value(url: &Url, key: &str) -> String {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, _, app) = fixture();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");
    }

    #[tokio::test]
    async fn test_callback_delivers_code() {
        let (server, _, app) = fixture();
        let rx = server.expect_redirect("nonce".to_string()).unwrap();

        let response = app
            .oneshot(get("/callback?code=abc&state=nonce"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("Authorization Successful"));
        assert_eq!(rx.await.unwrap(), RedirectOutcome::Code("abc".to_string()));
    }

    #[tokio::test]
    async fn test_callback_state_mismatch_keeps_flow() {
        let (server, _, app) = fixture();
        let _rx = server.expect_redirect("nonce".to_string()).unwrap();

        let response = app
            .oneshot(get("/callback?code=abc&state=forged"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(server.redirect_pending());
    }

    #[tokio::test]
    async fn test_callback_denied() {
        let (server, _, app) = fixture();
        let rx = server.expect_redirect("nonce".to_string()).unwrap();

        let response = app
            .oneshot(get(
                "/callback?error=access_denied&error_description=Permissions+error&state=nonce",
            ))
            .await
            .unwrap();

        assert!(body_text(response).await.contains("Authorization Failed"));
        assert_eq!(
            rx.await.unwrap(),
            RedirectOutcome::Denied {
                error: "access_denied".to_string(),
                description: "Permissions error".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_callback_without_params_serves_relay() {
        let (_, _, app) = fixture();
        let response = app.oneshot(get("/callback")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("window.location.hash"));
    }

    #[tokio::test]
    async fn test_callback_implicit_token() {
        let (server, _, app) = fixture();
        let rx = server.expect_redirect("nonce".to_string()).unwrap();

        app.oneshot(get("/callback?access_token=EAAB&expires_in=5183999&state=nonce"))
            .await
            .unwrap();

        assert_eq!(
            rx.await.unwrap(),
            RedirectOutcome::Implicit {
                access_token: "EAAB".to_string(),
                expires_in: Some(5183999),
            }
        );
    }

    #[tokio::test]
    async fn test_confirm_page_decodes_change_set() {
        let (_, coordinator, app) = fixture();
        let fields = json!({"status": "PAUSED", "targeting": {"geo_locations": {"countries": ["US"]}}});
        let url = arm(&coordinator, "change-1", fields).await;

        let response = app.oneshot(get(&path_and_query(&url))).await.unwrap();
        let html = body_text(response).await;

        assert!(html.contains("Approve changes"));
        assert!(html.contains("PAUSED"));
        assert!(html.contains("geo_locations"));
    }

    #[tokio::test]
    async fn test_confirm_submit_approves_once() {
        let (_, coordinator, app) = fixture();
        let fields = json!({"daily_budget": 5000});
        let url = arm(&coordinator, "change-1", fields.clone()).await;
        let token = query_value(&url, "token");
        let changes = fields.to_string();
        let form = [("id", "change-1"), ("token", token.as_str()), ("changes", changes.as_str())];

        let first = app.clone().oneshot(post_form(&form)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(body_text(first).await.contains("Update approved"));
        assert!(coordinator.is_approved("change-1").await);

        let second = app.oneshot(post_form(&form)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert!(body_text(second).await.contains("Already approved"));
    }

    #[tokio::test]
    async fn test_stale_url_renders_conflict() {
        let (_, coordinator, app) = fixture();
        let first = arm(&coordinator, "first", json!({"status": "PAUSED"})).await;
        arm(&coordinator, "second", json!({"status": "ACTIVE"})).await;

        let page = app.clone().oneshot(get(&path_and_query(&first))).await.unwrap();
        assert_eq!(page.status(), StatusCode::CONFLICT);

        let token = query_value(&first, "token");
        let submit = app
            .oneshot(post_form(&[
                ("id", "first"),
                ("token", token.as_str()),
                ("changes", r#"{"status":"PAUSED"}"#),
            ]))
            .await
            .unwrap();
        assert_eq!(submit.status(), StatusCode::CONFLICT);
        assert!(!coordinator.is_approved("second").await);
    }

    #[tokio::test]
    async fn test_forged_capability_forbidden() {
        let (_, coordinator, app) = fixture();
        arm(&coordinator, "change-1", json!({"status": "PAUSED"})).await;

        let response = app
            .oneshot(post_form(&[
                ("id", "change-1"),
                ("token", "forged"),
                ("changes", r#"{"status":"PAUSED"}"#),
            ]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!coordinator.is_approved("change-1").await);
    }

    #[tokio::test]
    async fn test_malformed_changes_rejected() {
        let (_, coordinator, app) = fixture();
        arm(&coordinator, "change-1", json!({"status": "PAUSED"})).await;

        let response = app
            .oneshot(get("/confirm-update?id=change-1&token=x&changes=%7Bnot-json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
