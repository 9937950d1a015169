//! Axum HTTP gateway.
//!
//! Call endpoints are deliberately unauthenticated (the provider cannot
//! sign SDP exchanges); management webhooks are HMAC-verified and the ops
//! surface requires the `X-API-Key` JWT. Request bodies are limited and
//! every request carries a timeout so a stalled client cannot pin a
//! worker.

pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::de::DeserializeOwned;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::app::VoiceApp;
use crate::channels::{self, wati};
use crate::error::{ok_body, GatewayError};
use crate::session::ChannelType;

/// SDP offers are bigger than chat payloads; still bounded.
pub const MAX_BODY_SIZE: usize = 262_144;

/// Request timeout. Call setup waits on media and the provider.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type AppState = Arc<VoiceApp>;

/// Build the full route table.
pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/webrtc/config", get(webrtc_config))
        .route("/api/sessions", get(list_sessions))
        .route("/api/events/stats", get(event_stats))
        // Inbound calls
        .route("/wati/new-call", post(new_call))
        .route("/wati/web-new-call", post(web_new_call))
        .route("/wati/test/new-call", post(test_new_call))
        // Termination
        .route("/wati/terminate-call", post(terminate_call))
        .route("/wati/test/terminate-call", post(terminate_call))
        // Outbound
        .route("/wati/outbound/initiate", post(outbound_initiate))
        .route("/wati/outbound/initiate-prod", post(outbound_initiate_prod))
        .route("/wati/outbound/permission", post(outbound_permission))
        .route("/wati/outbound/sdp-answer", post(outbound_sdp_answer))
        .route("/wati/outbound/call-status", post(outbound_call_status))
        // Management webhooks
        .route("/wati/webhook", post(provider_webhook))
        // LiveKit
        .route("/livekit/create-room", post(livekit_create_room))
        .route("/livekit/join-room", post(livekit_join_room))
        .route("/livekit/end-call", post(livekit_end_call))
        .route("/livekit/webhook", post(livekit_webhook))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app)
}

/// Serve until shutdown is signalled, then drain active sessions.
pub async fn run(app: AppState) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], app.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "voice gateway listening");

    let shutdown_app = Arc::clone(&app);
    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signalled; draining sessions");
            shutdown_app.sessions.terminate_all("gateway shutdown").await;
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Parse a JSON body with our error shape. Invalid payloads are logged
/// truncated, never in full.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|e| {
        let preview: String = String::from_utf8_lossy(body).chars().take(256).collect();
        tracing::debug!(error = %e, body = %preview, "unparseable request body");
        GatewayError::Protocol(format!("invalid JSON payload: {e}"))
    })
}

fn require_api_key(headers: &HeaderMap, secret: &str) -> Result<(), GatewayError> {
    let token = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token.is_empty() || !auth::verify_api_key(token, secret) {
        return Err(GatewayError::Authorization("invalid API key".into()));
    }
    Ok(())
}

// ── Basic surface ──────────────────────────────────────────────────

const LOGIN_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Astra Voice</title></head>
<body>
  <h1>Astra Voice Gateway</h1>
  <p>This management surface requires an <code>X-API-Key</code> token.</p>
  <form onsubmit="localStorage.setItem('apiKey', this.key.value); location.reload(); return false;">
    <input name="key" type="password" placeholder="API key" />
    <button type="submit">Sign in</button>
  </form>
</body>
</html>"#;

async fn index(State(app): State<AppState>, headers: HeaderMap) -> Response {
    if require_api_key(&headers, &app.config.secret_key).is_err() {
        return Html(LOGIN_PAGE).into_response();
    }
    Html(format!(
        "<html><body><h1>Astra Voice Gateway</h1>\
         <p>{} active session(s), up {}s.</p></body></html>",
        app.sessions.active_count(),
        app.uptime_seconds(),
    ))
    .into_response()
}

async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "code": 200,
        "message": "ok",
        "activeSessions": app.sessions.active_count(),
        "uptimeSeconds": app.uptime_seconds(),
    }))
}

async fn webrtc_config(State(app): State<AppState>) -> Json<crate::webrtc::WebRtcClientConfig> {
    Json(app.ice.client_config().await)
}

async fn list_sessions(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    require_api_key(&headers, &app.config.secret_key)?;
    Ok(Json(serde_json::json!({
        "code": 200,
        "message": "ok",
        "sessions": app.sessions.list_sessions(),
    })))
}

async fn event_stats(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    require_api_key(&headers, &app.config.secret_key)?;
    Ok(Json(serde_json::json!({
        "code": 200,
        "message": "ok",
        "events": app.event_bus.stats().snapshot(),
    })))
}

// ── Inbound calls ──────────────────────────────────────────────────

async fn new_call(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<channels::NewCallResponse>, GatewayError> {
    let request = parse_json(&body)?;
    let response = wati::handle_new_call(&app, request, ChannelType::Whatsapp).await?;
    Ok(Json(response))
}

async fn web_new_call(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<channels::NewCallResponse>, GatewayError> {
    let request = parse_json(&body)?;
    let response = wati::handle_new_call(&app, request, ChannelType::Web).await?;
    Ok(Json(response))
}

async fn test_new_call(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<channels::NewCallResponse>, GatewayError> {
    let request = parse_json(&body)?;
    let response = wati::handle_new_call(&app, request, ChannelType::Test).await?;
    Ok(Json(response))
}

/// Termination is best-effort: unknown ids still return 200.
async fn terminate_call(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let request: channels::TerminateCallRequest = parse_json(&body)?;
    wati::handle_terminate(
        &app,
        request.connection_id.as_deref(),
        request.call_id.as_deref(),
    )
    .await;
    Ok(Json(ok_body("Call terminated")))
}

// ── Outbound ───────────────────────────────────────────────────────

async fn outbound_initiate(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<channels::OutboundInitiateResponse>, GatewayError> {
    let request = parse_json(&body)?;
    let response = channels::outbound::handle_initiate(&app, request, false).await?;
    Ok(Json(response))
}

async fn outbound_initiate_prod(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<channels::OutboundInitiateResponse>, GatewayError> {
    let request = parse_json(&body)?;
    let response = channels::outbound::handle_initiate(&app, request, true).await?;
    Ok(Json(response))
}

async fn outbound_permission(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let webhook: channels::PermissionWebhook = parse_json(&body)?;
    let response =
        channels::outbound::handle_permission_webhook(&app, &webhook.waid, webhook.has_permission)
            .await?;
    Ok(Json(response))
}

async fn outbound_sdp_answer(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let webhook: channels::SdpAnswerWebhook = parse_json(&body)?;
    channels::outbound::handle_sdp_answer_webhook(&app, &webhook.call_id, &webhook.sdp).await?;
    Ok(Json(ok_body("answer applied")))
}

async fn outbound_call_status(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let webhook: channels::CallStatusWebhook = parse_json(&body)?;
    channels::outbound::handle_call_status_webhook(&app, &webhook.call_id, &webhook.status).await?;
    Ok(Json(ok_body("status applied")))
}

// ── Management webhooks ────────────────────────────────────────────

async fn provider_webhook(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, GatewayError> {
    if let Some(secret) = &app.config.wati.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        match signature {
            None => {
                // Missing signature is tolerated (some provider events are
                // unsigned) but noted.
                tracing::warn!("provider webhook without X-Hub-Signature-256");
            }
            Some(signature) => {
                if !auth::verify_hub_signature(secret, &body, signature) {
                    return Err(GatewayError::Authorization(
                        "invalid webhook signature".into(),
                    ));
                }
            }
        }
    }
    let webhook: wati::ProviderWebhook = parse_json(&body)?;
    wati::handle_provider_webhook(&app, webhook).await;
    Ok(Json(ok_body("ok")))
}

async fn livekit_webhook(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let payload: serde_json::Value = parse_json(&body)?;
    channels::livekit::handle_webhook(&app, &payload).await;
    Ok(Json(ok_body("ok")))
}

// ── LiveKit ────────────────────────────────────────────────────────

async fn livekit_create_room(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<channels::CreateRoomResponse>, GatewayError> {
    let request = parse_json(&body)?;
    let response = channels::livekit::handle_create_room(&app, request).await?;
    Ok(Json(response))
}

async fn livekit_join_room(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let request = parse_json(&body)?;
    let response = channels::livekit::handle_join_room(&app, request).await?;
    Ok(Json(response))
}

async fn livekit_end_call(
    State(app): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let request: channels::EndCallRequest = parse_json(&body)?;
    channels::livekit::handle_end_call(
        &app,
        request.connection_id.as_deref(),
        request.room_name.as_deref(),
    )
    .await;
    Ok(Json(ok_body("Call ended")))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_reports_protocol_error() {
        let err = parse_json::<channels::CallStatusWebhook>(&Bytes::from_static(b"not json"))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn parse_json_accepts_valid_payload() {
        let webhook: channels::CallStatusWebhook =
            parse_json(&Bytes::from_static(br#"{"callId":"C1","status":"RINGING"}"#)).unwrap();
        assert_eq!(webhook.call_id, "C1");
    }

    #[test]
    fn api_key_guard_rejects_missing_header() {
        let headers = HeaderMap::new();
        let err = require_api_key(&headers, "secret").unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn body_limit_covers_large_sdp() {
        // A WhatsApp SDP offer with many candidates runs a few KB; the
        // limit leaves generous headroom without being unbounded.
        assert!(MAX_BODY_SIZE >= 64 * 1024);
        assert!(MAX_BODY_SIZE <= 1024 * 1024);
    }
}
