//! HTTP surface (spec §6): the WebSocket upgrade route plus `/healthz` and
//! `/metrics`, built on the same `AppState`/`build_router` shape and
//! hand-rendered Prometheus `/metrics` handler used across this codebase's
//! other HTTP services, generalized down to the gateway's single upgrade
//! endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use gatehouse_protocol::GatewayConfig;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::auth::ClaimsVerifier;
use crate::lifecycle::ConnectionLifecycleManager;
use crate::router::Router as GatewayRouter;

/// Lock-free counters backing `/metrics` (spec §10.5). Every field here is
/// incremented somewhere in `lifecycle.rs`, `ingress.rs`, or `session.rs` —
/// this struct owns no logic of its own, only storage.
pub struct Metrics {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub connections_active: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_ended: AtomicU64,
    pub sessions_active: AtomicU64,
    pub messages_received: AtomicU64,
    pub message_errors: AtomicU64,
    pub messages_dispatched: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub admin_assist_takeovers: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_ended: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            message_errors: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            admin_assist_takeovers: AtomicU64::new(0),
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub config: GatewayConfig,
    pub lifecycle: Arc<ConnectionLifecycleManager>,
    pub claims_verifier: Arc<dyn ClaimsVerifier>,
    /// Swappable so an embedding application can attach a real router after
    /// startup (spec §10.1 step 4 ships [`crate::router::NullRouter`]).
    pub router: RwLock<Arc<dyn GatewayRouter>>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// `GET /ws` — the gateway's only client-facing endpoint. Origin check,
/// token extraction, claims verification, and limiter admission all happen
/// here before the socket is handed to [`ConnectionLifecycleManager`].
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    authorization: Option<TypedHeader<Authorization<Bearer>>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.lifecycle.check_origin(origin) {
        state.metrics.connections_rejected.fetch_add(1, Ordering::Relaxed);
        let (status, msg) = e.response();
        return (StatusCode::from_u16(status).unwrap(), msg).into_response();
    }

    let bearer = authorization.as_ref().map(|TypedHeader(auth)| auth.token());
    let token = match state.lifecycle.extract_token(bearer, query.token.as_deref()) {
        Ok(t) => t,
        Err(e) => {
            state.metrics.connections_rejected.fetch_add(1, Ordering::Relaxed);
            let (status, msg) = e.response();
            return (StatusCode::from_u16(status).unwrap(), msg).into_response();
        }
    };

    let claims = match state.claims_verifier.verify(&token) {
        Ok(c) => c,
        Err(e) => {
            state.metrics.connections_rejected.fetch_add(1, Ordering::Relaxed);
            let (status, msg) = e.response();
            return (StatusCode::from_u16(status).unwrap(), msg).into_response();
        }
    };

    if let Err(e) = state.lifecycle.try_admit(&claims.user_id) {
        state.metrics.connections_rejected.fetch_add(1, Ordering::Relaxed);
        let (status, msg) = e.response();
        return (StatusCode::from_u16(status).unwrap(), msg).into_response();
    }

    let lifecycle = Arc::clone(&state.lifecycle);
    let router = Arc::clone(&*state.router.read().unwrap_or_else(|e| e.into_inner()));
    let metrics = Arc::clone(&state.metrics);
    ws.on_upgrade(move |socket| async move {
        lifecycle.run_connection(socket, claims, router, metrics).await;
    })
    .into_response()
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let m = &state.metrics;
    let body = format!(
        "# HELP gatehouse_connections_accepted_total Connections accepted\n\
         # TYPE gatehouse_connections_accepted_total counter\n\
         gatehouse_connections_accepted_total {}\n\
         \n\
         # HELP gatehouse_connections_rejected_total Connections rejected at upgrade\n\
         # TYPE gatehouse_connections_rejected_total counter\n\
         gatehouse_connections_rejected_total {}\n\
         \n\
         # HELP gatehouse_connections_active Currently active connections\n\
         # TYPE gatehouse_connections_active gauge\n\
         gatehouse_connections_active {}\n\
         \n\
         # HELP gatehouse_sessions_created_total Sessions created\n\
         # TYPE gatehouse_sessions_created_total counter\n\
         gatehouse_sessions_created_total {}\n\
         \n\
         # HELP gatehouse_sessions_ended_total Sessions ended\n\
         # TYPE gatehouse_sessions_ended_total counter\n\
         gatehouse_sessions_ended_total {}\n\
         \n\
         # HELP gatehouse_sessions_active Currently active sessions\n\
         # TYPE gatehouse_sessions_active gauge\n\
         gatehouse_sessions_active {}\n\
         \n\
         # HELP gatehouse_messages_received_total Inbound messages accepted by the reader\n\
         # TYPE gatehouse_messages_received_total counter\n\
         gatehouse_messages_received_total {}\n\
         \n\
         # HELP gatehouse_message_errors_total Malformed or invalid inbound messages\n\
         # TYPE gatehouse_message_errors_total counter\n\
         gatehouse_message_errors_total {}\n\
         \n\
         # HELP gatehouse_messages_dispatched_total Messages handed to the router\n\
         # TYPE gatehouse_messages_dispatched_total counter\n\
         gatehouse_messages_dispatched_total {}\n\
         \n\
         # HELP gatehouse_messages_rejected_total Messages dropped under backpressure\n\
         # TYPE gatehouse_messages_rejected_total counter\n\
         gatehouse_messages_rejected_total {}\n\
         \n\
         # HELP gatehouse_admin_assist_takeovers_total Admin-assist session takeovers\n\
         # TYPE gatehouse_admin_assist_takeovers_total counter\n\
         gatehouse_admin_assist_takeovers_total {}\n\
         \n\
         # HELP gatehouse_shutdown_in_progress Set to 1 once graceful shutdown begins\n\
         # TYPE gatehouse_shutdown_in_progress gauge\n\
         gatehouse_shutdown_in_progress {}\n",
        m.connections_accepted.load(Ordering::Relaxed),
        m.connections_rejected.load(Ordering::Relaxed),
        m.connections_active.load(Ordering::Relaxed),
        m.sessions_created.load(Ordering::Relaxed),
        m.sessions_ended.load(Ordering::Relaxed),
        m.sessions_active.load(Ordering::Relaxed),
        m.messages_received.load(Ordering::Relaxed),
        m.message_errors.load(Ordering::Relaxed),
        m.messages_dispatched.load(Ordering::Relaxed),
        m.messages_rejected.load(Ordering::Relaxed),
        m.admin_assist_takeovers.load(Ordering::Relaxed),
        state.lifecycle.is_shutting_down() as u64,
    );

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        axum::http::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "x-frame-options",
        axum::http::HeaderValue::from_static("DENY"),
    );
    headers.insert(
        "referrer-policy",
        axum::http::HeaderValue::from_static("no-referrer"),
    );
    response
}

/// Build the Axum router with all routes and ambient layers (spec §10.5).
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.lifecycle.is_open_origin() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = state
            .config
            .server
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(RequestBodyLimitLayer::new(state.config.limits.max_message_size))
        .layer(cors)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{generate_token, JwtClaimsVerifier};
    use crate::fanout::FanoutRegistry;
    use crate::limiter::ConnectionLimiter;
    use crate::router::NullRouter;
    use axum::body::Body;
    use axum::http::Request;
    use gatehouse_protocol::{HeartbeatConfig, LimitsConfig};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "test-secret-at-least-16-bytes";

    fn test_app_state() -> Arc<AppState> {
        let lifecycle = Arc::new(ConnectionLifecycleManager::new(
            Arc::new(ConnectionLimiter::new(2)),
            Arc::new(FanoutRegistry::new()),
            LimitsConfig::default(),
            HeartbeatConfig::default(),
            256,
        ));
        Arc::new(AppState {
            config: GatewayConfig::default(),
            lifecycle,
            claims_verifier: Arc::new(JwtClaimsVerifier::new(TEST_SECRET)),
            router: RwLock::new(Arc::new(NullRouter)),
            metrics: Arc::new(Metrics::default()),
            started_at: Instant::now(),
        })
    }

    fn ws_request(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .uri(uri)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(test_app_state());
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exposes_prometheus_text_format() {
        let app = build_router(test_app_state());
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("gatehouse_connections_active"));
        assert!(body.contains("# TYPE"));
    }

    #[tokio::test]
    async fn ws_upgrade_without_token_is_unauthorized() {
        let app = build_router(test_app_state());
        let request = ws_request("/ws").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_upgrade_rejects_mismatched_origin() {
        let state = test_app_state();
        state
            .lifecycle
            .set_allowed_origins(vec!["https://app.example.com".to_string()]);
        let app = build_router(state);
        let request = ws_request("/ws")
            .header("origin", "https://evil.example.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn ws_upgrade_rejects_invalid_token() {
        let app = build_router(test_app_state());
        let request = ws_request("/ws")
            .header("authorization", "Bearer not-a-real-token")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_upgrade_enforces_connection_limit() {
        let state = test_app_state();
        // The limiter in test_app_state() caps at 2 connections per user.
        assert!(state.lifecycle.try_admit("alice").is_ok());
        assert!(state.lifecycle.try_admit("alice").is_ok());

        let token = generate_token(TEST_SECRET, "alice", None, &[], 3600).unwrap();
        let app = build_router(state);
        let request = ws_request("/ws")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
