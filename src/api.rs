use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use axum::http::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};

use crate::firewall::{firewall_middleware, reputation::BanParams, Firewall};
use crate::metrics;

/// Full service router: the firewalled application surface plus the
/// unfirewalled management plane (health, metrics, ban administration).
pub fn create_router(firewall: Arc<Firewall>) -> Router {
    let protected = Router::new()
        .route("/", get(service_info))
        // Unmatched paths pass through the firewall before the 404
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(middleware::from_fn_with_state(
            firewall.clone(),
            firewall_middleware,
        ));

    let admin = Router::new()
        .route("/v1/bans", get(list_bans))
        .route("/v1/bans", post(create_ban))
        .route("/v1/bans/:ip", get(get_ban))
        .route("/v1/bans/:ip", delete(delete_ban))
        .route("/v1/quota/:ip", get(get_quota))
        .route("/v1/quota/:ip", delete(reset_quota))
        .with_state(firewall);

    Router::new()
        .merge(protected)
        .merge(admin)
        .merge(metrics::create_metrics_router())
        .route("/health", get(health_check))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http())
}

async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "vetshield",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[derive(Debug, Deserialize)]
struct CreateBanRequest {
    ip: String,
    reason: String,
    duration_secs: Option<u64>,
    #[serde(default)]
    permanent: bool,
}

async fn list_bans(
    State(firewall): State<Arc<Firewall>>,
) -> Result<Json<Value>, StatusCode> {
    match firewall.reputation.list_bans().await {
        Ok(bans) => Ok(Json(json!({ "bans": bans }))),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn get_ban(
    State(firewall): State<Arc<Firewall>>,
    Path(ip): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match firewall.reputation.get_ban(&ip).await {
        Ok(Some(record)) => Ok(Json(json!(record))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn create_ban(
    State(firewall): State<Arc<Firewall>>,
    Json(payload): Json<CreateBanRequest>,
) -> (StatusCode, Json<Value>) {
    firewall
        .reputation
        .ban(BanParams {
            ip: &payload.ip,
            reason: &payload.reason,
            duration_secs: payload.duration_secs,
            permanent: payload.permanent,
            auto_banned: false,
            strike_count: 0,
            last_request_path: "",
            last_user_agent: "",
        })
        .await;
    (
        StatusCode::CREATED,
        Json(json!({ "ip": payload.ip, "banned": true })),
    )
}

async fn get_quota(
    State(firewall): State<Arc<Firewall>>,
    Path(ip): Path<String>,
) -> Json<Value> {
    let config = firewall.config.current().await;
    let remaining = firewall
        .limiter
        .remaining(&ip, config.rate_limit_requests, config.rate_limit_window_secs)
        .await;
    Json(json!({
        "ip": ip,
        "limit": config.rate_limit_requests,
        "remaining": remaining,
        "window_secs": config.rate_limit_window_secs,
    }))
}

async fn reset_quota(
    State(firewall): State<Arc<Firewall>>,
    Path(ip): Path<String>,
) -> StatusCode {
    firewall.limiter.reset(&ip).await;
    StatusCode::NO_CONTENT
}

async fn delete_ban(
    State(firewall): State<Arc<Firewall>>,
    Path(ip): Path<String>,
) -> StatusCode {
    match firewall.reputation.unban(&ip).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
