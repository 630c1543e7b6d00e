use axum::{http::StatusCode, response::Response, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

// Global firewall metrics
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();

    registry.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
    registry
        .register(Box::new(REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(RATE_LIMITED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(PATTERNS_BLOCKED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(LEAKS_BLOCKED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(BANNED_HITS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(BANS_ISSUED_TOTAL.clone()))
        .unwrap();

    registry
});

pub static REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "vetshield_requests_total",
        "Total requests inspected by the firewall",
    )
    .expect("metric can be created")
});

pub static REQUEST_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "vetshield_request_duration_seconds",
            "End-to-end request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
    )
    .expect("metric can be created")
});

pub static RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "vetshield_rate_limited_total",
        "Requests rejected by the rate limiter",
    )
    .expect("metric can be created")
});

pub static PATTERNS_BLOCKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "vetshield_patterns_blocked_total",
        "Requests blocked by inbound attack signatures",
    )
    .expect("metric can be created")
});

pub static LEAKS_BLOCKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "vetshield_leaks_blocked_total",
        "Responses substituted by the outbound data-leak scanner",
    )
    .expect("metric can be created")
});

pub static BANNED_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "vetshield_banned_hits_total",
        "Requests rejected because the client IP is banned",
    )
    .expect("metric can be created")
});

pub static BANS_ISSUED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("vetshield_bans_issued_total", "IP bans issued").expect("metric can be created")
});

pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> Result<Response<String>, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(output) => {
            let response = Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4")
                .body(output)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Ok(response)
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_renders_text_format() {
        Lazy::force(&REGISTRY);
        REQUESTS_TOTAL.inc();
        let response = metrics_handler().await.unwrap();
        assert!(response.body().contains("vetshield_requests_total"));
    }
}
