//! Request-filtering firewall pipeline.
//!
//! Every request passes the same fixed sequence: ban check, rate limit,
//! inbound attack-signature scan, then the handler, then an outbound
//! data-leak scan over the response. The first stage to object wins and
//! later stages never run.

pub mod patterns;
pub mod rate_limiter;
pub mod reputation;
pub mod security_log;

use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, Request, State},
    http::{header::HeaderValue, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ConfigHandle;
use crate::metrics;
use self::rate_limiter::RateLimiter;
use self::reputation::{BanStore, ReputationStore};
use self::security_log::{ActionTaken, SecurityEvent, SecurityLogger};

/// Largest body (request or response) buffered for scanning. Responses and
/// requests with a declared length beyond the cap pass through unscanned;
/// a request body of undeclared length is refused once it exceeds the cap.
const MAX_SCAN_BODY: usize = 1024 * 1024;

const BLOCKED_BODY: &str = "Request blocked.";
const BANNED_BODY: &str = "Access denied.";
const RATE_LIMITED_BODY: &str = "Too many requests.";
const LEAK_BODY: &str = "An error occurred processing your request.";

/// Shared firewall state threaded through the middleware.
pub struct Firewall {
    pub config: ConfigHandle,
    pub limiter: RateLimiter,
    pub reputation: ReputationStore,
    pub logger: Arc<SecurityLogger>,
}

impl Firewall {
    pub fn new(config: ConfigHandle, store: Box<dyn BanStore>, logger: Arc<SecurityLogger>) -> Self {
        Self {
            config,
            limiter: RateLimiter::new(),
            reputation: ReputationStore::new(store, logger.clone()),
            logger,
        }
    }
}

pub async fn firewall_middleware(
    State(firewall): State<Arc<Firewall>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let config = firewall.config.current().await;
    let path = request.uri().path().to_string();

    if !config.enabled || config.is_path_excluded(&path) {
        return next.run(request).await;
    }

    metrics::REQUESTS_TOTAL.inc();
    let _timer = metrics::REQUEST_DURATION.start_timer();

    let ip = client_ip(request.headers(), connect_info.as_ref());
    let agent = user_agent(request.headers()).to_string();
    let method = request.method().to_string();
    let policy = config.strike_policy();

    // Stage 1: banned clients are turned away before any other work.
    if firewall
        .reputation
        .is_banned(&ip, config.ban_duration_secs)
        .await
    {
        metrics::BANNED_HITS_TOTAL.inc();
        firewall.logger.banned_access(&ip, &path);
        firewall
            .reputation
            .record_event(
                SecurityEvent::new("banned_access", &ip, &path, &method, ActionTaken::Blocked)
                    .with_user_agent(&agent),
            )
            .await;
        return fixed_response(StatusCode::FORBIDDEN, BANNED_BODY);
    }

    // Stage 2: token bucket admission.
    let admission = firewall
        .limiter
        .admit(&ip, config.rate_limit_requests, config.rate_limit_window_secs)
        .await;
    if !admission.allowed {
        metrics::RATE_LIMITED_TOTAL.inc();
        firewall
            .logger
            .rate_limit(&ip, config.rate_limit_requests, &path);
        firewall
            .reputation
            .record_strike(
                &ip,
                SecurityEvent::new("rate_limit", &ip, &path, &method, ActionTaken::Blocked)
                    .with_user_agent(&agent)
                    .with_details(&format!("limit={}", config.rate_limit_requests)),
                policy,
            )
            .await;
        let mut response = fixed_response(StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_BODY);
        set_header(&mut response, "retry-after", config.rate_limit_window_secs);
        return response;
    }

    // Stage 3: inbound attack signatures over path, query, and body.
    let request = if config.pattern_detection_enabled {
        // Scan decoded text so percent-encoding cannot hide a payload
        let decoded_path = percent_decode(&path);
        let query = decode_query(request.uri().query().unwrap_or(""));
        let (request, body_text) = match buffer_request_body(request).await {
            Ok(pair) => pair,
            Err(response) => return response,
        };

        if let Some(detection) =
            patterns::scan_request(&decoded_path, &query, body_text.as_deref())
        {
            metrics::PATTERNS_BLOCKED_TOTAL.inc();
            let kind = detection.kind.as_str();
            firewall
                .logger
                .pattern_detected(&ip, kind, &path, &detection.matched);
            firewall
                .reputation
                .record_strike(
                    &ip,
                    SecurityEvent::new(kind, &ip, &path, &method, ActionTaken::Blocked)
                        .with_user_agent(&agent)
                        .with_details(&detection.matched),
                    policy,
                )
                .await;
            return fixed_response(StatusCode::FORBIDDEN, BLOCKED_BODY);
        }
        request
    } else {
        request
    };

    // Stage 4: the handler itself.
    let response = next.run(request).await;

    // Stage 5: outbound data-leak scan on successful text-like responses.
    let mut response = if config.data_leak_detection_enabled && response.status().is_success() {
        match scan_response_body(response, config.email_exposure_threshold).await {
            Ok(response) => response,
            Err(detection) => {
                metrics::LEAKS_BLOCKED_TOTAL.inc();
                let kind = detection.kind.as_str();
                firewall
                    .logger
                    .data_leak_blocked(&ip, kind, &path, &detection.matched);
                // Leaks are a server-side fault: logged, never a strike.
                firewall
                    .reputation
                    .record_event(
                        SecurityEvent::new(kind, &ip, &path, &method, ActionTaken::Blocked)
                            .with_user_agent(&agent)
                            .with_details(&detection.matched),
                    )
                    .await;
                // The substitute still gets the telemetry headers below
                fixed_response(StatusCode::INTERNAL_SERVER_ERROR, LEAK_BODY)
            }
        }
    } else {
        response
    };

    set_header(&mut response, "x-ratelimit-limit", config.rate_limit_requests);
    set_header(&mut response, "x-ratelimit-remaining", admission.remaining);
    response
}

/// Client IP resolution: the first `X-Forwarded-For` hop, then `X-Real-IP`,
/// then the socket peer address.
fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    match connect_info {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "127.0.0.1".to_string(),
    }
}

fn percent_decode(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned()
}

/// Query strings additionally encode spaces as `+`.
fn decode_query(raw: &str) -> String {
    percent_decode(&raw.replace('+', " "))
}

fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn fixed_response(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

fn set_header(response: &mut Response, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        response.headers_mut().insert(name, value);
    }
}

/// Buffer the request body for scanning. Only a body whose declared length
/// already exceeds the cap passes through unscanned; bodies of unknown
/// length (chunked transfer-encoding included) are buffered up to the cap
/// and refused beyond it, so omitting content-length cannot sidestep the
/// scan.
async fn buffer_request_body(request: Request) -> Result<(Request, Option<String>), Response> {
    let wants_scan = matches!(request.method().as_str(), "POST" | "PUT" | "PATCH");
    if !wants_scan {
        return Ok((request, None));
    }
    let (parts, body) = request.into_parts();
    if body
        .size_hint()
        .exact()
        .is_some_and(|len| len > MAX_SCAN_BODY as u64)
    {
        return Ok((Request::from_parts(parts, body), None));
    }
    match axum::body::to_bytes(body, MAX_SCAN_BODY).await {
        Ok(bytes) if bytes.is_empty() => Ok((Request::from_parts(parts, Body::empty()), None)),
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let request = Request::from_parts(parts, Body::from(bytes));
            Ok((request, Some(text)))
        }
        Err(_) => Err(fixed_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large.",
        )),
    }
}

/// Scan a buffered response body for sensitive data. Returns the rebuilt
/// response when clean, or the detection when a leak must be suppressed.
async fn scan_response_body(
    response: Response,
    email_threshold: usize,
) -> Result<Response, patterns::Detection> {
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !is_scannable_content_type(&content_type) {
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    match body.size_hint().exact() {
        Some(len) if len > 0 && len <= MAX_SCAN_BODY as u64 => {
            match axum::body::to_bytes(body, MAX_SCAN_BODY).await {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    if let Some(detection) = patterns::scan_response(&text, email_threshold) {
                        return Err(detection);
                    }
                    Ok(Response::from_parts(parts, Body::from(bytes)))
                }
                // An unreadable body cannot leak anything, but the declared
                // length no longer holds once the body is replaced
                Err(_) => {
                    let mut response = Response::from_parts(parts, Body::empty());
                    response.headers_mut().remove("content-length");
                    Ok(response)
                }
            }
        }
        _ => Ok(Response::from_parts(parts, body)),
    }
}

fn is_scannable_content_type(content_type: &str) -> bool {
    content_type.is_empty()
        || content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/xml")
}
