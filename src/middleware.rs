use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request, Response, StatusCode},
    middleware::Next,
};

use crate::handlers::AppState;

/// Security headers middleware
/// Adds essential security headers to all responses
pub async fn security_headers(request: Request<Body>, next: Next) -> Response<Body> {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();

    // Prevent clickjacking
    headers.insert(
        header::HeaderName::from_static("x-frame-options"),
        header::HeaderValue::from_static("DENY"),
    );

    // Prevent MIME sniffing
    headers.insert(
        header::HeaderName::from_static("x-content-type-options"),
        header::HeaderValue::from_static("nosniff"),
    );

    // Viewer scripts and styles come from jsDelivr; panoramas are same-origin via /3d/
    headers.insert(
        header::HeaderName::from_static("content-security-policy"),
        header::HeaderValue::from_static(
            "default-src 'self'; \
             script-src 'self' https://cdn.jsdelivr.net; \
             style-src 'self' 'unsafe-inline' https://cdn.jsdelivr.net; \
             img-src 'self' data: blob:; \
             connect-src 'self'; \
             worker-src 'self' blob:; \
             frame-ancestors 'none';",
        ),
    );

    headers.insert(
        header::HeaderName::from_static("referrer-policy"),
        header::HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    headers.insert(
        header::HeaderName::from_static("permissions-policy"),
        header::HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    response
}

/// Rejects state-changing requests whose Origin is neither the public site nor localhost
pub async fn origin_check(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response<Body>, StatusCode> {
    let method = request.method().clone();
    let state_changing = method == Method::POST
        || method == Method::DELETE
        || method == Method::PUT
        || method == Method::PATCH;

    if state_changing {
        if let Some(origin) = request.headers().get(header::ORIGIN) {
            let origin_str = origin.to_str().unwrap_or("");
            if !is_allowed_origin(origin_str, &state.config.public_base_url) {
                tracing::warn!("Blocked request from origin: {}", origin_str);
                return Err(StatusCode::FORBIDDEN);
            }
        }
    }

    Ok(next.run(request).await)
}

/// `scheme://host[:port]` part of a base URL
fn origin_of(base_url: &str) -> &str {
    match base_url.find("://") {
        Some(scheme_end) => {
            let host_start = scheme_end + 3;
            match base_url[host_start..].find('/') {
                Some(path_start) => &base_url[..host_start + path_start],
                None => base_url,
            }
        }
        None => base_url,
    }
}

fn is_allowed_origin(origin: &str, public_base_url: &str) -> bool {
    let local_origins = ["http://localhost", "http://127.0.0.1"];

    origin == origin_of(public_base_url)
        || local_origins.iter().any(|&allowed| {
            origin == allowed || origin.starts_with(&format!("{}:", allowed))
        })
}
