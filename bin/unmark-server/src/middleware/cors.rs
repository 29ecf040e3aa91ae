use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};

/// Restrict to the configured comma separated origins, or allow any origin
/// when none are configured (or none parse).
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new().allow_headers(Any).allow_methods(Any);

    let origins: Vec<HeaderValue> = origins
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if origins.is_empty() {
        base.allow_origin(Any)
    } else {
        base.allow_origin(origins)
    }
}
