//! Transport-level Tower layers for the HTTP surface.

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

const REQUEST_ID: &str = "x-request-id";

/// Wraps `router` in the standard layers.
///
/// Each `.layer` call wraps everything before it, so requests pass through
/// them bottom-up: request id assignment, tracing, compression, CORS,
/// timeout, then request id propagation onto the response.
pub fn with_http_layers<S>(router: Router<S>, config: &NetworkConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let x_request_id = HeaderName::from_static(REQUEST_ID);
    router
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(cors_layer(&config.cors_origins))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
}

/// `"*"` allows any origin; otherwise unparseable origins are skipped.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::HEAD])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::routing::get;

    use super::*;

    #[test]
    fn layers_apply_with_defaults() {
        let router: Router = Router::new().route("/", get(|| async { "ok" }));
        let _router = with_http_layers(router, &NetworkConfig::default());
    }

    #[test]
    fn layers_apply_with_origin_list_and_timeout() {
        let config = NetworkConfig {
            cors_origins: vec![
                "https://admin.example.com".to_string(),
                "not a url".to_string(),
            ],
            request_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        };
        let router: Router = Router::new().route("/", get(|| async { "ok" }));
        let _router = with_http_layers(router, &config);
    }
}
