pub mod handlers;

use crate::state::AppState;
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/api/health", get(handlers::health_handler))
        .route("/api/videos", get(handlers::list_videos))
        .route("/video/{*path}", get(handlers::stream_video))
        .route("/subs/{*path}", get(handlers::stream_subtitle))
        .layer(cors_layer())
        .with_state(state)
}

/// The browser front-end is served from a different origin (static pages), so
/// every response carries permissive CORS headers and the range headers are
/// exposed for the video element.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::RANGE, header::CONTENT_TYPE])
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::ACCEPT_RANGES,
        ])
}
