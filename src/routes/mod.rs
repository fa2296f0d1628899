//! Route modules for the upload server

pub mod health;
pub mod index;
pub mod tus;

use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Credentialed CORS for any origin, exposing the tus headers to browsers
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            tus::TUS_RESUMABLE,
            tus::UPLOAD_LENGTH,
            tus::UPLOAD_OFFSET,
            tus::UPLOAD_METADATA,
            tus::UPLOAD_DEFER_LENGTH,
            tus::UPLOAD_CONCAT,
            tus::UPLOAD_CHECKSUM,
        ])
        .expose_headers([
            header::LOCATION,
            tus::UPLOAD_OFFSET,
            tus::UPLOAD_LENGTH,
            tus::TUS_RESUMABLE,
            tus::UPLOAD_METADATA,
            tus::UPLOAD_DEFER_LENGTH,
            tus::UPLOAD_EXPIRES,
            tus::TUS_VERSION_HEADER,
            tus::TUS_EXTENSION,
            tus::TUS_MAX_SIZE,
            tus::TUS_CHECKSUM_ALGORITHM,
        ])
}

/// Build the application router: service endpoints plus one tus router per mount
pub fn app(state: AppState) -> Router {
    let max_body_bytes = state.config().uploads.max_chunk_bytes;

    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/", get(index::index))
        .with_state(state.clone());

    for mount in state.mounts() {
        app = app.merge(tus::router(mount.clone(), max_body_bytes));
    }

    app.layer(TraceLayer::new_for_http()).layer(cors_layer())
}
