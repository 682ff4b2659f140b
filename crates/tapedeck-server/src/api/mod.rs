mod recordings;
mod sessions;

pub use sessions::RECORDING_ID_HEADER;

use crate::state::AppState;
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([HeaderName::from_static(RECORDING_ID_HEADER)])
}

pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        // Liveness
        .route("/", get(|| async { "Hello, World!" }))
        // Recording a publishing peer
        .route("/", post(sessions::ingest))
        // Replaying to a viewing peer
        .route("/video", post(sessions::playback))
        .route("/getFiles", get(recordings::list_recordings))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
