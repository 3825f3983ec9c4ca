use std::any::Any;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

pub mod caption;
pub mod config;
pub mod fetch;
pub mod logging;
pub mod models;

use fetch::ImageFetcher;
use models::ErrorResponse;

/// Per-process state shared by handlers. Read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub fetcher: Arc<ImageFetcher>,
}

impl AppState {
    pub fn new(fetcher: ImageFetcher) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(caption::health))
        .route("/caption", post(caption::caption))
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "handler panicked");

    let body = ErrorResponse {
        error: "internal_error",
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_becomes_opaque_500() {
        let response = handle_panic(Box::new("secret stack detail".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
