use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{handlers, installs, middleware::metrics_middleware, ws};
use crate::metrics::metrics_handler;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::new()
        // Health and config
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        // Installs
        .route(
            "/installs",
            post(installs::create_install).get(installs::list_installs),
        )
        .route(
            "/installs/{id}",
            get(installs::get_install).delete(installs::cancel_install),
        )
        .route("/installs/{id}/pause", post(installs::pause_install))
        .route("/installs/{id}/resume", post(installs::resume_install))
        .route("/installs/{id}/cleanup", post(installs::cleanup_install))
        // Progress stream
        .route("/ws", get(ws::ws_handler))
        .with_state(Arc::clone(&state));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}
